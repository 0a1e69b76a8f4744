use rand::Rng;
use std::time::Duration;

const BASE_BACKOFF_MS: f64 = 3000.0;
const RANDOMIZATION_LOWER_THRESHOLD: f64 = 0.8;
const RANDOMIZATION_UPPER_THRESHOLD: f64 = 1.2;

/// Ceiling applied to every computed backoff, regardless of retry count.
pub const MAX_BACKOFF_MS: u64 = 600_000;

/// Stateless retry decisions shared by payload retries and channel-level backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Whether a response status is worth retrying.
    ///
    /// Client errors are permanent except 408 (timeout) and 429 (throttled); 501 and 505 are
    /// permanent server errors. Everything else, including the transport-level 0, is transient.
    pub fn should_retry_for_status(status: u16) -> bool {
        !((300..500).contains(&status) && status != 408 && status != 429
            || status == 501
            || status == 505)
    }

    /// Exponential backoff with jitter: `2^retries * rand[2400, 3600)` ms, capped at
    /// [`MAX_BACKOFF_MS`].
    pub fn millis_to_backoff_for_retry(retries_so_far: u32) -> u64 {
        let min_backoff = (BASE_BACKOFF_MS * RANDOMIZATION_LOWER_THRESHOLD) as u64;
        let max_backoff = (BASE_BACKOFF_MS * RANDOMIZATION_UPPER_THRESHOLD) as u64;
        let random_backoff = rand::rng().random_range(min_backoff..max_backoff);

        2u64.checked_pow(retries_so_far)
            .and_then(|factor| factor.checked_mul(random_backoff))
            .map_or(MAX_BACKOFF_MS, |wait| wait.min(MAX_BACKOFF_MS))
    }

    pub fn backoff_for_retry(retries_so_far: u32) -> Duration {
        Duration::from_millis(Self::millis_to_backoff_for_retry(retries_so_far))
    }
}
