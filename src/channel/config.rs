use crate::app::config::serde_helpers::optional_millis;
use crate::domain::ChannelError;
use crate::sender::TransportType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const REAL_TIME: &str = "REAL_TIME";
pub const NEAR_REAL_TIME: &str = "NEAR_REAL_TIME";
pub const BEST_EFFORT: &str = "BEST_EFFORT";

pub const DEFAULT_EVENTS_LIMIT_IN_MEM: usize = 10_000;
pub const DEFAULT_IMMEDIATE_EVENT_LIMIT: usize = 500;
pub const DEFAULT_MAX_CONNECTIONS: usize = 2;
pub const DEFAULT_MAX_EVENT_RETRY_ATTEMPTS: u32 = 6;
pub const DEFAULT_MAX_UNLOAD_EVENT_RETRY_ATTEMPTS: u32 = 2;
pub const DEFAULT_MAX_REQUEST_RETRIES_BEFORE_BACKOFF: u32 = 1;
pub const MAX_BACKOFF_COUNT: u32 = 4;
/// Seconds between idle checks while an async flush waits for the HTTP manager.
pub const FLUSH_IDLE_POLL_SECS: f64 = 0.25;

/// Settings for a [`PostChannel`](super::PostChannel) and the HTTP manager it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Collector endpoint without query string.
    pub endpoint_url: String,

    pub events_limit_in_mem: usize,
    pub immediate_event_limit: usize,
    /// Async flush once the non-immediate queue holds more than this many events. `0` disables.
    pub auto_flush_events_limit: usize,
    /// Async flush once a single tenant batch reaches this many events. `0` disables.
    pub auto_flush_batch_limit: usize,
    /// Largest tenant batch kept in a queue before a new one is started. `0` is unlimited.
    pub max_batch_items: usize,
    pub max_events_per_batch: usize,
    pub events_dropped_at_once: usize,

    pub max_connections: usize,
    pub max_request_retries_before_backoff: u32,
    pub max_event_retry_attempts: u32,
    pub max_unload_event_retry_attempts: u32,

    pub transmit_profile: String,
    /// Custom profiles as `[normal, real_time, immediate]` seconds.
    pub transmit_profiles: BTreeMap<String, Vec<i64>>,

    pub transports: Vec<TransportType>,
    pub unload_transports: Vec<TransportType>,
    pub always_use_xhr_override: bool,
    #[serde(with = "optional_millis")]
    pub xhr_timeout: Option<Duration>,
    pub disable_xhr_sync: bool,
    pub disable_fetch_keep_alive: bool,
    /// Carry collector values in the query string instead of headers.
    pub avoid_options: bool,
    pub add_no_response: bool,

    pub headers: BTreeMap<String, String>,
    pub query_string_parameters: BTreeMap<String, String>,

    pub enable_event_timings: bool,
    pub disable_telemetry: bool,
    pub override_instrumentation_key: Option<String>,
    /// Storage-backed retry exists elsewhere, so beacon leftovers are not reported as dropped.
    pub persistent_storage: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "https://collector.localhost/OneCollector/1.0/".to_string(),
            events_limit_in_mem: DEFAULT_EVENTS_LIMIT_IN_MEM,
            immediate_event_limit: DEFAULT_IMMEDIATE_EVENT_LIMIT,
            auto_flush_events_limit: 0,
            auto_flush_batch_limit: 0,
            max_batch_items: 0,
            max_events_per_batch: crate::sender::serialization::DEFAULT_MAX_EVENTS_PER_BATCH,
            events_dropped_at_once: 1,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_request_retries_before_backoff: DEFAULT_MAX_REQUEST_RETRIES_BEFORE_BACKOFF,
            max_event_retry_attempts: DEFAULT_MAX_EVENT_RETRY_ATTEMPTS,
            max_unload_event_retry_attempts: DEFAULT_MAX_UNLOAD_EVENT_RETRY_ATTEMPTS,
            transmit_profile: REAL_TIME.to_string(),
            transmit_profiles: BTreeMap::new(),
            transports: vec![TransportType::Xhr, TransportType::Fetch, TransportType::Beacon],
            unload_transports: Vec::new(),
            always_use_xhr_override: false,
            xhr_timeout: None,
            disable_xhr_sync: false,
            disable_fetch_keep_alive: false,
            avoid_options: true,
            add_no_response: true,
            headers: BTreeMap::new(),
            query_string_parameters: BTreeMap::new(),
            enable_event_timings: false,
            disable_telemetry: false,
            override_instrumentation_key: None,
            persistent_storage: false,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ChannelError> {
        url::Url::parse(&self.endpoint_url).map_err(|e| {
            ChannelError::Config(format!("Invalid endpoint URL '{}': {}", self.endpoint_url, e))
        })?;

        let non_zero = [
            ("events_limit_in_mem", self.events_limit_in_mem),
            ("immediate_event_limit", self.immediate_event_limit),
            ("max_events_per_batch", self.max_events_per_batch),
            ("max_connections", self.max_connections),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ChannelError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.transports.is_empty() {
            return Err(ChannelError::Config("At least one transport is required".to_string()));
        }

        let profiles = TransmitProfiles::with_custom(&self.transmit_profiles);
        if !profiles.contains(&self.transmit_profile) {
            return Err(ChannelError::Config(format!(
                "Unknown transmit profile: {}",
                self.transmit_profile
            )));
        }

        Ok(())
    }
}

/// Timer cadences keyed by profile name, each `[normal, real_time, immediate]` in seconds.
/// A negative value disables that timer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmitProfiles {
    profiles: BTreeMap<String, [i64; 3]>,
}

impl Default for TransmitProfiles {
    fn default() -> Self {
        let profiles = BTreeMap::from([
            (REAL_TIME.to_string(), [2, 1, 0]),
            (NEAR_REAL_TIME.to_string(), [6, 3, 0]),
            (BEST_EFFORT.to_string(), [18, 9, 0]),
        ]);
        Self { profiles }
    }
}

impl TransmitProfiles {
    /// Built-in profiles plus normalized custom ones. Entries with fewer than two values are
    /// ignored.
    pub fn with_custom(custom: &BTreeMap<String, Vec<i64>>) -> Self {
        let mut profiles = Self::default();
        for (name, values) in custom {
            if let Some(profile) = normalize_profile(values) {
                profiles.profiles.insert(name.clone(), profile);
            }
        }
        profiles
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<[i64; 3]> {
        self.profiles.get(name).copied()
    }
}

fn normalize_profile(values: &[i64]) -> Option<[i64; 3]> {
    let (mut normal, real_time) = match values {
        [normal, real_time, ..] => (*normal, *real_time),
        _ => return None,
    };
    let mut immediate = values.get(2).copied().unwrap_or(0);

    // Lower latencies never send when a higher one is disabled.
    if real_time < 0 {
        normal = -1;
    }

    // The normal cadence must be a whole multiple of the real-time one.
    if real_time > 0 && normal > 0 {
        normal = ((normal + real_time - 1) / real_time) * real_time;
    }

    if immediate >= 0 && real_time >= 0 && immediate > real_time {
        immediate = real_time;
    }

    Some([normal, real_time, immediate])
}
