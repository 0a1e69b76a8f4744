use std::time::Duration;
use tokio::task::JoinHandle;

/// A cancelable one-shot timer.
///
/// Each arming bumps a generation id that is passed to the callback. The owner checks it with
/// [`TimerSlot::fire`] under its own lock, so a callback that lost a race with
/// [`TimerSlot::cancel`] is ignored.
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn arm<F>(&mut self, delay: Duration, on_fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation);
        }));
    }

    /// Claims a firing. Returns `false` when `generation` is stale.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.handle.is_none() || generation != self.generation {
            return false;
        }
        self.handle = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }

    /// Cancels a pending timer, returning whether one was active.
    pub fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fire_claims_current_generation_once() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let mut slot = TimerSlot::default();

        let recorded = seen.clone();
        slot.arm(Duration::from_millis(10), move |generation| {
            recorded.store(generation, Ordering::SeqCst);
        });
        assert!(slot.is_active());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let generation = seen.load(Ordering::SeqCst);
        assert!(slot.fire(generation));
        assert!(!slot.is_active());
        assert!(!slot.fire(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_invalidates_pending_callback() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut slot = TimerSlot::default();

        let counter = fired.clone();
        slot.arm(Duration::from_millis(10), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(slot.cancel());
        assert!(!slot.cancel());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
