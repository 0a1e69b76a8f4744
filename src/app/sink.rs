use crate::channel::NotificationSink;
use crate::domain::{EventsDiscardedReason, SendRequestReason, TelemetryItem};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Notification sink for the binary: logs every lifecycle event and keeps running totals.
#[derive(Debug, Default)]
pub struct LoggingSink {
    requested: AtomicUsize,
    sent: AtomicUsize,
    discarded: AtomicUsize,
}

/// Event totals observed by a [`LoggingSink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryTotals {
    pub requested: usize,
    pub sent: usize,
    pub discarded: usize,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> DeliveryTotals {
        DeliveryTotals {
            requested: self.requested.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl NotificationSink for LoggingSink {
    fn events_send_request(&self, events: &[TelemetryItem], reason: SendRequestReason, is_sync: bool) {
        self.requested.fetch_add(events.len(), Ordering::Relaxed);
        debug!(
            "Sending {} events (reason={}, sync={})",
            events.len(),
            reason,
            is_sync
        );
    }

    fn events_sent(&self, events: &[TelemetryItem]) {
        self.sent.fetch_add(events.len(), Ordering::Relaxed);
        info!("Collector accepted {} events", events.len());
    }

    fn events_discarded(&self, events: &[TelemetryItem], reason: EventsDiscardedReason) {
        self.discarded.fetch_add(events.len(), Ordering::Relaxed);
        warn!("Discarded {} events: {}", events.len(), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let sink = LoggingSink::new();
        let events = vec![TelemetryItem::new("a", "t"), TelemetryItem::new("b", "t")];

        sink.events_send_request(&events, SendRequestReason::NormalSchedule, false);
        sink.events_sent(&events);
        sink.events_discarded(&events[..1], EventsDiscardedReason::QueueFull);

        assert_eq!(
            sink.totals(),
            DeliveryTotals {
                requested: 2,
                sent: 2,
                discarded: 1,
            }
        );
    }
}
