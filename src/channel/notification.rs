use crate::buffer::EventBatch;
use crate::domain::{EventSendType, EventsDiscardedReason, SendRequestReason, TelemetryItem};

/// Why the HTTP manager is reporting a set of batches back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReason {
    /// The batches are about to go on the wire.
    Sending(SendRequestReason),
    /// The collector accepted the batches.
    Complete,
    /// Transient failure; hand the events back to the queues.
    Requeue,
    /// Permanent failure with the given status.
    ResponseFailure(u16),
    Discarded(EventsDiscardedReason),
}

/// Owner-side handler a [`NotificationReason`] is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    Sending,
    Sent,
    Drop,
    Requeue,
    ResponseFailure,
}

impl NotificationReason {
    pub fn action(self) -> NotificationAction {
        match self {
            NotificationReason::Sending(_) => NotificationAction::Sending,
            NotificationReason::Complete => NotificationAction::Sent,
            NotificationReason::Requeue => NotificationAction::Requeue,
            NotificationReason::ResponseFailure(_) => NotificationAction::ResponseFailure,
            NotificationReason::Discarded(_) => NotificationAction::Drop,
        }
    }
}

/// Receives the channel's outward-facing telemetry lifecycle events.
///
/// All methods default to no-ops so sinks implement only what they observe. Sinks are never
/// called while channel locks are held, so they may call back into the channel.
pub trait NotificationSink: Send + Sync {
    fn events_send_request(&self, _events: &[TelemetryItem], _reason: SendRequestReason, _is_sync: bool) {}

    fn events_sent(&self, _events: &[TelemetryItem]) {}

    fn events_discarded(&self, _events: &[TelemetryItem], _reason: EventsDiscardedReason) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {}

/// Callbacks from the HTTP manager into the channel that owns it.
pub trait ChannelHooks: Send + Sync {
    fn batch_notification(
        &self,
        batches: Vec<EventBatch>,
        reason: NotificationReason,
        send_type: EventSendType,
    );

    /// Retries for a payload are exhausted; slow the scheduling cadence down.
    fn back_off_transmission(&self);

    /// A batched send succeeded; restore the normal cadence.
    fn clear_back_off(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_reason_maps_to_one_action() {
        let cases = [
            (
                NotificationReason::Sending(SendRequestReason::ManualFlush),
                NotificationAction::Sending,
            ),
            (NotificationReason::Complete, NotificationAction::Sent),
            (NotificationReason::Requeue, NotificationAction::Requeue),
            (
                NotificationReason::ResponseFailure(400),
                NotificationAction::ResponseFailure,
            ),
            (
                NotificationReason::Discarded(EventsDiscardedReason::KillSwitch),
                NotificationAction::Drop,
            ),
        ];
        for (reason, action) in cases {
            assert_eq!(reason.action(), action);
        }
    }
}
