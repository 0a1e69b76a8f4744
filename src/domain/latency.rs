use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority class of an event. Higher values are flushed sooner.
///
/// The derived ordering follows urgency: `Normal < CostDeferred < RealTime < Immediate`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventLatency {
    #[default]
    Normal,
    CostDeferred,
    RealTime,
    Immediate,
}

impl EventLatency {
    /// All tiers, most urgent first.
    pub const DESCENDING: [EventLatency; 4] = [
        EventLatency::Immediate,
        EventLatency::RealTime,
        EventLatency::CostDeferred,
        EventLatency::Normal,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            EventLatency::Normal => 0,
            EventLatency::CostDeferred => 1,
            EventLatency::RealTime => 2,
            EventLatency::Immediate => 3,
        }
    }

    /// Tiers at or above `self`, most urgent first.
    pub fn and_above(self) -> impl Iterator<Item = EventLatency> {
        Self::DESCENDING.into_iter().filter(move |l| *l >= self)
    }

    /// Tiers from `self` up to and including `upper`, least urgent first.
    pub fn up_to(self, upper: EventLatency) -> impl Iterator<Item = EventLatency> {
        Self::DESCENDING
            .into_iter()
            .rev()
            .filter(move |l| *l >= self && *l <= upper)
    }
}

/// How a payload is handed to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSendType {
    /// Ordinary async send, admission-gated and counted as outstanding.
    Batched,
    /// Caller does not wait for the response; bypasses connection limits.
    Synchronous,
    /// Fire-and-forget beacon used while the host is going away.
    SendBeacon,
    /// Keep-alive fetch used while the host is going away.
    SyncFetch,
}

impl EventSendType {
    pub fn is_beacon(self) -> bool {
        matches!(self, EventSendType::SendBeacon | EventSendType::SyncFetch)
    }
}

/// Why a send cycle was started. Ordered so that the most significant reason wins when
/// deferred requests are merged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SendRequestReason {
    #[default]
    Undefined,
    NormalSchedule,
    Response,
    Resumed,
    Retry,
    ManualFlush,
    MaxQueuedEvents,
    SyncEvent,
    Unload,
    SdkUnload,
}

impl SendRequestReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendRequestReason::Undefined => "undefined",
            SendRequestReason::NormalSchedule => "normal_schedule",
            SendRequestReason::Response => "response",
            SendRequestReason::Resumed => "resumed",
            SendRequestReason::Retry => "retry",
            SendRequestReason::ManualFlush => "manual_flush",
            SendRequestReason::MaxQueuedEvents => "max_queued_events",
            SendRequestReason::SyncEvent => "sync_event",
            SendRequestReason::Unload => "unload",
            SendRequestReason::SdkUnload => "sdk_unload",
        }
    }
}

impl fmt::Display for SendRequestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code attached to every `eventsDiscarded` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventsDiscardedReason {
    Unknown,
    NonRetryableStatus,
    InvalidEvent,
    SizeLimitExceeded,
    KillSwitch,
    QueueFull,
    /// The collector rejected the request with this status.
    ResponseFailure(u16),
}

impl fmt::Display for EventsDiscardedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventsDiscardedReason::Unknown => "unknown",
            EventsDiscardedReason::NonRetryableStatus => "non_retryable_status",
            EventsDiscardedReason::InvalidEvent => "invalid_event",
            EventsDiscardedReason::SizeLimitExceeded => "size_limit_exceeded",
            EventsDiscardedReason::KillSwitch => "kill_switch",
            EventsDiscardedReason::QueueFull => "queue_full",
            EventsDiscardedReason::ResponseFailure(status) => {
                return write!(f, "response_failure_{status}");
            }
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ordering() {
        assert!(EventLatency::Immediate > EventLatency::RealTime);
        assert!(EventLatency::RealTime > EventLatency::CostDeferred);
        assert!(EventLatency::CostDeferred > EventLatency::Normal);
    }

    #[test]
    fn test_and_above_is_most_urgent_first() {
        let tiers: Vec<_> = EventLatency::RealTime.and_above().collect();
        assert_eq!(tiers, vec![EventLatency::Immediate, EventLatency::RealTime]);
    }

    #[test]
    fn test_up_to_is_least_urgent_first() {
        let tiers: Vec<_> = EventLatency::Normal.up_to(EventLatency::RealTime).collect();
        assert_eq!(
            tiers,
            vec![
                EventLatency::Normal,
                EventLatency::CostDeferred,
                EventLatency::RealTime
            ]
        );
    }

    #[test]
    fn test_discard_reason_display_keeps_status() {
        assert_eq!(EventsDiscardedReason::QueueFull.to_string(), "queue_full");
        assert_eq!(
            EventsDiscardedReason::ResponseFailure(403).to_string(),
            "response_failure_403"
        );
    }

    #[test]
    fn test_beacon_send_types() {
        assert!(EventSendType::SendBeacon.is_beacon());
        assert!(EventSendType::SyncFetch.is_beacon());
        assert!(!EventSendType::Batched.is_beacon());
        assert!(!EventSendType::Synchronous.is_beacon());
    }
}
