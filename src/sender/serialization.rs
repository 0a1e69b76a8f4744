use crate::buffer::EventBatch;
use crate::domain::{EventSendType, SendRequestReason, TelemetryItem};
use std::io::Write;
use thiserror::Error;
use tracing::warn;

/// Ceiling for an ordinary request body.
pub const MAX_REQUEST_SIZE: usize = 3_984_588;
/// Ceiling for beacon and keep-alive bodies.
pub const MAX_REDUCED_REQUEST_SIZE: usize = 65_000;
/// Ceiling for a single serialized event.
pub const MAX_EVENT_SIZE: usize = 2_936_012;
pub const DEFAULT_MAX_EVENTS_PER_BATCH: usize = 500;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error during serialization: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Event is missing a name or tenant key")]
    InvalidEvent,
}

/// Result of offering a batch to a payload.
#[derive(Debug)]
pub enum PayloadAppend {
    /// Some or all events were packed. Anything that did not fit is in `payload.overflow`.
    Added,
    /// Nothing was packed; the batch is handed back untouched for a fresh payload.
    DidNotFit(EventBatch),
}

/// One request body plus the batches whose events it carries.
#[derive(Debug)]
pub struct SerializedPayload {
    blob: Vec<u8>,
    max_size: usize,
    pub batches: Vec<EventBatch>,
    pub api_keys: Vec<String>,
    pub num_events: usize,
    pub retry_count: u32,
    pub is_teardown: bool,
    pub is_sync: bool,
    pub is_beacon: bool,
    pub send_type: EventSendType,
    pub send_reason: SendRequestReason,
    pub overflow: Option<EventBatch>,
    pub size_exceeded: Vec<EventBatch>,
    pub failed_events: Vec<EventBatch>,
}

impl SerializedPayload {
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn has_data(&self) -> bool {
        !self.blob.is_empty()
    }

    pub(crate) fn take_blob(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.blob)
    }

    /// The first correlation cookie found on any packed batch.
    pub fn msfpc(&self) -> Option<&str> {
        self.batches.iter().find_map(EventBatch::msfpc)
    }
}

/// Packs event batches into newline-delimited JSON payloads under the active size ceiling.
#[derive(Debug, Clone)]
pub struct Serializer {
    max_request_size: usize,
    max_reduced_size: usize,
    max_event_size: usize,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer {
    pub fn new() -> Self {
        Self::with_limits(MAX_REQUEST_SIZE, MAX_REDUCED_REQUEST_SIZE, MAX_EVENT_SIZE)
    }

    pub fn with_limits(max_request_size: usize, max_reduced_size: usize, max_event_size: usize) -> Self {
        Self {
            max_request_size,
            max_reduced_size,
            max_event_size,
        }
    }

    pub fn create_payload(
        &self,
        retry_count: u32,
        is_teardown: bool,
        is_sync: bool,
        is_reduced_payload: bool,
        send_reason: SendRequestReason,
        send_type: EventSendType,
    ) -> SerializedPayload {
        let max_size = if is_reduced_payload {
            self.max_reduced_size
        } else {
            self.max_request_size
        };

        SerializedPayload {
            blob: Vec::new(),
            max_size,
            batches: Vec::new(),
            api_keys: Vec::new(),
            num_events: 0,
            retry_count,
            is_teardown,
            is_sync,
            is_beacon: is_reduced_payload,
            send_type,
            send_reason,
            overflow: None,
            size_exceeded: Vec::new(),
            failed_events: Vec::new(),
        }
    }

    /// Greedily packs events from the front of `batch` into `payload`.
    ///
    /// Events that cannot be serialized move to `failed_events`; events larger than the
    /// per-event ceiling move to `size_exceeded`. When the payload fills up partway through the
    /// batch, the unsent tail becomes `payload.overflow`. A batch that cannot contribute a single
    /// event to a non-empty payload is returned as [`PayloadAppend::DidNotFit`].
    pub fn append_payload(
        &self,
        payload: &mut SerializedPayload,
        mut batch: EventBatch,
        max_events_per_batch: usize,
    ) -> PayloadAppend {
        if payload.overflow.is_some() {
            return PayloadAppend::DidNotFit(batch);
        }

        let max_events = max_events_per_batch.max(1);
        let max_event_size = self.max_event_size.min(payload.max_size);
        let mut packed = 0;
        let mut index = 0;

        while index < batch.count() {
            if payload.num_events >= max_events {
                break;
            }

            let blob = match self.event_blob(&batch.events()[index]) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!("Dropping event that failed to serialize: {}", e);
                    payload.failed_events.push(batch.split(index, Some(1)));
                    continue;
                }
            };

            if blob.len() > max_event_size {
                warn!(
                    "Dropping {} byte event that exceeds the {} byte limit",
                    blob.len(),
                    max_event_size
                );
                payload.size_exceeded.push(batch.split(index, Some(1)));
                continue;
            }

            let separator = usize::from(!payload.blob.is_empty());
            if payload.blob.len() + separator + blob.len() > payload.max_size {
                break;
            }

            if separator == 1 {
                payload.blob.push(b'\n');
            }
            payload.blob.extend_from_slice(&blob);
            payload.num_events += 1;
            packed += 1;
            index += 1;
        }

        if packed == 0 && index < batch.count() {
            // Only reachable for a payload that already holds events.
            return PayloadAppend::DidNotFit(batch);
        }

        if index < batch.count() {
            payload.overflow = Some(batch.split(index, None));
        }

        if !batch.is_empty() {
            if !payload.api_keys.iter().any(|key| key == batch.tenant_key()) {
                payload.api_keys.push(batch.tenant_key().to_string());
            }
            payload.batches.push(batch);
        }

        PayloadAppend::Added
    }

    /// Serializes one event as a compact JSON object.
    pub fn event_blob(&self, item: &TelemetryItem) -> Result<Vec<u8>, SerializationError> {
        if !item.is_valid() {
            return Err(SerializationError::InvalidEvent);
        }

        let mut buffer = Vec::with_capacity(256);
        serde_json::to_writer(&mut buffer, item)?;
        buffer.flush()?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(tenant: &str, n: usize) -> EventBatch {
        EventBatch::with_events(
            tenant,
            (0..n)
                .map(|i| TelemetryItem::new(format!("event-{i}"), tenant))
                .collect(),
        )
    }

    fn payload(serializer: &Serializer, reduced: bool) -> SerializedPayload {
        serializer.create_payload(
            0,
            false,
            false,
            reduced,
            SendRequestReason::NormalSchedule,
            EventSendType::Batched,
        )
    }

    #[test]
    fn test_ndjson_packing() {
        let serializer = Serializer::new();
        let mut p = payload(&serializer, false);

        assert!(matches!(
            serializer.append_payload(&mut p, batch("a", 2), 500),
            PayloadAppend::Added
        ));
        assert!(matches!(
            serializer.append_payload(&mut p, batch("b", 1), 500),
            PayloadAppend::Added
        ));

        let text = String::from_utf8(p.blob().to_vec()).unwrap();
        let lines: Vec<_> = text.split('\n').collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("latency").is_none());
        }
        assert_eq!(p.num_events, 3);
        assert_eq!(p.api_keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(p.batches.len(), 2);
        assert!(p.overflow.is_none());
    }

    #[test]
    fn test_event_count_limit_creates_overflow() {
        let serializer = Serializer::new();
        let mut p = payload(&serializer, false);

        serializer.append_payload(&mut p, batch("a", 5), 3);
        assert_eq!(p.num_events, 3);
        assert_eq!(p.batches[0].count(), 3);
        assert_eq!(p.overflow.as_ref().map(EventBatch::count), Some(2));

        // An overflowed payload accepts nothing more.
        let rejected = serializer.append_payload(&mut p, batch("b", 1), 3);
        assert!(matches!(rejected, PayloadAppend::DidNotFit(b) if b.count() == 1));
    }

    #[test]
    fn test_full_payload_hands_batch_back() {
        let serializer = Serializer::new();
        let mut p = payload(&serializer, false);

        serializer.append_payload(&mut p, batch("a", 2), 2);
        match serializer.append_payload(&mut p, batch("b", 4), 2) {
            PayloadAppend::DidNotFit(b) => assert_eq!(b.count(), 4),
            PayloadAppend::Added => panic!("batch should not fit"),
        }
        assert!(p.overflow.is_none());
    }

    #[test]
    fn test_reduced_size_limit_splits_batch() {
        let serializer = Serializer::with_limits(MAX_REQUEST_SIZE, 300, MAX_EVENT_SIZE);
        let mut p = payload(&serializer, true);

        serializer.append_payload(&mut p, batch("a", 10), 500);
        assert!(p.blob().len() <= 300);
        assert!(p.num_events > 0 && p.num_events < 10);
        let overflow = p.overflow.as_ref().map(EventBatch::count).unwrap_or(0);
        assert_eq!(p.num_events + overflow, 10);
    }

    #[test]
    fn test_invalid_and_oversized_events_are_tracked() {
        let serializer = Serializer::with_limits(MAX_REQUEST_SIZE, MAX_REDUCED_REQUEST_SIZE, 200);
        let mut p = payload(&serializer, false);

        let mut events = vec![TelemetryItem::new("", "a"), TelemetryItem::new("ok", "a")];
        events.push(TelemetryItem::new("big", "a").with_data("blob", "x".repeat(500)));
        serializer.append_payload(&mut p, EventBatch::with_events("a", events), 500);

        assert_eq!(p.num_events, 1);
        assert_eq!(p.failed_events.len(), 1);
        assert_eq!(p.size_exceeded.len(), 1);
        assert_eq!(p.batches[0].events()[0].name, "ok");
    }

    #[test]
    fn test_all_invalid_batch_is_not_packed() {
        let serializer = Serializer::new();
        let mut p = payload(&serializer, false);

        let events = vec![TelemetryItem::new("", "a"), TelemetryItem::new("", "a")];
        let outcome = serializer.append_payload(&mut p, EventBatch::with_events("a", events), 500);

        assert!(matches!(outcome, PayloadAppend::Added));
        assert!(!p.has_data());
        assert!(p.batches.is_empty());
        assert_eq!(p.failed_events.len(), 2);
    }
}
