#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rask_telemetry_channel::channel::NotificationSink;
use rask_telemetry_channel::domain::{EventsDiscardedReason, SendRequestReason, TelemetryItem};
use rask_telemetry_channel::sender::{
    BeaconTransport, HttpTransport, PayloadData, TransportError, TransportResponse,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Answers each request with the next scripted response, repeating the last one.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<TransportResponse>>,
    requests: Mutex<Vec<PayloadData>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<TransportResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(vec![TransportResponse::with_status(200)])
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<PayloadData> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send_post(
        &self,
        payload: PayloadData,
        _sync: bool,
    ) -> Result<TransportResponse, TransportError> {
        self.requests.lock().push(payload);
        let mut responses = self.responses.lock();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        Ok(response.unwrap_or_else(|| TransportResponse::with_status(200)))
    }
}

/// Beacon that accepts bodies up to `max_size` bytes and records what it accepted.
pub struct SizedBeacon {
    pub max_size: usize,
    pub accepted: Mutex<Vec<Vec<u8>>>,
}

impl SizedBeacon {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            max_size,
            accepted: Mutex::new(Vec::new()),
        })
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().len()
    }
}

impl BeaconTransport for SizedBeacon {
    fn send_beacon(&self, _url: &str, data: &[u8]) -> bool {
        if data.len() > self.max_size {
            return false;
        }
        self.accepted.lock().push(data.to_vec());
        true
    }
}

/// Sink recording every notification by event name.
#[derive(Default)]
pub struct RecordingSink {
    pub requested: Mutex<Vec<(String, SendRequestReason)>>,
    pub sent: Mutex<Vec<String>>,
    pub discarded: Mutex<Vec<(String, EventsDiscardedReason)>>,
}

impl RecordingSink {
    pub fn sent_names(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn discarded_with(&self, reason: EventsDiscardedReason) -> Vec<String> {
        self.discarded
            .lock()
            .iter()
            .filter(|(_, r)| *r == reason)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn events_send_request(&self, events: &[TelemetryItem], reason: SendRequestReason, _is_sync: bool) {
        self.requested
            .lock()
            .extend(events.iter().map(|e| (e.name.clone(), reason)));
    }

    fn events_sent(&self, events: &[TelemetryItem]) {
        self.sent.lock().extend(events.iter().map(|e| e.name.clone()));
    }

    fn events_discarded(&self, events: &[TelemetryItem], reason: EventsDiscardedReason) {
        self.discarded
            .lock()
            .extend(events.iter().map(|e| (e.name.clone(), reason)));
    }
}

pub fn item(name: &str, tenant: &str) -> TelemetryItem {
    TelemetryItem::new(name, tenant)
}

/// Lets spawned sends and their completions run under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
