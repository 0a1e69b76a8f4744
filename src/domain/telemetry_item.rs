use super::latency::EventLatency;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single telemetry event handed to the channel by instrumentation.
///
/// Only `name`, `time`, `iKey`, `data` and `ext` reach the wire. The remaining fields are
/// channel bookkeeping: they can be supplied on input but are never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryItem {
    pub name: String,
    #[serde(default = "now_rfc3339")]
    pub time: String,
    #[serde(rename = "iKey")]
    pub tenant_key: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub ext: Map<String, Value>,

    #[serde(default, skip_serializing)]
    pub latency: EventLatency,
    #[serde(default, skip_serializing, alias = "sendAttempt")]
    pub send_attempt: u32,
    #[serde(default, skip_serializing)]
    pub sync: bool,
    #[serde(default, skip_serializing)]
    pub timings: Option<BTreeMap<String, i64>>,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Wall-clock milliseconds since the Unix epoch, as used for timing marks and upload times.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl TelemetryItem {
    pub fn new(name: impl Into<String>, tenant_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time: now_rfc3339(),
            tenant_key: tenant_key.into(),
            data: Map::new(),
            ext: Map::new(),
            latency: EventLatency::Normal,
            send_attempt: 0,
            sync: false,
            timings: None,
        }
    }

    pub fn with_latency(mut self, latency: EventLatency) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The server-assigned correlation cookie carried in `ext.intweb.msfpc`, if any.
    pub fn msfpc(&self) -> Option<&str> {
        self.ext
            .get("intweb")
            .and_then(|intweb| intweb.get("msfpc"))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn set_msfpc(&mut self, value: impl Into<String>) {
        let intweb = self
            .ext
            .entry("intweb")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = intweb {
            map.insert("msfpc".to_string(), Value::String(value.into()));
        }
    }

    /// Records a diagnostic timing mark (epoch milliseconds) on the item.
    pub fn set_timing(&mut self, name: &str, epoch_ms: i64) {
        self.timings
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), epoch_ms);
    }

    pub fn timing(&self, name: &str) -> Option<i64> {
        self.timings.as_ref().and_then(|t| t.get(name).copied())
    }

    /// Whether the item carries enough identity to be serialized.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.tenant_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookkeeping_fields_are_not_serialized() {
        let mut item = TelemetryItem::new("page_view", "tenant-a")
            .with_latency(EventLatency::RealTime)
            .with_sync(true);
        item.send_attempt = 3;
        item.set_timing("sendEventStart", 42);

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["name"], "page_view");
        assert_eq!(json["iKey"], "tenant-a");
        assert!(json.get("latency").is_none());
        assert!(json.get("sync").is_none());
        assert!(json.get("send_attempt").is_none());
        assert!(json.get("timings").is_none());
    }

    #[test]
    fn test_deserialize_accepts_channel_hints() {
        let item: TelemetryItem = serde_json::from_str(
            r#"{"name":"dep","iKey":"t","latency":"immediate","sync":true,"sendAttempt":2}"#,
        )
        .unwrap();
        assert_eq!(item.latency, EventLatency::Immediate);
        assert!(item.sync);
        assert_eq!(item.send_attempt, 2);
        assert!(!item.time.is_empty());
    }

    #[test]
    fn test_msfpc_round_trip() {
        let mut item = TelemetryItem::new("e", "t");
        assert_eq!(item.msfpc(), None);
        item.set_msfpc("GUID=abc");
        assert_eq!(item.msfpc(), Some("GUID=abc"));
    }

    #[test]
    fn test_validity() {
        assert!(TelemetryItem::new("e", "t").is_valid());
        assert!(!TelemetryItem::new("", "t").is_valid());
        assert!(!TelemetryItem::new("e", "").is_valid());
    }
}
