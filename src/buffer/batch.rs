use crate::domain::TelemetryItem;
use uuid::Uuid;

/// An ordered run of telemetry items that all belong to one tenant.
///
/// The tenant key is fixed at construction. The byte estimate tracks the serialized size
/// closely enough for queue accounting; the serializer measures the real blob.
#[derive(Debug, Clone)]
pub struct EventBatch {
    id: String,
    tenant_key: String,
    events: Vec<TelemetryItem>,
    msfpc: Option<String>,
    max_items: Option<usize>,
    estimated_size: usize,
}

impl EventBatch {
    pub fn new(tenant_key: impl Into<String>) -> Self {
        Self::with_events(tenant_key, Vec::new())
    }

    pub fn with_events(tenant_key: impl Into<String>, events: Vec<TelemetryItem>) -> Self {
        let msfpc = events.iter().find_map(|e| e.msfpc().map(str::to_string));
        let estimated_size = events.iter().map(estimate_item_size).sum();

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_key: tenant_key.into(),
            events,
            msfpc,
            max_items: None,
            estimated_size,
        }
    }

    /// Caps how many items [`append`](Self::append) accepts. `0` means unlimited.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = (max_items > 0).then_some(max_items);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_key(&self) -> &str {
        &self.tenant_key
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.max_items.is_some_and(|max| self.events.len() >= max)
    }

    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    pub fn msfpc(&self) -> Option<&str> {
        self.msfpc.as_deref()
    }

    pub fn events(&self) -> &[TelemetryItem] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [TelemetryItem] {
        &mut self.events
    }

    pub fn into_events(self) -> Vec<TelemetryItem> {
        self.events
    }

    /// Appends `item`, returning `false` when the batch is already at its item ceiling.
    pub fn append(&mut self, item: TelemetryItem) -> bool {
        if self.is_full() {
            return false;
        }

        if self.msfpc.is_none() {
            self.msfpc = item.msfpc().map(str::to_string);
        }
        self.estimated_size += estimate_item_size(&item);
        self.events.push(item);
        true
    }

    /// Removes up to `count` items starting at `from` (all remaining when `None`) and returns
    /// them as a new batch for the same tenant. Out-of-range starts yield an empty batch.
    pub fn split(&mut self, from: usize, count: Option<usize>) -> EventBatch {
        let mut removed = Vec::new();
        if from < self.events.len() {
            let end = count
                .map(|n| from.saturating_add(n).min(self.events.len()))
                .unwrap_or(self.events.len());
            removed = self.events.drain(from..end).collect();
        }

        let removed_size: usize = removed.iter().map(estimate_item_size).sum();
        self.estimated_size = self.estimated_size.saturating_sub(removed_size);

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_key: self.tenant_key.clone(),
            events: removed,
            msfpc: self.msfpc.clone(),
            max_items: self.max_items,
            estimated_size: removed_size,
        }
    }
}

fn estimate_item_size(item: &TelemetryItem) -> usize {
    // Braces, quotes and separators for the fixed keys.
    let envelope = 40;
    let strings = item.name.len() + item.time.len() + item.tenant_key.len();
    let maps = estimate_map_size(&item.data) + estimate_map_size(&item.ext);

    envelope + strings + maps
}

fn estimate_map_size(map: &serde_json::Map<String, serde_json::Value>) -> usize {
    map.iter()
        .map(|(k, v)| k.len() + 4 + estimate_value_size(v))
        .sum()
}

fn estimate_value_size(value: &serde_json::Value) -> usize {
    use serde_json::Value;
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 12,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(|v| estimate_value_size(v) + 1).sum::<usize>(),
        Value::Object(map) => 2 + estimate_map_size(map),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<TelemetryItem> {
        (0..n)
            .map(|i| TelemetryItem::new(format!("event-{i}"), "tenant"))
            .collect()
    }

    #[test]
    fn test_append_respects_max_items() {
        let mut batch = EventBatch::new("tenant").with_max_items(2);
        assert!(batch.append(TelemetryItem::new("a", "tenant")));
        assert!(batch.append(TelemetryItem::new("b", "tenant")));
        assert!(batch.is_full());
        assert!(!batch.append(TelemetryItem::new("c", "tenant")));
        assert_eq!(batch.count(), 2);
    }

    #[test]
    fn test_unlimited_batch_never_fills() {
        let mut batch = EventBatch::new("tenant").with_max_items(0);
        for item in items(50) {
            assert!(batch.append(item));
        }
        assert!(!batch.is_full());
    }

    #[test]
    fn test_split_removes_requested_range() {
        let mut batch = EventBatch::with_events("tenant", items(5));
        let total = batch.estimated_size();

        let removed = batch.split(1, Some(2));
        assert_eq!(removed.count(), 2);
        assert_eq!(removed.events()[0].name, "event-1");
        assert_eq!(removed.tenant_key(), "tenant");
        assert_eq!(batch.count(), 3);
        assert_eq!(batch.events()[1].name, "event-3");
        assert_eq!(batch.estimated_size() + removed.estimated_size(), total);
    }

    #[test]
    fn test_split_to_end_and_out_of_range() {
        let mut batch = EventBatch::with_events("tenant", items(3));
        let tail = batch.split(1, None);
        assert_eq!(tail.count(), 2);
        assert_eq!(batch.count(), 1);

        let nothing = batch.split(5, Some(1));
        assert!(nothing.is_empty());
        assert_eq!(batch.count(), 1);
    }

    #[test]
    fn test_msfpc_is_captured_from_items() {
        let mut item = TelemetryItem::new("a", "tenant");
        item.set_msfpc("GUID=1");

        let mut batch = EventBatch::new("tenant");
        assert_eq!(batch.msfpc(), None);
        batch.append(item);
        assert_eq!(batch.msfpc(), Some("GUID=1"));
    }
}
