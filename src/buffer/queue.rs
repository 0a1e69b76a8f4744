use super::batch::EventBatch;
use crate::domain::{EventLatency, TelemetryItem};
use std::collections::HashMap;

/// Batches waiting in one latency tier. Each tenant has at most one open batch.
#[derive(Debug, Default)]
struct TierQueue {
    batches: Vec<EventBatch>,
    open: HashMap<String, usize>,
}

impl TierQueue {
    fn event_count(&self) -> usize {
        self.batches.iter().map(EventBatch::count).sum()
    }
}

/// Per-tier, per-tenant event queues.
#[derive(Debug, Default)]
pub struct LatencyQueues {
    tiers: [TierQueue; 4],
}

impl LatencyQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `item` to its tenant's open batch in the item's tier, starting a new batch when
    /// there is none or the open one is full. Returns the size of the batch it landed in.
    pub fn add(&mut self, item: TelemetryItem, max_batch_items: usize) -> usize {
        let tier = &mut self.tiers[item.latency.index()];

        let index = match tier.open.get(&item.tenant_key) {
            Some(&index) if !tier.batches[index].is_full() => index,
            _ => {
                tier.batches
                    .push(EventBatch::new(item.tenant_key.clone()).with_max_items(max_batch_items));
                let index = tier.batches.len() - 1;
                tier.open.insert(item.tenant_key.clone(), index);
                index
            }
        };

        let batch = &mut tier.batches[index];
        batch.append(item);
        batch.count()
    }

    /// Events in every tier except Immediate.
    pub fn queue_size(&self) -> usize {
        self.tiers[..EventLatency::Immediate.index()]
            .iter()
            .map(TierQueue::event_count)
            .sum()
    }

    pub fn immediate_queue_size(&self) -> usize {
        self.tiers[EventLatency::Immediate.index()].event_count()
    }

    pub fn has_events(&self) -> bool {
        self.tiers.iter().any(|tier| tier.event_count() > 0)
    }

    /// Whether any queued batch holds at least `limit` events.
    pub fn has_batch_at_least(&self, limit: usize) -> bool {
        self.tiers
            .iter()
            .flat_map(|tier| tier.batches.iter())
            .any(|batch| batch.count() >= limit)
    }

    /// Drops up to `count` of the oldest events from the least urgent non-empty tier in
    /// `lowest..=highest`. Returns what was removed, or `None` if every eligible tier is empty.
    pub fn evict_oldest(
        &mut self,
        lowest: EventLatency,
        highest: EventLatency,
        count: usize,
    ) -> Option<EventBatch> {
        for latency in lowest.up_to(highest) {
            let tier = &mut self.tiers[latency.index()];
            if let Some(batch) = tier.batches.iter_mut().find(|b| !b.is_empty()) {
                return Some(batch.split(0, Some(count.max(1))));
            }
        }
        None
    }

    /// Removes and returns every batch at `latency` or above, most urgent tier first.
    pub fn take_at_or_above(&mut self, latency: EventLatency) -> Vec<EventBatch> {
        let mut taken = Vec::new();
        for tier_latency in latency.and_above() {
            let tier = std::mem::take(&mut self.tiers[tier_latency.index()]);
            taken.extend(tier.batches.into_iter().filter(|b| !b.is_empty()));
        }
        taken
    }
}
