//! Domain layer for rask-telemetry-channel.
//!
//! Contains the canonical types shared across all modules:
//! - `TelemetryItem`: the event envelope moved through queues, batches and payloads
//! - `EventLatency` / `EventSendType` / `SendRequestReason`: scheduling vocabulary
//! - `EventsDiscardedReason`: why an item left the pipeline without being sent
//! - `ChannelError`: top-level error type

pub mod error;
pub mod latency;
pub mod telemetry_item;

pub use error::ChannelError;
pub use latency::{EventLatency, EventSendType, EventsDiscardedReason, SendRequestReason};
pub use telemetry_item::{TelemetryItem, epoch_millis};
