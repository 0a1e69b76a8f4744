#![deny(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Safe within realistic value bounds (durations, sizes)
    clippy::cast_possible_wrap,       // Safe in non-negative contexts
    clippy::cast_precision_loss,      // Timer scaling works in f64
    clippy::cast_sign_loss,           // Safe where values are known non-negative
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. ChannelConfig in channel module
    clippy::must_use_candidate,       // Annotated selectively on critical APIs
    clippy::doc_markdown              // Internal API
)]

//! Client-side telemetry transmission: events are queued by latency tier, packed into
//! collector payloads and delivered over XHR, Fetch or Beacon style transports with retry,
//! back-off, clock-skew and kill-switch handling.

pub mod app;
pub mod buffer;
pub mod channel;
pub mod domain;
pub mod reliability;
pub mod sender;

// Re-export main types for easy access
pub use app::{App, Config};
pub use channel::{ChannelConfig, NotificationSink, PostChannel};
pub use domain::{ChannelError, EventLatency, TelemetryItem};
pub use sender::{HttpManager, TransportEnvironment};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
