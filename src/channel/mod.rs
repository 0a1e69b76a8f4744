//! Queueing and scheduling on top of the HTTP manager.

pub mod config;
pub mod notification;
pub mod post_channel;
pub mod timer;

pub use config::{ChannelConfig, TransmitProfiles};
pub use notification::{
    ChannelHooks, NoopSink, NotificationAction, NotificationReason, NotificationSink,
};
pub use post_channel::{FlushCallback, PostChannel};
