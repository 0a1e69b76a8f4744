use thiserror::Error;

/// Top-level error type for the telemetry channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Channel has been torn down")]
    TornDown,

    #[error("Channel is paused")]
    Paused,

    #[error("Flush was cancelled before completion")]
    FlushCancelled,
}
