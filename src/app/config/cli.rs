use super::serde_helpers::{
    load_env_flag, load_env_path_opt, load_env_string, load_env_string_opt, load_env_var,
};
use super::{ConfigError, LogLevel};
use crate::channel::ChannelConfig;
use crate::channel::config::{
    DEFAULT_EVENTS_LIMIT_IN_MEM, DEFAULT_MAX_CONNECTIONS, REAL_TIME,
};
use crate::sender::ClientConfig;
use crate::sender::serialization::DEFAULT_MAX_EVENTS_PER_BATCH;
use clap::Parser;
use clap::builder::BoolishValueParser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://collector.localhost/OneCollector/1.0/";

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Collector endpoint URL
    #[arg(
        long,
        env = "RASK_TELEMETRY_ENDPOINT",
        default_value = "https://collector.localhost/OneCollector/1.0/"
    )]
    pub endpoint: String,

    /// Tenant key applied to every event, replacing the one each event carries
    #[arg(long, env = "OVERRIDE_INSTRUMENTATION_KEY")]
    pub override_instrumentation_key: Option<String>,

    /// Transmit profile (REAL_TIME, NEAR_REAL_TIME, BEST_EFFORT or a custom one from the config file)
    #[arg(long, env = "TRANSMIT_PROFILE", default_value = "REAL_TIME")]
    pub transmit_profile: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Maximum concurrent collector requests
    #[arg(long, env = "MAX_CONNECTIONS", default_value = "2")]
    pub max_connections: usize,

    /// Events held in memory before the oldest are dropped
    #[arg(long, env = "EVENTS_LIMIT_IN_MEM", default_value = "10000")]
    pub events_limit_in_mem: usize,

    /// Events packed into one request
    #[arg(long, env = "MAX_EVENTS_PER_BATCH", default_value = "500")]
    pub max_events_per_batch: usize,

    /// Queue size that triggers an async flush (0 disables)
    #[arg(long, env = "AUTO_FLUSH_EVENTS_LIMIT", default_value = "0")]
    pub auto_flush_events_limit: usize,

    /// Per-request timeout in milliseconds (0 disables)
    #[arg(long, env = "XHR_TIMEOUT_MS", default_value = "0")]
    pub xhr_timeout_ms: u64,

    /// Connection timeout in seconds
    #[arg(long, env = "CONNECTION_TIMEOUT_SECS", default_value = "30")]
    pub connection_timeout_secs: u64,

    /// Enable compression for HTTP requests
    #[arg(long, env = "ENABLE_COMPRESSION", value_parser = BoolishValueParser::new())]
    pub enable_compression: bool,

    /// Accept events but never send them
    #[arg(long, env = "RASK_DISABLE_TELEMETRY", value_parser = BoolishValueParser::new())]
    pub disable_telemetry: bool,

    /// Record per-event timing marks
    #[arg(long, env = "ENABLE_EVENT_TIMINGS", value_parser = BoolishValueParser::new())]
    pub enable_event_timings: bool,

    /// Channel configuration file (TOML); CLI and env values override it
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub connection_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub channel: ChannelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            override_instrumentation_key: None,
            transmit_profile: REAL_TIME.to_string(),
            log_level: LogLevel::Info,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            events_limit_in_mem: DEFAULT_EVENTS_LIMIT_IN_MEM,
            max_events_per_batch: DEFAULT_MAX_EVENTS_PER_BATCH,
            auto_flush_events_limit: 0,
            xhr_timeout_ms: 0,
            connection_timeout_secs: 30,
            enable_compression: false,
            disable_telemetry: false,
            enable_event_timings: false,
            config_file: None,
            connection_timeout: Duration::from_secs(30),
            channel: ChannelConfig::default(),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        load_env_string("RASK_TELEMETRY_ENDPOINT", &mut config.endpoint);
        load_env_string_opt(
            "OVERRIDE_INSTRUMENTATION_KEY",
            &mut config.override_instrumentation_key,
        );
        load_env_string("TRANSMIT_PROFILE", &mut config.transmit_profile);

        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.log_level = log_level
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {e}")))?;
        }

        load_env_var("MAX_CONNECTIONS", &mut config.max_connections)?;
        load_env_var("EVENTS_LIMIT_IN_MEM", &mut config.events_limit_in_mem)?;
        load_env_var("MAX_EVENTS_PER_BATCH", &mut config.max_events_per_batch)?;
        load_env_var("AUTO_FLUSH_EVENTS_LIMIT", &mut config.auto_flush_events_limit)?;
        load_env_var("XHR_TIMEOUT_MS", &mut config.xhr_timeout_ms)?;
        load_env_var("CONNECTION_TIMEOUT_SECS", &mut config.connection_timeout_secs)?;
        load_env_flag("ENABLE_COMPRESSION", &mut config.enable_compression)?;
        load_env_flag("RASK_DISABLE_TELEMETRY", &mut config.disable_telemetry)?;
        load_env_flag("ENABLE_EVENT_TIMINGS", &mut config.enable_event_timings)?;
        load_env_path_opt("CONFIG_FILE", &mut config.config_file);

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the binary's own settings from TOML, then post-processes them like CLI input.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// Derives durations and builds [`Config::channel`]: the channel file (if any) is the
    /// base, and every flag that differs from its default is applied on top.
    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.connection_timeout = Duration::from_secs(self.connection_timeout_secs);

        let mut channel = match &self.config_file {
            Some(path) => load_channel_file(path)?,
            None => ChannelConfig::default(),
        };

        let defaults = Config::default();
        if self.endpoint != defaults.endpoint || self.config_file.is_none() {
            channel.endpoint_url = self.endpoint.clone();
        }
        if self.override_instrumentation_key.is_some() {
            channel.override_instrumentation_key = self.override_instrumentation_key.clone();
        }
        if self.transmit_profile != defaults.transmit_profile {
            channel.transmit_profile = self.transmit_profile.clone();
        }
        if self.max_connections != defaults.max_connections {
            channel.max_connections = self.max_connections;
        }
        if self.events_limit_in_mem != defaults.events_limit_in_mem {
            channel.events_limit_in_mem = self.events_limit_in_mem;
        }
        if self.max_events_per_batch != defaults.max_events_per_batch {
            channel.max_events_per_batch = self.max_events_per_batch;
        }
        if self.auto_flush_events_limit != defaults.auto_flush_events_limit {
            channel.auto_flush_events_limit = self.auto_flush_events_limit;
        }
        if self.xhr_timeout_ms > 0 {
            channel.xhr_timeout = Some(Duration::from_millis(self.xhr_timeout_ms));
        }
        channel.disable_telemetry |= self.disable_telemetry;
        channel.enable_event_timings |= self.enable_event_timings;

        self.channel = channel;
        Ok(())
    }

    /// Settings for the reqwest client backing every transport.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connection_timeout: self.connection_timeout,
            max_connections: self.channel.max_connections,
            enable_compression: self.enable_compression,
            ..ClientConfig::default()
        }
    }
}

fn load_channel_file(path: &Path) -> Result<ChannelConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_flow_into_channel() {
        let config = Config::from_args(["rask-telemetry-channel"]).unwrap();
        assert_eq!(config.channel.endpoint_url, DEFAULT_ENDPOINT);
        assert_eq!(config.channel.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.channel.xhr_timeout, None);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_flags_override_channel_defaults() {
        let config = Config::from_args([
            "rask-telemetry-channel",
            "--endpoint",
            "https://collector.example.com/OneCollector/1.0/",
            "--transmit-profile",
            "BEST_EFFORT",
            "--xhr-timeout-ms",
            "2500",
            "--disable-telemetry",
        ])
        .unwrap();

        assert_eq!(
            config.channel.endpoint_url,
            "https://collector.example.com/OneCollector/1.0/"
        );
        assert_eq!(config.channel.transmit_profile, "BEST_EFFORT");
        assert_eq!(config.channel.xhr_timeout, Some(Duration::from_millis(2500)));
        assert!(config.channel.disable_telemetry);
    }

    #[test]
    fn test_client_config_follows_flags() {
        let mut config = Config {
            enable_compression: true,
            connection_timeout_secs: 5,
            ..Config::default()
        };
        config.post_process().unwrap();

        let client = config.client_config();
        assert!(client.enable_compression);
        assert_eq!(client.connection_timeout, Duration::from_secs(5));
        assert_eq!(client.max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
