pub mod config;
pub mod logging_system;
pub mod shutdown;
pub mod sink;

pub use config::{Config, ConfigError, LogLevel};
pub use logging_system::{LoggingError, LoggingSystem, setup_logging_safe};
pub use shutdown::shutdown_signal;
pub use sink::{DeliveryTotals, LoggingSink};

use crate::channel::PostChannel;
use crate::domain::TelemetryItem;
use crate::sender::{SendHooks, reqwest_environment};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Longest the end-of-input flush may wait for the collector before falling back to the
/// unload path.
const EOF_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// What one run of the binary did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tracked: usize,
    pub malformed: usize,
    pub delivery: DeliveryTotals,
}

/// Reads NDJSON telemetry items and feeds them to a [`PostChannel`].
pub struct App {
    channel: PostChannel,
    sink: Arc<LoggingSink>,
}

impl App {
    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args(args)?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let environment = reqwest_environment(config.client_config())
            .context("Failed to build HTTP transports")?;
        Self::with_environment(config, environment)
    }

    /// Builds the app over caller-supplied transports.
    pub fn with_environment(
        config: &Config,
        environment: crate::sender::TransportEnvironment,
    ) -> anyhow::Result<Self> {
        let sink = Arc::new(LoggingSink::new());
        let channel = PostChannel::new(
            config.channel.clone(),
            environment,
            SendHooks::default(),
            sink.clone(),
        )
        .context("Failed to initialize post channel")?;

        Ok(Self { channel, sink })
    }

    pub fn channel(&self) -> &PostChannel {
        &self.channel
    }

    /// Runs over stdin until end of input or a shutdown signal.
    pub async fn run(self) -> anyhow::Result<RunSummary> {
        let stdin = BufReader::new(tokio::io::stdin());
        self.run_until(stdin, shutdown_signal()).await
    }

    /// Tracks every line of `input`. End of input flushes and waits for the collector;
    /// `shutdown` resolving takes the unload path instead. Either way the channel is torn
    /// down before returning.
    pub async fn run_until<R, F>(self, input: R, shutdown: F) -> anyhow::Result<RunSummary>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut summary = RunSummary::default();
        let mut lines = input.lines();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line.context("Failed to read input")? {
                        Some(line) => self.ingest(&line, &mut summary),
                        None => {
                            info!("Input closed after {} events, flushing", summary.tracked);
                            self.flush_on_eof().await;
                            break;
                        }
                    }
                }
                () = &mut shutdown => {
                    self.channel.on_unload();
                    break;
                }
            }
        }

        self.channel.teardown();
        summary.delivery = self.sink.totals();
        info!(
            "Done: tracked={} malformed={} sent={} discarded={}",
            summary.tracked, summary.malformed, summary.delivery.sent, summary.delivery.discarded
        );
        Ok(summary)
    }

    fn ingest(&self, line: &str, summary: &mut RunSummary) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<TelemetryItem>(line) {
            Ok(item) => {
                self.channel.track(item);
                summary.tracked += 1;
            }
            Err(e) => {
                warn!("Skipping malformed telemetry line: {}", e);
                summary.malformed += 1;
            }
        }
    }

    async fn flush_on_eof(&self) {
        match tokio::time::timeout(EOF_FLUSH_TIMEOUT, self.channel.flush_async(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Flush failed: {}, unloading", e);
                self.channel.on_unload();
            }
            Err(_) => {
                warn!("Flush did not finish in {:?}, unloading", EOF_FLUSH_TIMEOUT);
                self.channel.on_unload();
            }
        }
    }
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Binary entry point.
pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_args(std::env::args())?;

    if let Err(e) = setup_logging_safe(config.log_level) {
        eprintln!("Warning: {e}");
    }
    info!("Starting rask-telemetry-channel v{}", get_version());
    info!(
        "Configuration: endpoint={}, profile={}, max_connections={}",
        config.channel.endpoint_url, config.channel.transmit_profile, config.channel.max_connections
    );

    let app = App::from_config(&config)?;
    match app.run().await {
        Ok(summary) if summary.delivery.discarded > 0 => {
            warn!("{} events were discarded", summary.delivery.discarded);
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Application error: {:#}", e);
            Err(e)
        }
    }
}
