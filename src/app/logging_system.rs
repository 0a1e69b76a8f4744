use super::config::LogLevel;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log directive '{0}'")]
    InvalidDirective(String),
    #[error("Failed to initialize logging: {details}")]
    InitFailed {
        details: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// One `target=level` filter entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub target: String,
    pub level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    /// Parses `target=level`. An unknown level is reported as `Ok(None)` with the target kept
    /// so the caller can substitute its fallback level.
    fn parse(directive: &str) -> Result<(String, Option<LogLevel>), LoggingError> {
        let Some((target, level)) = directive.split_once('=') else {
            return Err(LoggingError::InvalidDirective(directive.to_string()));
        };
        let target = target.trim();
        if target.is_empty() {
            return Err(LoggingError::InvalidDirective(directive.to_string()));
        }
        Ok((target.to_string(), level.trim().parse().ok()))
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, self.level.as_str())
    }
}

/// Collects filter directives and installs the global `tracing` subscriber.
pub struct LoggingSystem {
    directives: Arc<RwLock<Vec<LogDirective>>>,
    fallback_level: LogLevel,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: Arc::new(RwLock::new(Vec::new())),
            fallback_level: LogLevel::Info,
        }
    }

    /// Adds a `target=level` directive. Malformed directives are skipped and an unknown level
    /// falls back to `info`; both print a warning since tracing is not up yet.
    pub fn add_directive(&self, directive_str: &str) -> Result<(), LoggingError> {
        match LogDirective::parse(directive_str) {
            Ok((target, Some(level))) => {
                self.directives.write().push(LogDirective::new(target, level));
            }
            Ok((target, None)) => {
                eprintln!("Warning: unknown level in '{directive_str}', using default level");
                self.directives
                    .write()
                    .push(LogDirective::new(target, self.fallback_level));
            }
            Err(e) => {
                eprintln!("Warning: {e}, skipping directive");
            }
        }
        Ok(())
    }

    /// Quiets the HTTP stack underneath the transports.
    pub fn add_default_directives(&self) {
        let mut directives = self.directives.write();
        for target in ["hyper", "hyper_util", "reqwest", "h2", "rustls"] {
            directives.push(LogDirective::new(target, LogLevel::Warn));
        }
    }

    pub fn initialize_tracing(&self, default_level: LogLevel) -> Result<(), LoggingError> {
        let filter_string = self.build_filter_string(default_level);

        let env_filter = EnvFilter::try_new(&filter_string).map_err(|e| LoggingError::InitFailed {
            details: format!("Failed to create EnvFilter with '{filter_string}'"),
            source: Box::new(e),
        })?;

        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
                .compact(),
        );

        tracing::subscriber::set_global_default(subscriber).map_err(|e| {
            LoggingError::InitFailed {
                details: "Failed to set global tracing subscriber".to_string(),
                source: Box::new(e),
            }
        })
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();

        let mut filter_parts = Vec::with_capacity(directives.len() + 1);
        filter_parts.push(default_level.as_str().to_string());
        filter_parts.extend(directives.iter().map(LogDirective::to_filter_string));

        filter_parts.join(",")
    }

    pub fn directive_count(&self) -> usize {
        self.directives.read().len()
    }

    pub fn clear_directives(&self) {
        self.directives.write().clear();
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global subscriber once per process. Later calls report whether the first
/// one succeeded. `RUST_LOG` directives, when set, are appended after the defaults.
pub fn setup_logging_safe(level: LogLevel) -> Result<(), LoggingError> {
    use std::sync::OnceLock;

    static INIT: OnceLock<bool> = OnceLock::new();

    let initialized = *INIT.get_or_init(|| {
        let logging_system = LoggingSystem::new();
        logging_system.add_default_directives();
        if let Ok(extra) = std::env::var("RUST_LOG") {
            for directive in extra.split(',').filter(|d| !d.trim().is_empty()) {
                let _ = logging_system.add_directive(directive);
            }
        }

        match logging_system.initialize_tracing(level) {
            Ok(()) => true,
            Err(e) => {
                eprintln!("Warning: {e}");
                false
            }
        }
    });

    if initialized {
        Ok(())
    } else {
        Err(LoggingError::InitFailed {
            details: "Logging system initialization failed".to_string(),
            source: Box::new(std::io::Error::other("Logging initialization error")),
        })
    }
}
