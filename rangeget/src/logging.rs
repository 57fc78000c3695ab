//! Logging setup.
//!
//! Logs go to a daily-rotated file through a non-blocking writer and,
//! optionally, to stderr. `RUST_LOG` overrides the configured filter.

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSettings;

/// File name prefix of the log files.
pub const LOG_FILE_PREFIX: &str = "rangeget.log";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directory: PathBuf,
    /// Default filter when `RUST_LOG` is unset, e.g. `info` or
    /// `rangeget=debug`.
    pub level: String,
    /// Also log to stderr.
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LoggingSettings::default().into()
    }
}

impl From<LoggingSettings> for LogConfig {
    fn from(settings: LoggingSettings) -> Self {
        Self {
            directory: settings.directory,
            level: settings.level,
            stderr: false,
        }
    }
}

impl LogConfig {
    pub fn with_stderr(mut self, stderr: bool) -> Self {
        self.stderr = stderr;
        self
    }

    /// The filter directive used when `RUST_LOG` is unset.
    ///
    /// A bare level applies to this crate only so dependencies stay quiet.
    pub fn default_directive(&self) -> String {
        let level = self.level.trim();
        if level.contains('=') || level.contains(',') {
            level.to_string()
        } else {
            format!("rangeget={}", level)
        }
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes buffered log lines when dropped and must be
/// kept alive for the life of the process.
pub fn init(config: LogConfig) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(&config.directory).map_err(|source| LoggingError::CreateDir {
        path: config.directory.clone(),
        source,
    })?;

    let directive = config.default_directive();
    let filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => EnvFilter::try_new(&value),
        _ => EnvFilter::try_new(&directive),
    }
    .map_err(|e| LoggingError::Filter {
        filter: directive.clone(),
        reason: e.to_string(),
    })?;

    let appender = tracing_appender::rolling::daily(&config.directory, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
    let stderr_layer = config
        .stderr
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;

    Ok(guard)
}
