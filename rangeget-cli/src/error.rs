//! CLI error type.

use rangeget::logging::LoggingError;
use rangeget::{ConfigError, DownloadError};
use thiserror::Error;

/// Errors that end the program with a non-zero exit code.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error("failed to load configuration: {0}")]
    ConfigFile(#[from] ConfigError),

    #[error("failed to set up logging: {0}")]
    Logging(#[from] LoggingError),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Download(#[from] DownloadError),
}
