//! Configuration for downloads.
//!
//! - [`DownloadConfig`] describes one download and is validated into a
//!   [`ValidatedConfig`] before anything touches the network.
//! - [`ConfigFile`] holds user defaults read from `~/.rangeget/config.ini`.

mod download;
mod file;

use std::path::PathBuf;

use thiserror::Error;

pub use download::{DownloadConfig, Output, ValidatedConfig, DEFAULT_CONNECTIONS, DEFAULT_FILE_NAME};
pub use file::{default_config_path, ConfigFile, DownloadDefaults, LoggingSettings};

/// Errors raised while building or loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme '{0}', expected http or https")]
    UnsupportedScheme(String),

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to read config file {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("invalid value '{value}' for {section}.{key}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
}
