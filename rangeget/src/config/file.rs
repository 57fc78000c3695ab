//! User defaults from `~/.rangeget/config.ini`.
//!
//! ```ini
//! [download]
//! connections = 8
//! user_agent = my-tool/1.0
//! connect_timeout = 30
//! idle_timeout = 60
//! manifest_interval = 5
//! max_errors = 20
//!
//! [logging]
//! directory = /var/log/rangeget
//! level = debug
//! ```
//!
//! Durations are whole seconds. A missing file or key keeps the built-in
//! default and unknown keys are ignored.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use tracing::debug;

use super::{ConfigError, DownloadConfig};

const DOWNLOAD_SECTION: &str = "download";
const LOGGING_SECTION: &str = "logging";

/// Default location of the config file, `None` without a home directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".rangeget").join("config.ini"))
}

/// `[download]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDefaults {
    pub connections: usize,
    pub user_agent: Option<String>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub manifest_interval: Duration,
    pub max_errors: u32,
}

impl Default for DownloadDefaults {
    fn default() -> Self {
        let config = DownloadConfig::default();
        Self {
            connections: config.connections,
            user_agent: None,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            manifest_interval: config.manifest_interval,
            max_errors: config.max_errors,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Directory for the log file.
    pub directory: PathBuf,
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        let directory = dirs::home_dir()
            .map(|home| home.join(".rangeget").join("logs"))
            .unwrap_or_else(|| std::env::temp_dir().join("rangeget-logs"));
        Self {
            directory,
            level: "info".to_string(),
        }
    }
}

/// Parsed config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub download: DownloadDefaults,
    pub logging: LoggingSettings,
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Parse from INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some(DOWNLOAD_SECTION)) {
            let download = &mut config.download;
            if let Some(connections) = parse_key(section, DOWNLOAD_SECTION, "connections")? {
                download.connections = connections;
            }
            if let Some(user_agent) = section.get("user_agent").map(str::trim) {
                if !user_agent.is_empty() {
                    download.user_agent = Some(user_agent.to_string());
                }
            }
            if let Some(secs) = parse_key(section, DOWNLOAD_SECTION, "connect_timeout")? {
                download.connect_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = parse_key(section, DOWNLOAD_SECTION, "idle_timeout")? {
                download.idle_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = parse_key(section, DOWNLOAD_SECTION, "manifest_interval")? {
                download.manifest_interval = Duration::from_secs(secs);
            }
            if let Some(max_errors) = parse_key(section, DOWNLOAD_SECTION, "max_errors")? {
                download.max_errors = max_errors;
            }
        }

        if let Some(section) = ini.section(Some(LOGGING_SECTION)) {
            if let Some(directory) = section.get("directory").map(str::trim) {
                if !directory.is_empty() {
                    config.logging.directory = expand_tilde(directory);
                }
            }
            if let Some(level) = section.get("level").map(str::trim) {
                if !level.is_empty() {
                    config.logging.level = level.to_string();
                }
            }
        }

        Ok(config)
    }

    /// Apply the `[download]` defaults to a download configuration.
    pub fn apply(&self, mut config: DownloadConfig) -> DownloadConfig {
        let defaults = &self.download;
        config.connections = defaults.connections;
        if let Some(user_agent) = &defaults.user_agent {
            config.user_agent = user_agent.clone();
        }
        config.connect_timeout = defaults.connect_timeout;
        config.idle_timeout = defaults.idle_timeout;
        config.manifest_interval = defaults.manifest_interval;
        config.max_errors = defaults.max_errors;
        config
    }
}

fn parse_key<T: FromStr>(
    section: &Properties,
    section_name: &'static str,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match section.get(key).map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section: section_name,
                key,
                value: value.to_string(),
            }),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
