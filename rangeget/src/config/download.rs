//! Per-download configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::Url;

use super::ConfigError;
use crate::download::RetryPolicy;

/// Connections requested when the caller does not say.
pub const DEFAULT_CONNECTIONS: usize = 4;

/// File name used when neither the caller nor the server provides one.
pub const DEFAULT_FILE_NAME: &str = "download";

/// Where the downloaded file goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// A directory, and optionally the file name inside it. Without a file
    /// name the server's suggestion is used.
    Target {
        directory: PathBuf,
        file: Option<String>,
    },
    /// A single path. An existing directory behaves like
    /// `Target { directory, file: None }`; anything else is the file itself.
    Path(PathBuf),
}

impl Default for Output {
    fn default() -> Self {
        Self::Target {
            directory: PathBuf::from("."),
            file: None,
        }
    }
}

impl Output {
    /// Final destination path given the file name the server suggested.
    pub fn resolve(&self, suggested: Option<&str>) -> PathBuf {
        let fallback = || suggested.unwrap_or(DEFAULT_FILE_NAME).to_string();
        match self {
            Self::Target { directory, file } => {
                directory.join(file.clone().unwrap_or_else(fallback))
            }
            Self::Path(path) if path.is_dir() => path.join(fallback()),
            Self::Path(path) => path.clone(),
        }
    }
}

/// Configuration for one download.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Resource to fetch.
    pub url: String,

    /// Destination of the downloaded file.
    pub output: Output,

    /// Extra request headers sent on every request.
    pub headers: BTreeMap<String, String>,

    /// Desired number of parallel connections.
    pub connections: usize,

    pub user_agent: String,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Maximum wait for response headers and for each body chunk.
    pub idle_timeout: Duration,

    /// How often the manifest is rewritten while downloading.
    pub manifest_interval: Duration,

    /// Connection errors tolerated before the download is abandoned.
    pub max_errors: u32,

    /// Delay between retries of a failed range.
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            output: Output::default(),
            headers: BTreeMap::new(),
            connections: DEFAULT_CONNECTIONS,
            user_agent: format!("rangeget/{}", crate::VERSION),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            manifest_interval: Duration::from_secs(5),
            max_errors: 20,
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadConfig {
    /// Create a configuration for the given URL, saving into the current
    /// directory.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Save into a directory, optionally with a fixed file name.
    pub fn with_target(mut self, directory: impl Into<PathBuf>, file: Option<String>) -> Self {
        self.output = Output::Target {
            directory: directory.into(),
            file,
        };
        self
    }

    /// Save to a path (a file, or an existing directory).
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Output::Path(path.into());
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_connections(mut self, connections: usize) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_manifest_interval(mut self, interval: Duration) -> Self {
        self.manifest_interval = interval;
        self
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check and normalize the configuration.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let url = Url::parse(self.url.trim()).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }
        if self.connections == 0 {
            return Err(ConfigError::Zero {
                field: "connections",
            });
        }
        if self.max_errors == 0 {
            return Err(ConfigError::Zero {
                field: "max_errors",
            });
        }

        let mut headers = HeaderMap::new();
        let user_agent =
            HeaderValue::from_str(&self.user_agent).map_err(|e| ConfigError::InvalidHeader {
                name: USER_AGENT.to_string(),
                reason: e.to_string(),
            })?;
        headers.insert(USER_AGENT, user_agent);
        for (name, value) in &self.headers {
            let header_name =
                HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                    ConfigError::InvalidHeader {
                        name: name.clone(),
                        reason: e.to_string(),
                    }
                })?;
            let header_value =
                HeaderValue::from_str(value.trim()).map_err(|e| ConfigError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            headers.insert(header_name, header_value);
        }

        Ok(ValidatedConfig {
            url,
            output: self.output,
            headers,
            connections: self.connections,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            manifest_interval: self.manifest_interval,
            max_errors: self.max_errors,
            retry: self.retry,
        })
    }
}

/// A checked [`DownloadConfig`].
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub url: Url,
    pub output: Output,
    /// Caller headers plus `User-Agent`.
    pub headers: HeaderMap,
    pub connections: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub manifest_interval: Duration,
    pub max_errors: u32,
    pub retry: RetryPolicy,
}

impl ValidatedConfig {
    pub fn destination(&self, suggested: Option<&str>) -> PathBuf {
        self.output.resolve(suggested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = DownloadConfig::new("http://example.com/a.bin");
        assert_eq!(config.connections, 4);
        assert_eq!(config.max_errors, 20);
        assert_eq!(config.manifest_interval, Duration::from_secs(5));
        assert!(config.user_agent.starts_with("rangeget/"));
        assert_eq!(config.output, Output::default());
    }

    #[test]
    fn test_builder_pattern() {
        let config = DownloadConfig::new("https://example.com/a.bin")
            .with_target("/tmp/out", Some("b.bin".to_string()))
            .with_header("Authorization", "Bearer abc")
            .with_connections(8)
            .with_idle_timeout(Duration::from_secs(10))
            .with_max_errors(3);

        let validated = config.validate().unwrap();
        assert_eq!(validated.connections, 8);
        assert_eq!(validated.max_errors, 3);
        assert_eq!(validated.headers["authorization"], "Bearer abc");
        assert!(validated.headers.contains_key(USER_AGENT));
        assert_eq!(
            validated.destination(Some("ignored.bin")),
            PathBuf::from("/tmp/out/b.bin")
        );
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let err = DownloadConfig::new("not a url").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));

        let err = DownloadConfig::new("ftp://example.com/a")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(scheme) if scheme == "ftp"));

        let err = DownloadConfig::new("http://example.com/a")
            .with_connections(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "connections" }));

        let err = DownloadConfig::new("http://example.com/a")
            .with_header("Bad Header", "x")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeader { .. }));
    }

    #[test]
    fn test_output_resolution() {
        let temp = TempDir::new().unwrap();

        let target = Output::Target {
            directory: temp.path().to_path_buf(),
            file: None,
        };
        assert_eq!(
            target.resolve(Some("server.zip")),
            temp.path().join("server.zip")
        );
        assert_eq!(target.resolve(None), temp.path().join(DEFAULT_FILE_NAME));

        let dir_path = Output::Path(temp.path().to_path_buf());
        assert_eq!(dir_path.resolve(Some("a.iso")), temp.path().join("a.iso"));

        let file_path = Output::Path(temp.path().join("chosen.bin"));
        assert_eq!(
            file_path.resolve(Some("a.iso")),
            temp.path().join("chosen.bin")
        );
    }
}
