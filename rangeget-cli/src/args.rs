//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;
use rangeget::{ConfigFile, DownloadConfig};

use crate::error::CliError;

/// Download a file over several parallel connections, resuming where a
/// previous attempt stopped.
#[derive(Debug, Parser)]
#[command(name = "rangeget", version, about)]
pub struct Args {
    /// URL to download
    pub url: String,

    /// Output file (defaults to the name suggested by the server)
    pub file: Option<PathBuf>,

    /// Directory to save into
    #[arg(short = 'd', long)]
    pub directory: Option<PathBuf>,

    /// Maximum parallel connections
    #[arg(short = 'c', long)]
    pub connections: Option<usize>,

    /// Extra request header, e.g. -H "Authorization: Bearer abc"
    #[arg(short = 'H', long = "header", value_name = "KEY: VALUE")]
    pub headers: Vec<String>,

    /// Config file (defaults to ~/.rangeget/config.ini)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print log output to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Hide the progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Build the download configuration: config file defaults first,
    /// command-line flags on top.
    pub fn to_config(&self, file: &ConfigFile) -> Result<DownloadConfig, CliError> {
        let mut config = file.apply(DownloadConfig::new(self.url.clone()));

        config = match (&self.directory, &self.file) {
            (Some(directory), Some(name)) => {
                config.with_target(directory, Some(name.to_string_lossy().into_owned()))
            }
            (Some(directory), None) => config.with_target(directory, None),
            (None, Some(path)) => config.with_output_path(path),
            (None, None) => config.with_target(".", None),
        };

        if let Some(connections) = self.connections {
            config = config.with_connections(connections);
        }
        for raw in &self.headers {
            let (name, value) = parse_header(raw)?;
            config = config.with_header(name, value);
        }
        Ok(config)
    }
}

/// Split a `Key: Value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String), CliError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| CliError::Config(format!("header '{}' must look like 'Key: Value'", raw)))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::Config(format!("header '{}' has no name", raw)));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangeget::Output;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("rangeget").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization: Bearer a:b").unwrap(),
            ("Authorization".to_string(), "Bearer a:b".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let args = parse(&[
            "http://example.com/a.iso",
            "-c",
            "8",
            "-H",
            "X-Token: abc",
            "-d",
            "/tmp/downloads",
        ]);
        let file = ConfigFile::parse("[download]\nconnections = 2\nmax_errors = 7\n").unwrap();
        let config = args.to_config(&file).unwrap();

        assert_eq!(config.connections, 8);
        assert_eq!(config.max_errors, 7);
        assert_eq!(config.headers["X-Token"], "abc");
        assert_eq!(
            config.output,
            Output::Target {
                directory: PathBuf::from("/tmp/downloads"),
                file: None,
            }
        );
    }

    #[test]
    fn test_output_path_argument() {
        let args = parse(&["http://example.com/a.iso", "out/b.iso"]);
        let config = args.to_config(&ConfigFile::default()).unwrap();
        assert_eq!(config.output, Output::Path(PathBuf::from("out/b.iso")));
        assert_eq!(config.connections, 4);

        let args = parse(&["http://example.com/a.iso", "b.iso", "-d", "/srv"]);
        let config = args.to_config(&ConfigFile::default()).unwrap();
        assert_eq!(
            config.output,
            Output::Target {
                directory: PathBuf::from("/srv"),
                file: Some("b.iso".to_string()),
            }
        );
    }

    #[test]
    fn test_config_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[download]\nconnections = 6\nuser_agent = custom/1.0\n").unwrap();

        let args = parse(&["http://example.com/a.iso", "--config", path.to_str().unwrap()]);
        let file = ConfigFile::load_from(args.config.as_deref().unwrap()).unwrap();
        let config = args.to_config(&file).unwrap();
        assert_eq!(config.connections, 6);
        assert_eq!(config.user_agent, "custom/1.0");
    }
}
