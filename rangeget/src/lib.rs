//! rangeget - multi-connection, resumable HTTP downloads
//!
//! A single resource is fetched over several concurrent byte-range
//! requests, each written straight to its offset in one destination file.
//! Progress is persisted to a side-car manifest so an interrupted download
//! picks up where it stopped.
//!
//! # Example
//!
//! ```no_run
//! use rangeget::{download, DownloadConfig, DownloadEvent};
//!
//! # async fn run() -> Result<(), rangeget::DownloadError> {
//! let config = DownloadConfig::new("https://example.com/big.iso")
//!     .with_target("/tmp", None)
//!     .with_connections(8);
//! let (download, mut events) = download(config)?;
//! let task = tokio::spawn(download.run());
//!
//! while let Some(event) = events.recv().await {
//!     if let DownloadEvent::Progress(progress) = event {
//!         println!("{:?}%", progress.percent);
//!     }
//! }
//! let _outcome = task.await.expect("download task panicked")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`pool`]: byte-range allocation and rebalancing
//! - [`connection`]: one range request and its decode-and-write pipeline
//! - [`download`]: the orchestrator
//! - [`manifest`]: resume state on disk

pub mod codec;
pub mod config;
pub mod connection;
pub mod download;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod pool;
pub mod storage;
pub mod transport;

pub use config::{ConfigError, ConfigFile, DownloadConfig, Output};
pub use download::{
    download, DisposeHandle, Download, DownloadEvent, DownloadEvents, DownloadOutcome, Progress,
    RetryPolicy, StartInfo, Summary,
};
pub use error::{DownloadError, DownloadResult};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
