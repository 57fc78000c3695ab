//! Top-level error type of a download.

use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::manifest::ManifestError;
use crate::pool::{PoolError, WorkerId};
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Result type for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors surfaced by a download.
///
/// Cheap to clone: sources without `Clone` are shared, so the same failure
/// can be both reported through [`DownloadEvent::Error`] and returned from
/// [`Download::run`].
///
/// [`DownloadEvent::Error`]: crate::download::DownloadEvent::Error
/// [`Download::run`]: crate::download::Download::run
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(Arc<TransportError>),

    #[error("initial request failed: {0}")]
    Probe(#[source] Arc<ConnectionError>),

    #[error("connection for worker {worker} failed: {source}")]
    Connection {
        worker: WorkerId,
        #[source]
        source: Arc<ConnectionError>,
    },

    #[error(transparent)]
    Storage(Arc<StorageError>),

    #[error(transparent)]
    Manifest(Arc<ManifestError>),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("giving up after {errors} connection errors")]
    ErrorBudgetExhausted { errors: u32 },

    #[error("server does not support ranges and the single stream failed: {0}")]
    SequentialStreamFailed(#[source] Arc<ConnectionError>),

    #[error("download stalled: {0}")]
    Stalled(String),
}

impl From<TransportError> for DownloadError {
    fn from(error: TransportError) -> Self {
        Self::Transport(Arc::new(error))
    }
}

impl From<StorageError> for DownloadError {
    fn from(error: StorageError) -> Self {
        Self::Storage(Arc::new(error))
    }
}

impl From<ManifestError> for DownloadError {
    fn from(error: ManifestError) -> Self {
        Self::Manifest(Arc::new(error))
    }
}

impl DownloadError {
    /// Whether the download keeps going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection { source, .. } if !source.is_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let transient = DownloadError::Connection {
            worker: 2,
            source: Arc::new(ConnectionError::UnexpectedEof { remaining: 5 }),
        };
        assert!(transient.is_recoverable());

        let fatal = DownloadError::Connection {
            worker: 2,
            source: Arc::new(ConnectionError::Storage(StorageError::Task(
                "cancelled".to_string(),
            ))),
        };
        assert!(!fatal.is_recoverable());

        let budget = DownloadError::ErrorBudgetExhausted { errors: 20 };
        assert!(!budget.is_recoverable());
        assert_eq!(budget.to_string(), "giving up after 20 connection errors");
    }
}
