//! Error types for a single connection.

use std::io;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::codec::ContentEncoding;
use crate::pool::PoolError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors that end one connection.
///
/// Everything except storage and bookkeeping failures is transient: the
/// worker's range can be requested again by a fresh connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("received non-success HTTP status {status} from {url}")]
    Status { status: StatusCode, url: Url },

    #[error("server ignored the Range request for offset {offset}")]
    RangeIgnored { offset: u64 },

    #[error("server applied {} encoding to a ranged response", .0.as_str())]
    UnexpectedEncoding(ContentEncoding),

    #[error("invalid request header: {0}")]
    InvalidHeader(String),

    #[error("failed to decode response body: {0}")]
    Decode(#[source] io::Error),

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("no data received for {}s", .0.as_secs())]
    IdleTimeout(Duration),

    #[error("no response received within {0:?}")]
    ResponseTimeout(Duration),

    #[error("response body ended with {remaining} bytes still expected")]
    UnexpectedEof { remaining: u64 },

    #[error("connection used before {0}")]
    NotReady(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ConnectionError {
    /// Failures that retrying the same range cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Pool(_) | Self::NotReady(_) | Self::InvalidHeader(_)
        )
    }
}
