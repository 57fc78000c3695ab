//! One HTTP range request and its decode-and-write pipeline.
//!
//! A [`Connection`] is bound to a single pool worker. It moves through
//!
//! ```text
//! Pending ──request()──► Connected ──stream()──► Streaming ──► Closed
//!    │                      │                        │
//!    └──────────────────────┴────────────────────────┴──────► Errored
//! ```
//!
//! The connection never retries and never decides what happens after its
//! worker is exhausted; both are the download loop's job.

mod error;
mod headers;

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, RANGE};
use reqwest::{Response, StatusCode, Url};
use tracing::{debug, trace};

use crate::codec::Decoder;
use crate::pool::{SharedPool, WorkerId};
use crate::storage::SharedFile;
use crate::transport::Transport;

pub use error::{ConnectionError, ConnectionResult};
pub use headers::{content_range_total, file_name, file_size, supports_resume, ResponseInfo};

/// `Accept-Encoding` for requests that may receive a compressed body.
const ACCEPT_COMPRESSED: &str = "gzip, deflate";

/// `Accept-Encoding` for ranged requests. Byte offsets only make sense on
/// the identity representation.
const ACCEPT_IDENTITY: &str = "identity";

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Streaming,
    Closed,
    Errored,
}

/// Request parameters shared by every connection of one download.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Url,
    /// Caller headers plus `User-Agent`.
    pub headers: HeaderMap,
    pub transport: Transport,
    /// Maximum wait for the response headers and for each body chunk.
    pub idle_timeout: Duration,
}

/// A single range request bound to one worker.
#[derive(Debug)]
pub struct Connection {
    worker: WorkerId,
    endpoint: Endpoint,
    pool: SharedPool,
    status: ConnectionStatus,
    response: Option<Response>,
    info: Option<ResponseInfo>,
    file: Option<SharedFile>,
}

impl Connection {
    pub fn new(worker: WorkerId, endpoint: Endpoint, pool: SharedPool) -> Self {
        Self {
            worker,
            endpoint,
            pool,
            status: ConnectionStatus::Pending,
            response: None,
            info: None,
            file: None,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn info(&self) -> Option<&ResponseInfo> {
        self.info.as_ref()
    }

    /// Issue the GET request for the worker's remaining range.
    pub async fn request(&mut self) -> ConnectionResult<ResponseInfo> {
        let result = self.send().await;
        if result.is_err() {
            self.status = ConnectionStatus::Errored;
        }
        result
    }

    async fn send(&mut self) -> ConnectionResult<ResponseInfo> {
        let (range, current, bounded) = {
            let pool = self.pool.lock();
            let worker = pool
                .worker(self.worker)
                .ok_or(crate::pool::PoolError::UnknownWorker(self.worker))?;
            (
                worker.range_header(),
                worker.current(),
                worker.limit().is_some(),
            )
        };

        let mut headers = self.endpoint.headers.clone();
        let accept = if bounded {
            ACCEPT_IDENTITY
        } else {
            ACCEPT_COMPRESSED
        };
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(accept));
        if let Some(range) = &range {
            let value = HeaderValue::from_str(range)
                .map_err(|_| ConnectionError::InvalidHeader(range.clone()))?;
            headers.insert(RANGE, value);
        }

        debug!(worker = self.worker, range = ?range, url = %self.endpoint.url, "Requesting range");
        let wait = self.endpoint.idle_timeout;
        let result = tokio::time::timeout(
            wait,
            self.endpoint.transport.get(&self.endpoint.url, &headers),
        )
        .await
        .map_err(|_| ConnectionError::ResponseTimeout(wait))??;
        let response = result.response;
        let status = response.status();

        if !status.is_success() {
            let url = result.visited.last().cloned().unwrap_or_else(|| self.endpoint.url.clone());
            return Err(ConnectionError::Status { status, url });
        }
        if range.is_some() && current > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(ConnectionError::RangeIgnored { offset: current });
        }

        let info = ResponseInfo::from_response(response.headers(), &result.visited);
        if bounded && !info.content_encoding.is_identity() {
            return Err(ConnectionError::UnexpectedEncoding(info.content_encoding));
        }

        debug!(
            worker = self.worker,
            status = %status,
            file_size = ?info.file_size,
            supports_resume = info.supports_resume,
            encoding = info.content_encoding.as_str(),
            "Connected"
        );
        self.status = ConnectionStatus::Connected;
        self.response = Some(response);
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Bind the destination file. Streaming needs both this and a response.
    pub fn attach(&mut self, file: SharedFile) {
        self.file = Some(file);
    }

    /// Stream the body into the file until the worker is exhausted or the
    /// body ends.
    ///
    /// `on_progress` is called with the number of bytes each successful
    /// write advanced the worker by.
    pub async fn stream<F>(&mut self, on_progress: F) -> ConnectionResult<()>
    where
        F: FnMut(u64),
    {
        let result = self.pump(on_progress).await;
        self.status = match result {
            Ok(()) => ConnectionStatus::Closed,
            Err(_) => ConnectionStatus::Errored,
        };
        self.response = None;
        result
    }

    async fn pump<F>(&mut self, mut on_progress: F) -> ConnectionResult<()>
    where
        F: FnMut(u64),
    {
        let file = self.file.clone().ok_or(ConnectionError::NotReady("attach"))?;
        let mut response = self
            .response
            .take()
            .ok_or(ConnectionError::NotReady("request"))?;
        let encoding = self
            .info
            .as_ref()
            .map(|info| info.content_encoding)
            .unwrap_or_default();
        let mut decoder = Decoder::new(encoding);
        self.status = ConnectionStatus::Streaming;

        if self.is_exhausted() {
            return Ok(());
        }

        loop {
            let next = tokio::time::timeout(self.endpoint.idle_timeout, response.chunk()).await;
            let raw = match next {
                Err(_) => return Err(ConnectionError::IdleTimeout(self.endpoint.idle_timeout)),
                Ok(Err(e)) => return Err(ConnectionError::Body(e)),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(raw))) => raw,
            };

            let data = if encoding.is_identity() {
                raw
            } else {
                Bytes::from(decoder.decode(&raw).map_err(ConnectionError::Decode)?)
            };

            if self.write(&file, data, &mut on_progress).await? {
                trace!(worker = self.worker, "Worker range exhausted");
                return Ok(());
            }
        }

        let tail = decoder.finish().map_err(ConnectionError::Decode)?;
        if self.write(&file, Bytes::from(tail), &mut on_progress).await? {
            return Ok(());
        }

        let mut pool = self.pool.lock();
        let remaining = pool
            .worker(self.worker)
            .ok_or(crate::pool::PoolError::UnknownWorker(self.worker))?
            .remaining();
        match remaining {
            // Size-less stream: the end of the body is the end of the file
            None => {
                let length = pool.finalize();
                debug!(worker = self.worker, length, "Stream ended, length finalized");
                Ok(())
            }
            Some(0) => Ok(()),
            Some(remaining) => Err(ConnectionError::UnexpectedEof { remaining }),
        }
    }

    /// Write one decoded chunk at the worker's cursor. Returns true once the
    /// worker has no bytes left.
    async fn write<F>(
        &mut self,
        file: &SharedFile,
        mut data: Bytes,
        on_progress: &mut F,
    ) -> ConnectionResult<bool>
    where
        F: FnMut(u64),
    {
        if data.is_empty() {
            return Ok(self.is_exhausted());
        }

        let grant = self.pool.lock().reserve(self.worker, data.len() as u64)?;
        if grant.len > 0 {
            data.truncate(grant.len as usize);
            if let Err(e) = file.write_at(grant.offset, data).await {
                let _ = self.pool.lock().cancel_reservation(self.worker);
                return Err(e.into());
            }
            self.pool.lock().advance(self.worker, grant.len)?;
            on_progress(grant.len);
        }
        Ok(self.is_exhausted())
    }

    fn is_exhausted(&self) -> bool {
        self.pool
            .lock()
            .worker(self.worker)
            .map(|w| w.is_complete())
            .unwrap_or(true)
    }

    /// Drop the response and detach from the pool.
    pub fn dispose(&mut self) {
        self.response = None;
        if self.status != ConnectionStatus::Errored {
            self.status = ConnectionStatus::Closed;
        }
        let _ = self.pool.lock().cancel_reservation(self.worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolSnapshot, RangePool, WorkerRecord, SNAPSHOT_VERSION};
    use tempfile::TempDir;
    use wiremock::matchers::{header, headers, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(server: &MockServer) -> Endpoint {
        Endpoint {
            url: Url::parse(&format!("{}/file.bin", server.uri())).unwrap(),
            headers: HeaderMap::new(),
            transport: Transport::new(Duration::from_secs(5)).unwrap(),
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_probe_request_reports_response_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(headers("accept-encoding", vec!["gzip", "deflate"]))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .set_body_bytes(vec![7u8; 64]),
            )
            .mount(&server)
            .await;

        let pool = RangePool::new(None).shared();
        let worker = pool.lock().allocate().unwrap();
        let mut connection = Connection::new(worker.id(), endpoint(&server), pool);

        let info = connection.request().await.unwrap();
        assert_eq!(info.file_size, Some(64));
        assert!(info.supports_resume);
        assert_eq!(info.file_name.as_deref(), Some("file.bin"));
        assert_eq!(connection.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let pool = RangePool::new(None).shared();
        let worker = pool.lock().allocate().unwrap();
        let mut connection = Connection::new(worker.id(), endpoint(&server), pool);

        let err = connection.request().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Status { status, .. } if status == StatusCode::NOT_FOUND));
        assert_eq!(connection.status(), ConnectionStatus::Errored);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let pool = RangePool::new(None).shared();
        let worker = pool.lock().allocate().unwrap();
        let mut endpoint = endpoint(&server);
        endpoint.idle_timeout = Duration::from_millis(200);
        let mut connection = Connection::new(worker.id(), endpoint, pool);

        let started = std::time::Instant::now();
        let err = connection.request().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, ConnectionError::ResponseTimeout(d) if d == Duration::from_millis(200)));
        assert!(!err.is_fatal());
        assert_eq!(connection.status(), ConnectionStatus::Errored);
    }

    #[tokio::test]
    async fn test_ranged_request_rejects_ignored_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 32]))
            .mount(&server)
            .await;

        let pool = RangePool::new(Some(32)).shared();
        let worker = pool.lock().allocate().unwrap();
        pool.lock().reserve(worker.id(), 10).unwrap();
        pool.lock().advance(worker.id(), 10).unwrap();

        let mut connection = Connection::new(worker.id(), endpoint(&server), pool);
        let err = connection.request().await.unwrap_err();
        assert!(matches!(err, ConnectionError::RangeIgnored { offset: 10 }));
    }

    #[tokio::test]
    async fn test_stream_crops_at_worker_limit() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..100u8).collect();
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-39"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-39/100")
                    .set_body_bytes(body.clone()),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");
        let file = SharedFile::create_truncated(&path).await.unwrap();

        // Two workers, as after a split: this connection owns the first 40 bytes.
        let snapshot = PoolSnapshot {
            version: SNAPSHOT_VERSION,
            length: Some(100),
            last_chunk_id: 2,
            workers: vec![
                WorkerRecord {
                    id: 1,
                    start: 0,
                    current: 0,
                    limit: Some(40),
                },
                WorkerRecord {
                    id: 2,
                    start: 40,
                    current: 40,
                    limit: Some(100),
                },
            ],
        };
        let restored = RangePool::restore(snapshot).unwrap().shared();
        let worker = restored.lock().allocate().unwrap();
        assert_eq!(worker.limit(), Some(40));

        let mut connection = Connection::new(worker.id(), endpoint(&server), restored.clone());
        connection.request().await.unwrap();
        connection.attach(file);

        let mut progressed = 0;
        connection.stream(|n| progressed += n).await.unwrap();

        assert_eq!(progressed, 40);
        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert_eq!(std::fs::read(&path).unwrap(), body[..40].to_vec());
        assert!(restored.lock().worker(1).unwrap().is_complete());
        assert_eq!(restored.lock().completed_bytes(), 40);
    }

    #[tokio::test]
    async fn test_stream_before_attach_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 8]))
            .mount(&server)
            .await;

        let pool = RangePool::new(None).shared();
        let worker = pool.lock().allocate().unwrap();
        let mut connection = Connection::new(worker.id(), endpoint(&server), pool);
        connection.request().await.unwrap();

        let err = connection.stream(|_| {}).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotReady("attach")));
    }

    #[tokio::test]
    async fn test_unbounded_stream_finalizes_length() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 1000]))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");
        let file = SharedFile::create_truncated(&path).await.unwrap();

        let pool = RangePool::new(None).shared();
        let worker = pool.lock().allocate().unwrap();
        let mut connection = Connection::new(worker.id(), endpoint(&server), pool.clone());
        connection.request().await.unwrap();
        connection.attach(file);
        connection.stream(|_| {}).await.unwrap();

        assert_eq!(pool.lock().length(), Some(1000));
        assert!(pool.lock().has_completed());
        assert_eq!(std::fs::read(&path).unwrap().len(), 1000);
    }
}
