//! HTTP transport with explicit redirect tracking.
//!
//! Redirects are followed by hand instead of by reqwest so that every
//! visited URL is known: the file name of a download is often only present
//! in an intermediate URL of the redirect chain.

use std::time::Duration;

use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Client, Response, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

/// Maximum number of redirects followed for one request.
pub const MAX_REDIRECTS: usize = 10;

/// Errors raised while issuing a request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout { url: Url },

    #[error("too many redirects (more than {MAX_REDIRECTS}) starting at {0}")]
    TooManyRedirects(Url),

    #[error("redirect from {url} has an invalid Location header")]
    InvalidRedirect { url: Url },
}

/// A response together with the chain of URLs visited to obtain it.
#[derive(Debug)]
pub struct TransportResponse {
    pub response: Response,
    /// Requested URL first, final URL last.
    pub visited: Vec<Url>,
}

/// Streaming HTTP client shared by all connections of a download.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
}

impl Transport {
    /// Create a transport with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    /// Issue a GET request, following redirects.
    pub async fn get(
        &self,
        url: &Url,
        headers: &HeaderMap,
    ) -> Result<TransportResponse, TransportError> {
        let mut visited = vec![url.clone()];
        let mut current = url.clone();

        loop {
            let response = self
                .client
                .get(current.clone())
                .headers(headers.clone())
                .send()
                .await
                .map_err(|source| {
                    if source.is_timeout() {
                        TransportError::Timeout {
                            url: current.clone(),
                        }
                    } else {
                        TransportError::Request {
                            url: current.clone(),
                            source,
                        }
                    }
                })?;

            if !is_redirect(response.status()) {
                return Ok(TransportResponse { response, visited });
            }

            if visited.len() > MAX_REDIRECTS {
                return Err(TransportError::TooManyRedirects(url.clone()));
            }

            let next = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| current.join(location).ok())
                .ok_or_else(|| TransportError::InvalidRedirect {
                    url: current.clone(),
                })?;

            debug!(from = %current, to = %next, status = %response.status(), "Following redirect");
            visited.push(next.clone());
            current = next;
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_is_redirect() {
        assert!(is_redirect(StatusCode::FOUND));
        assert!(is_redirect(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
        assert!(!is_redirect(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_follows_redirect_chain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/files/data.bin"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/data.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let transport = Transport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/start", server.uri())).unwrap();
        let result = transport.get(&url, &HeaderMap::new()).await.unwrap();

        assert_eq!(result.response.status(), StatusCode::OK);
        assert_eq!(result.visited.len(), 2);
        assert_eq!(result.visited[1].path(), "/files/data.bin");
    }

    #[tokio::test]
    async fn test_redirect_loop_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/loop"))
            .mount(&server)
            .await;

        let transport = Transport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/loop", server.uri())).unwrap();
        let err = transport.get(&url, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::TooManyRedirects(_)));
    }

    #[tokio::test]
    async fn test_redirect_without_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(307))
            .mount(&server)
            .await;

        let transport = Transport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let err = transport.get(&url, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRedirect { .. }));
    }
}
