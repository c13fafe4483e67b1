//! Transport seam and its reqwest implementation.
//!
//! The executor only needs "open this URL at this offset and give me a byte
//! stream", so that is all [`Transport`] exposes. Tests substitute slow or
//! failing fakes to exercise cancellation and resume.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use tracing::{debug, instrument};
use url::Url;

use super::error::TransferError;

/// Boxed body stream returned by a transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// An opened response, positioned at the start of its body.
pub struct TransportResponse {
    /// HTTP status code (200 or 206 for successful opens).
    pub status: u16,
    /// Length of *this* body, when advertised.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl TransportResponse {
    /// Returns true when the source honored the requested byte range.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Total size of the remote file given the offset that was requested.
    #[must_use]
    pub fn total_size(&self, offset: u64) -> Option<u64> {
        if self.is_partial() {
            self.content_length
                .map(|remaining| offset.saturating_add(remaining))
        } else {
            self.content_length
        }
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Opens byte streams for resolved URLs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens `url`, asking for bytes from `offset` onwards when `offset > 0`.
    ///
    /// Non-2xx responses are errors. A source that ignores the range answers
    /// 200 with the full body; callers must check [`TransportResponse::is_partial`].
    async fn open(&self, url: &str, offset: u64) -> Result<TransportResponse, TransferError>;
}

/// HTTP transport backed by a pooled reqwest client.
///
/// No read timeout is set: a stalled transfer stays `downloading` until it is
/// paused, cancelled or reclaimed after a restart.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds a transport with the given connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Client`] if the client cannot be built.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .gzip(true)
            .build()
            .map_err(TransferError::Client)?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self), fields(url = %url))]
    async fn open(&self, url: &str, offset: u64) -> Result<TransportResponse, TransferError> {
        Url::parse(url).map_err(|_| TransferError::invalid_url(url))?;

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::http_status(url, status.as_u16()));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        debug!(status = status.as_u16(), ?content_length, "response opened");

        let stream_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| TransferError::network(stream_url.clone(), e)));

        Ok(TransportResponse {
            status: status.as_u16(),
            content_length,
            body: Box::pin(body),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    async fn collect(mut body: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_open_full_body() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&mock_server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .open(&format!("{}/file.bin", mock_server.uri()), 0)
            .await
            .unwrap();

        assert!(!response.is_partial());
        assert_eq!(response.total_size(0), Some(10));
        assert_eq!(collect(response.body).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_open_sends_range_header_for_offset() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("range", "bytes=4-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"456789".to_vec()))
            .mount(&mock_server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .open(&format!("{}/file.bin", mock_server.uri()), 4)
            .await
            .unwrap();

        assert!(response.is_partial());
        assert_eq!(response.total_size(4), Some(10));
        assert_eq!(collect(response.body).await, b"456789");
    }

    #[tokio::test]
    async fn test_open_maps_error_status() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let result = transport
            .open(&format!("{}/gone", mock_server.uri()), 0)
            .await;

        assert!(matches!(
            result,
            Err(TransferError::HttpStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_url() {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let result = transport.open("not a url", 0).await;
        assert!(matches!(result, Err(TransferError::InvalidUrl { .. })));
    }
}
