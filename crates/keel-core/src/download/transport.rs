//! Byte transport behind the download orchestrator.
//!
//! The orchestrator only needs "open this URL from offset N and give me a
//! stream of chunks"; [`HttpTransport`] provides that over reqwest. Tests
//! plug in an in-memory implementation.

use crate::config::NetworkConfig;
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// An opened transfer.
pub struct TransferResponse {
    pub status: u16,
    /// The server honoured the requested range.
    pub partial: bool,
    /// Length of the body that follows, if announced.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("status", &self.status)
            .field("partial", &self.partial)
            .field("content_length", &self.content_length)
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start fetching `url`, asking for bytes from `resume_from` onward when
    /// it is non-zero. Non-success responses are errors.
    async fn open(&self, url: &str, resume_from: u64) -> Result<TransferResponse>;
}

/// HTTP(S) transport over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_settings(NetworkConfig::USER_AGENT, NetworkConfig::CONNECT_TIMEOUT)
    }

    pub fn with_settings(user_agent: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| KeelError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str, resume_from: u64) -> Result<TransferResponse> {
        let mut request = self.client.get(url);
        if resume_from > 0 {
            debug!("Requesting {} from byte {}", url, resume_from);
            request = request.header(header::RANGE, format!("bytes={}-", resume_from));
        }

        let response = request.send().await.map_err(|e| KeelError::Network {
            message: format!("GET {} failed: {}", url, e),
            cause: Some(e.to_string()),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeelError::DownloadFailed {
                url: url.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let partial = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(KeelError::from))
            .boxed();

        Ok(TransferResponse {
            status: status.as_u16(),
            partial,
            content_length,
            body,
        })
    }
}
