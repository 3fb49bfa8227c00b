//! Subscription downloads and version probes.

use std::time::Duration;

use reqwest::header::{ETAG, LAST_MODIFIED, RANGE};
use reqwest::{Client, Response};
use sift_compiler::extract_version;
use tokio_util::sync::CancellationToken;

pub const USER_AGENT: &str = concat!("Sift/", env!("CARGO_PKG_VERSION"));

/// Bytes requested by a version probe; enough for any list header.
pub const PROBE_RANGE_BYTES: usize = 4096;

/// Upper bound on a downloaded list.
pub const MAX_LIST_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("Request timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("Response exceeds {0} bytes")]
    TooLarge(usize),
    #[error("Request cancelled")]
    Cancelled,
    #[error("No version marker or cache validator")]
    NoVersion,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err)
        }
    }
}

#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Cheap version token for `url`: the list's `! Version:` marker, or the
    /// server's ETag / Last-Modified when the list has none.
    async fn probe_version(&self, url: &str, cancel: &CancellationToken) -> Result<String, FetchError>;

    /// Full list body.
    async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
    probe_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration, probe_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            probe_timeout,
        })
    }

    async fn probe_inner(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes=0-{}", PROBE_RANGE_BYTES - 1))
            .timeout(self.probe_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            // Servers that ignore Range send the whole list; stop early
            let head = read_body(response, PROBE_RANGE_BYTES, false).await?;
            if let Some(version) = extract_version(&head) {
                return Ok(version);
            }
        } else {
            log::debug!("Ranged probe of {} returned {}", url, response.status());
        }

        let response = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        for name in [ETAG, LAST_MODIFIED] {
            if let Some(value) = response.headers().get(name).and_then(|v| v.to_str().ok()) {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(value.to_string());
                }
            }
        }
        Err(FetchError::NoVersion)
    }

    async fn download_inner(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        read_body(response, MAX_LIST_BYTES, true).await
    }
}

#[async_trait::async_trait]
impl SourceFetcher for HttpFetcher {
    async fn probe_version(&self, url: &str, cancel: &CancellationToken) -> Result<String, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.probe_inner(url) => result,
        }
    }

    async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        log::info!("Downloading filter list {}", url);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.download_inner(url) => result,
        };
        if let Ok(body) = &result {
            log::debug!("Downloaded {} bytes from {}", body.len(), url);
        }
        result
    }
}

/// Read up to `limit` bytes. With `strict`, a longer body is an error;
/// otherwise it is truncated.
async fn read_body(mut response: Response, limit: usize, strict: bool) -> Result<Vec<u8>, FetchError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            if strict {
                return Err(FetchError::TooLarge(limit));
            }
            body.extend_from_slice(&chunk[..limit - body.len()]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
