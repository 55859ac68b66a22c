//! Remote archives read with HTTP Range requests.

use async_trait::async_trait;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, HeaderName, RANGE};
use reqwest::{Client, StatusCode};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::ReadAt;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries for requests that time out or fail to connect.
///
/// The n-th retry waits `backoff * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per range request, the first one included
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_millis(500),
        }
    }
}

/// A remote file served in byte ranges.
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    transferred_bytes: AtomicU64,
    retry: RetryPolicy,
}

impl HttpRangeReader {
    /// Open `url` with a default client.
    pub async fn new(url: String) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(client, url).await
    }

    /// Open `url` with a caller-configured client.
    ///
    /// A HEAD request fetches the size and checks that the server
    /// advertises byte ranges.
    pub async fn with_client(client: Client, url: String) -> Result<Self> {
        let resp = client.head(&url).send().await?.error_for_status()?;
        let size = remote_size(resp.headers())?;
        debug!(%url, size, "opened remote archive");

        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Payload bytes received so far, over all requests.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// Request the bytes from `start` to fill `dest` and copy in what the
    /// server sends. Returns the number of bytes copied.
    async fn fetch_range(&self, start: u64, dest: &mut [u8]) -> Result<usize> {
        let last = start + dest.len() as u64 - 1;
        let range = format!("bytes={start}-{last}");
        let mut attempt = 1;

        let resp = loop {
            match self.client.get(&self.url).header(RANGE, &range).send().await {
                Ok(resp) => break resp,
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.retry.attempts => {
                    warn!(%range, attempt, max = self.retry.attempts, error = %e, "range request failed, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        // A plain 200 would carry the whole file from offset zero
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(unsupported(format!(
                "range request {range} answered with status {}",
                resp.status()
            )));
        }

        let body = resp.bytes().await?;
        let n = body.len().min(dest.len());
        dest[..n].copy_from_slice(&body[..n]);
        self.transferred_bytes.fetch_add(n as u64, Ordering::Relaxed);
        trace!(%range, received = n, "range fetched");
        Ok(n)
    }
}

/// File size from a HEAD response that advertises byte ranges.
fn remote_size(headers: &HeaderMap) -> Result<u64> {
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    if !header(ACCEPT_RANGES).is_some_and(|v| v.contains("bytes")) {
        return Err(unsupported("remote server does not support Range requests"));
    }
    header(CONTENT_LENGTH)
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| unsupported("remote server did not return Content-Length"))
}

fn unsupported(message: impl Into<String>) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Unsupported, message.into()))
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    /// Servers may answer a range with fewer bytes than asked for; the
    /// remainder is requested again until the buffer or the file is full.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let wanted = (self.size - offset).min(buf.len() as u64) as usize;
        let mut filled = 0;
        while filled < wanted {
            let n = self
                .fetch_range(offset + filled as u64, &mut buf[filled..wanted])
                .await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
