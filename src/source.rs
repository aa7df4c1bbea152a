// src/source.rs

use crate::models::Span;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Body of a range fetch, one network block at a time.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server returned an unsuccessful status code: {0}")]
    Unsuccessful(StatusCode),
    #[error("server ignored the range request starting at byte {0}")]
    RangeIgnored(u64),
    #[error("{0}")]
    Other(String),
}

/// Where the bytes come from.
///
/// `fetch` yields the bytes of `span` in order; the stream may end with an
/// error part way through.
#[async_trait]
pub trait RangeSource: Send + Sync + 'static {
    /// Size of the resource, if the server tells.
    async fn content_length(&self, url: &str) -> Result<Option<u64>, FetchError>;

    async fn fetch(&self, url: &str, span: Span) -> Result<ByteStream, FetchError>;
}

/// [`RangeSource`] over HTTP `Range` requests.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    probe_timeout: Duration,
}

impl HttpSource {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: Client, probe_timeout: Duration) -> Self {
        Self { client, probe_timeout }
    }
}

#[async_trait]
impl RangeSource for HttpSource {
    async fn content_length(&self, url: &str) -> Result<Option<u64>, FetchError> {
        let resp = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;
        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        Ok(size)
    }

    async fn fetch(&self, url: &str, span: Span) -> Result<ByteStream, FetchError> {
        let mut request = self.client.get(url);
        if span.start > 0 || span.end.is_some() {
            request = request.header(RANGE, span.header_value());
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Unsuccessful(status));
        }
        // A plain 200 carries the whole body from byte 0.
        if status != StatusCode::PARTIAL_CONTENT && span.start > 0 {
            return Err(FetchError::RangeIgnored(span.start));
        }
        if status == StatusCode::PARTIAL_CONTENT {
            if let Some(served) = content_range_start(resp.headers()) {
                if served != span.start {
                    debug!("Source: asked for {} but {} served from {}.", span, url, served);
                    return Err(FetchError::RangeIgnored(span.start));
                }
            }
        }
        debug!("Source: {} answered {} for {}.", url, status, span);

        Ok(resp.bytes_stream().map_err(FetchError::from).boxed())
    }
}

/// First byte of a `Content-Range: bytes <first>-<last>/<size>` header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (first, _) = range.split_once('-')?;
    first.trim().parse().ok()
}


#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// An in-memory resource served in fixed-size blocks.
    pub struct MemorySource {
        data: Bytes,
        block: usize,
        known_size: bool,
        fail_at: Option<u64>,
        fetches: AtomicUsize,
    }

    impl MemorySource {
        pub fn new(data: impl Into<Bytes>) -> Self {
            Self {
                data: data.into(),
                block: 7,
                known_size: true,
                fail_at: None,
                fetches: AtomicUsize::new(0),
            }
        }

        pub fn block_size(mut self, block: usize) -> Self {
            self.block = block.max(1);
            self
        }

        pub fn unknown_size(mut self) -> Self {
            self.known_size = false;
            self
        }

        /// Breaks any stream that reaches `offset`.
        pub fn fail_at(mut self, offset: u64) -> Self {
            self.fail_at = Some(offset);
            self
        }

        pub fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RangeSource for MemorySource {
        async fn content_length(&self, _url: &str) -> Result<Option<u64>, FetchError> {
            Ok(self.known_size.then_some(self.data.len() as u64))
        }

        async fn fetch(&self, _url: &str, span: Span) -> Result<ByteStream, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let len = self.data.len() as u64;
            let end = span.end.unwrap_or(len).min(len);
            let mut items = Vec::new();
            let mut offset = span.start.min(end);
            while offset < end {
                let stop = (offset + self.block as u64).min(end);
                if let Some(fail) = self.fail_at {
                    if offset <= fail && fail < stop {
                        if fail > offset {
                            items.push(Ok(self.data.slice(offset as usize..fail as usize)));
                        }
                        items.push(Err(FetchError::Other(format!("connection reset at {fail}"))));
                        break;
                    }
                }
                items.push(Ok(self.data.slice(offset as usize..stop as usize)));
                offset = stop;
            }
            Ok(stream::iter(items).boxed())
        }
    }
}
