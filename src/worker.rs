// src/worker.rs

use crate::bucket::TokenBucket;
use crate::models::{Chunk, Span};
use crate::queue::{ChunkSender, QueueClosed};
use crate::source::{FetchError, RangeSource};
use bytes::Bytes;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("stream for {span} ended after {got} of {expected} bytes")]
    ShortRead { span: Span, expected: u64, got: u64 },
    #[error("the writer stopped accepting chunks")]
    WriterClosed,
    #[error("worker cancelled")]
    Cancelled,
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<QueueClosed> for WorkerError {
    fn from(_: QueueClosed) -> Self {
        WorkerError::WriterClosed
    }
}

/// What a worker accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: usize,
    /// Bytes handed to the writer.
    pub bytes: u64,
    /// Offset just past the last byte of the last span fetched.
    pub end_offset: u64,
}

/// Rate limiting handle for a worker.
///
/// Tokens are withdrawn in slices of at most `quantum` so a block larger
/// than one refill can still get through.
#[derive(Debug, Clone)]
pub struct Throttle {
    bucket: Arc<TokenBucket>,
    quantum: u64,
}

impl Throttle {
    pub fn new(bucket: Arc<TokenBucket>, quantum: u64) -> Self {
        Self { bucket, quantum: quantum.max(1) }
    }
}

/// Fetches byte spans of one URL and feeds them to the writer queue.
pub struct RangeWorker {
    id: usize,
    url: String,
    source: Arc<dyn RangeSource>,
    sender: ChunkSender,
    throttle: Option<Throttle>,
    cancel: CancellationToken,
}

impl RangeWorker {
    pub fn new(
        id: usize,
        url: impl Into<String>,
        source: Arc<dyn RangeSource>,
        sender: ChunkSender,
        throttle: Option<Throttle>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, url: url.into(), source, sender, throttle, cancel }
    }

    /// Fetches `spans` one after another.
    ///
    /// Never sends the end marker; that is the pipeline's job once every
    /// worker is done.
    pub async fn run(self, spans: Vec<Span>) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport { id: self.id, bytes: 0, end_offset: 0 };
        for span in spans {
            report.end_offset = span.start;
            if span.is_empty() {
                continue;
            }
            let end = self.fetch_span(span).await?;
            report.bytes += end - span.start;
            report.end_offset = end;
        }
        info!("Worker {}: finished after {} bytes.", self.id, report.bytes);
        Ok(report)
    }

    async fn fetch_span(&self, span: Span) -> Result<u64, WorkerError> {
        debug!("Worker {}: fetching {}.", self.id, span);
        let mut stream = self.or_cancel(self.source.fetch(&self.url, span)).await??;

        let mut offset = span.start;
        while let Some(block) = self.or_cancel(stream.next()).await? {
            let mut block = block?;
            if let Some(end) = span.end {
                let allowed = end.saturating_sub(offset);
                if (block.len() as u64) > allowed {
                    block.truncate(allowed as usize);
                }
            }
            offset = self.deliver(offset, block).await?;
            if span.end == Some(offset) {
                break;
            }
        }

        if let Some(end) = span.end {
            if offset < end {
                return Err(WorkerError::ShortRead {
                    span,
                    expected: end - span.start,
                    got: offset - span.start,
                });
            }
        }
        Ok(offset)
    }

    /// Hands `block` to the writer, paying for it first if throttled.
    async fn deliver(&self, mut offset: u64, mut block: Bytes) -> Result<u64, WorkerError> {
        while !block.is_empty() {
            let piece = match &self.throttle {
                Some(throttle) => {
                    let take = block.len().min(throttle.quantum as usize);
                    if !self.or_cancel(throttle.bucket.take(take as u64)).await? {
                        return Err(WorkerError::Cancelled);
                    }
                    block.split_to(take)
                }
                None => std::mem::take(&mut block),
            };

            let len = piece.len() as u64;
            self.or_cancel(self.sender.send(Chunk::new(offset, piece))).await??;
            trace!("Worker {}: queued {} bytes at {}.", self.id, len, offset);
            offset += len;
        }
        Ok(offset)
    }

    async fn or_cancel<F: Future>(&self, fut: F) -> Result<F::Output, WorkerError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WorkerError::Cancelled),
            out = fut => Ok(out),
        }
    }
}
