//! Resumable multi-connection file downloader.
//!
//! Several [`worker::RangeWorker`]s fetch disjoint byte ranges and push them
//! through a bounded queue to a single [`writer::SequentialWriter`], which
//! writes every chunk at its offset and records progress in a small
//! `<file>.metadata` sidecar. An interrupted download picks up only the
//! ranges that never reached the disk.

pub mod bucket;
pub mod downloader;
pub mod limiter;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod state_manager;
pub mod tracker;
pub mod worker;
pub mod writer;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::bucket::TokenBucket;
    pub use crate::downloader::{
        DownloadError, DownloadOptions, DownloadOutcome, DownloadStatus, Downloader,
    };
    pub use crate::limiter::{LimiterPolicy, RateLimiter};
    pub use crate::models::{Chunk, Range, Span};
    pub use crate::source::{ByteStream, FetchError, HttpSource, RangeSource};
    pub use crate::tracker::{CoveredSet, RangeTracker};
}
