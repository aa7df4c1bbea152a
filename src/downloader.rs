use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use thiserror::Error;
use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::limiter::LimiterPolicy;
use crate::pipeline::{plan_assignments, Pipeline, PipelineReport};
use crate::source::{HttpSource, RangeSource};
use crate::state_manager::StateError;
use crate::tracker::RangeTracker;
use crate::worker::WorkerError;
use crate::writer::{open_destination, WriterError};

/// Errors that end a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("network failure: {0}")]
    Network(#[from] WorkerError),
    #[error("write failure: {0}")]
    Write(#[from] WriterError),
    #[error("progress sidecar error: {0}")]
    State(#[from] StateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download incomplete: {covered} bytes on disk, total {total:?}")]
    Incomplete { covered: u64, total: Option<u64> },
    #[error("download cancelled")]
    Cancelled,
}

/// Download status enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadStatus {
    Init,
    Running,
    Succeeded,
    Failed,
}

/// Options for a download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub url: String,
    /// Directory receiving the file and its `.metadata` sidecar.
    pub output_dir: PathBuf,
    /// Number of concurrent connections.
    pub workers: usize,
    /// `None` means unlimited.
    pub max_bytes_per_second: Option<u64>,
    pub policy: LimiterPolicy,
    /// Chunks buffered between the workers and the writer.
    pub queue_capacity: usize,
    /// Connect and size-probe timeout.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            output_dir: PathBuf::from("."),
            workers: 1,
            max_bytes_per_second: None,
            policy: LimiterPolicy::Soft,
            queue_capacity: 16,
            timeout: Duration::from_secs(30),
            user_agent: concat!("rangedl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloadOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.url.trim().is_empty() {
            return Err(DownloadError::Configuration("missing URL".into()));
        }
        reqwest::Url::parse(&self.url)
            .map_err(|e| DownloadError::Configuration(format!("bad URL {:?}: {}", self.url, e)))?;
        if self.workers == 0 {
            return Err(DownloadError::Configuration("at least one connection is required".into()));
        }
        if self.max_bytes_per_second == Some(0) {
            return Err(DownloadError::Configuration("download limit must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(DownloadError::Configuration("queue capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub destination: PathBuf,
    /// Bytes fetched by this run; less than `total_size` after a resume.
    pub bytes_written: u64,
    pub total_size: u64,
}

/// Downloader drives a single file from start (or resume) to completion.
pub struct Downloader {
    source: Arc<dyn RangeSource>,
    options: DownloadOptions,
    status: Mutex<DownloadStatus>,
    downloaded: Arc<AtomicU64>,
    total_size: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Downloader {
    /// Create a new downloader fetching over HTTP.
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        let source = HttpSource::new(&options.user_agent, options.timeout)
            .map_err(|e| DownloadError::Configuration(e.to_string()))?;
        Ok(Self::with_source(options, Arc::new(source)))
    }

    /// Create a downloader over any byte source.
    pub fn with_source(options: DownloadOptions, source: Arc<dyn RangeSource>) -> Self {
        Self {
            source,
            options,
            status: Mutex::new(DownloadStatus::Init),
            downloaded: Arc::new(AtomicU64::new(0)),
            total_size: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Runs the download to the end.
    ///
    /// On success the sidecar is gone. On any failure it stays behind so a
    /// later run resumes where this one stopped.
    pub async fn run(&self) -> Result<DownloadOutcome, DownloadError> {
        self.set_status(DownloadStatus::Init).await;
        let result = match self.options.validate() {
            Ok(()) => self.download().await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(outcome) => {
                info!("Downloader: {} succeeded.", outcome.destination.display());
                self.set_status(DownloadStatus::Succeeded).await;
            }
            Err(e) => {
                warn!("Downloader: {} failed: {}", self.options.url, e);
                self.set_status(DownloadStatus::Failed).await;
            }
        }
        result
    }

    async fn download(&self) -> Result<DownloadOutcome, DownloadError> {
        let url = &self.options.url;
        tokio::fs::create_dir_all(&self.options.output_dir).await?;

        let size = match self.source.content_length(url).await {
            Ok(size) => size,
            Err(e) => {
                warn!("Downloader: size probe failed ({}); continuing without a size.", e);
                None
            }
        };

        let mut tracker = RangeTracker::open(url, &self.options.output_dir).await?;
        tracker.set_total_size(size).await?;
        self.total_size.store(tracker.total_size().unwrap_or(0), Ordering::SeqCst);
        self.downloaded.store(tracker.downloaded_bytes(), Ordering::SeqCst);

        if tracker.is_completed() {
            info!("Downloader: {} already complete.", tracker.filename());
            return Self::finalize(tracker, 0).await;
        }

        let workers = match tracker.total_size() {
            Some(_) => self.options.workers,
            None => {
                if self.options.workers > 1 {
                    info!("Downloader: size unknown, using a single connection.");
                }
                1
            }
        };
        let plan = plan_assignments(&tracker.missing_ranges(), workers);

        self.set_status(DownloadStatus::Running).await;
        let pipeline = Pipeline::start(
            &self.options,
            tracker,
            self.source.clone(),
            plan,
            self.cancel.child_token(),
            self.downloaded.clone(),
        );
        let report = pipeline.finish().await;
        self.settle(report).await
    }

    /// Decides the outcome of a finished pipeline.
    async fn settle(&self, report: PipelineReport) -> Result<DownloadOutcome, DownloadError> {
        let mut failure = None;
        let mut stream_end: Option<u64> = None;
        let mut bytes_written = 0;
        for result in report.workers {
            match result {
                Ok(worker) => {
                    stream_end = stream_end.max(Some(worker.end_offset));
                    bytes_written += worker.bytes;
                }
                Err(e) => {
                    warn!("Downloader: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }

        // The writer's error is the cause of any `WriterClosed` above.
        let mut tracker = report.writer?;
        if let Some(e) = failure {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            return Err(e.into());
        }

        if tracker.total_size().is_none() {
            if let Some(end) = stream_end {
                tracker.resolve_total_size(end).await?;
                self.total_size.store(end, Ordering::SeqCst);
            }
        }
        if !tracker.is_completed() {
            return Err(DownloadError::Incomplete {
                covered: tracker.downloaded_bytes(),
                total: tracker.total_size(),
            });
        }
        Self::finalize(tracker, bytes_written).await
    }

    async fn finalize(
        tracker: RangeTracker,
        bytes_written: u64,
    ) -> Result<DownloadOutcome, DownloadError> {
        let outcome = DownloadOutcome {
            destination: tracker.destination().to_path_buf(),
            bytes_written,
            total_size: tracker.total_size().unwrap_or(0),
        };
        // Creates a zero-byte file that never received a chunk, and cuts
        // any stale tail past the final size.
        open_destination(&outcome.destination, tracker.total_size()).await?;
        tracker.delete().await?;
        Ok(outcome)
    }

    async fn set_status(&self, status: DownloadStatus) {
        *self.status.lock().await = status;
    }
}

impl Downloader {
    /// Get the current progress as a fraction in range 0.0..=1.0 if known.
    pub fn progress(&self) -> Option<f32> {
        let total = self.total_size.load(Ordering::SeqCst);
        if total == 0 {
            return None;
        }
        let done = self.downloaded.load(Ordering::SeqCst);
        Some(done as f32 / total as f32)
    }

    /// Bytes known to be on disk.
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Total size, once known.
    pub fn total_size(&self) -> Option<u64> {
        match self.total_size.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    /// Get the current status of the download.
    pub async fn status(&self) -> DownloadStatus {
        *self.status.lock().await
    }

    /// Asks the running download to stop. Progress is kept for a later run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }
}
