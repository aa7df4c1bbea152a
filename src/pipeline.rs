// src/pipeline.rs

//! One running download: N range workers, one writer, an optional limiter.
//!
//! A [`Pipeline`] can only be ended through [`Pipeline::finish`], which is
//! what guarantees the end marker reaches the writer after every worker has
//! stopped producing.

use crate::bucket::TokenBucket;
use crate::downloader::DownloadOptions;
use crate::limiter::RateLimiter;
use crate::models::{Range, Span};
use crate::queue::{chunk_queue, FinishSender};
use crate::source::RangeSource;
use crate::tracker::RangeTracker;
use crate::worker::{RangeWorker, Throttle, WorkerError, WorkerReport};
use crate::writer::{SequentialWriter, WriterError};
use futures_util::future::join_all;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WorkerHandle = JoinHandle<Result<WorkerReport, WorkerError>>;
type WriterHandle = JoinHandle<Result<RangeTracker, WriterError>>;

/// Splits the missing spans between `workers` connections.
///
/// Missing bytes are cut into contiguous stretches of near-equal size,
/// walking the spans in file order, so a worker may receive several spans.
/// An open-ended span cannot be divided and sends everything to one worker.
pub fn plan_assignments(missing: &[Span], workers: usize) -> Vec<Vec<Span>> {
    let missing: Vec<Span> = missing.iter().copied().filter(|s| !s.is_empty()).collect();
    if missing.is_empty() {
        return Vec::new();
    }
    if workers <= 1 || missing.iter().any(|s| s.end.is_none()) {
        return vec![missing];
    }

    let total: u64 = missing.iter().filter_map(Span::len).sum();
    let workers = (workers as u64).min(total);
    let share = total / workers;
    let extra = total % workers;

    let mut ranges = missing
        .iter()
        .filter_map(|s| s.end.map(|end| Range { start: s.start, end }));
    let mut leftover: Option<Range> = None;
    let mut plan = Vec::with_capacity(workers as usize);

    for index in 0..workers {
        let mut quota = share + u64::from(index < extra);
        let mut assignment = Vec::new();
        while quota > 0 {
            let Some(range) = leftover.take().or_else(|| ranges.next()) else {
                break;
            };
            let take = range.len().min(quota);
            let cut = range.start + take;
            assignment.push(Span::bounded(Range { start: range.start, end: cut }));
            if cut < range.end {
                leftover = Some(Range { start: cut, end: range.end });
            }
            quota -= take;
        }
        if !assignment.is_empty() {
            plan.push(assignment);
        }
    }
    plan
}

/// Everything a finished pipeline has to say.
#[derive(Debug)]
pub struct PipelineReport {
    pub workers: Vec<Result<WorkerReport, WorkerError>>,
    /// The tracker comes back only if the writer finished cleanly.
    pub writer: Result<RangeTracker, WriterError>,
}

impl PipelineReport {
    pub fn first_worker_error(&self) -> Option<&WorkerError> {
        self.workers.iter().find_map(|r| r.as_ref().err())
    }
}

pub struct Pipeline {
    workers: Vec<WorkerHandle>,
    writer: WriterHandle,
    finish: FinishSender,
    limiter: Option<(JoinHandle<()>, CancellationToken)>,
    bucket: Option<Arc<TokenBucket>>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Spawns the writer, the limiter (when a rate is set) and one worker per
    /// assignment.
    pub fn start(
        options: &DownloadOptions,
        tracker: RangeTracker,
        source: Arc<dyn RangeSource>,
        assignments: Vec<Vec<Span>>,
        cancel: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> Self {
        let url = tracker.url().to_string();
        let (sender, finish, receiver) = chunk_queue(options.queue_capacity);
        let writer = SequentialWriter::new(tracker, receiver).with_progress(progress).spawn();

        let (bucket, limiter) = match options.max_bytes_per_second {
            Some(rate) => {
                let bucket = Arc::new(TokenBucket::new());
                let stop = CancellationToken::new();
                let handle = RateLimiter::new(bucket.clone(), rate, options.policy).spawn(stop.clone());
                (Some(bucket), Some((handle, stop)))
            }
            None => (None, None),
        };
        let throttle = match (&bucket, options.max_bytes_per_second) {
            (Some(bucket), Some(rate)) => Some(Throttle::new(bucket.clone(), rate)),
            _ => None,
        };

        let workers: Vec<WorkerHandle> = assignments
            .into_iter()
            .enumerate()
            .map(|(id, spans)| {
                debug!("Pipeline: worker {} gets {:?}.", id, spans);
                let worker = RangeWorker::new(
                    id,
                    url.clone(),
                    source.clone(),
                    sender.clone(),
                    throttle.clone(),
                    cancel.clone(),
                );
                tokio::spawn(worker.run(spans))
            })
            .collect();
        info!("Pipeline: started {} worker(s).", workers.len());

        Self { workers, writer, finish, limiter, bucket, cancel }
    }

    /// Shuts the pipeline down in order: workers, end marker, writer,
    /// limiter, bucket.
    ///
    /// If the writer dies while workers are still running, the workers are
    /// cancelled so none is left blocked on a queue nobody drains.
    pub async fn finish(self) -> PipelineReport {
        let Pipeline { workers, mut writer, finish, limiter, bucket, cancel } = self;

        let all_workers = join_all(workers);
        tokio::pin!(all_workers);

        let mut worker_results = None;
        let mut writer_result = None;
        tokio::select! {
            results = &mut all_workers => worker_results = Some(results),
            early = &mut writer => writer_result = Some(early),
        }

        if writer_result.is_some() {
            warn!("Pipeline: writer stopped before the workers; cancelling them.");
            cancel.cancel();
            if let Some(bucket) = &bucket {
                bucket.terminate().await;
            }
        }
        let worker_results = match worker_results {
            Some(results) => results,
            None => all_workers.await,
        };
        let workers: Vec<_> = worker_results
            .into_iter()
            .map(|joined| joined.map_err(WorkerError::from).and_then(|result| result))
            .collect();

        let writer = match writer_result {
            Some(joined) => joined,
            None => {
                if finish.finish().await.is_err() {
                    debug!("Pipeline: writer was gone before the end marker.");
                }
                writer.await
            }
        };
        let writer = writer.map_err(WriterError::from).and_then(|result| result);

        if let Some((_, stop)) = &limiter {
            stop.cancel();
        }
        if let Some(bucket) = &bucket {
            bucket.terminate().await;
        }
        if let Some((handle, _)) = limiter {
            if let Err(e) = handle.await {
                warn!("Pipeline: limiter task failed: {}", e);
            }
        }

        PipelineReport { workers, writer }
    }
}
