use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use rangedl::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

const URL: &str = "http://mirror.example.org/pub/archive.tar";

/// Serves `data` in 10-byte blocks and remembers every span asked for.
/// Spans starting at or past `stall_from` never produce a byte.
struct ScriptedSource {
    data: Bytes,
    stall_from: Option<u64>,
    requested: Mutex<Vec<Span>>,
}

impl ScriptedSource {
    fn new(data: Vec<u8>, stall_from: Option<u64>) -> Self {
        Self { data: data.into(), stall_from, requested: Mutex::new(Vec::new()) }
    }

    fn requested(&self) -> Vec<Span> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeSource for ScriptedSource {
    async fn content_length(&self, _url: &str) -> Result<Option<u64>, FetchError> {
        Ok(Some(self.data.len() as u64))
    }

    async fn fetch(&self, _url: &str, span: Span) -> Result<ByteStream, FetchError> {
        self.requested.lock().unwrap().push(span);
        if self.stall_from.is_some_and(|stall| span.start >= stall) {
            return Ok(stream::pending::<Result<Bytes, FetchError>>().boxed());
        }
        let end = span.end.unwrap_or(self.data.len() as u64) as usize;
        let blocks: Vec<Result<Bytes, FetchError>> = (span.start as usize..end)
            .step_by(10)
            .map(|at| Ok(self.data.slice(at..(at + 10).min(end))))
            .collect();
        Ok(stream::iter(blocks).boxed())
    }
}

fn content() -> Vec<u8> {
    (0..100u8).rev().collect()
}

fn options(dir: &std::path::Path) -> DownloadOptions {
    DownloadOptions {
        output_dir: dir.to_path_buf(),
        workers: 2,
        ..DownloadOptions::new(URL)
    }
}

#[tokio::test]
async fn interrupted_download_resumes_with_the_missing_half() {
    let dir = tempdir().unwrap();
    let data = content();

    let stalled = Arc::new(ScriptedSource::new(data.clone(), Some(50)));
    let first = Arc::new(Downloader::with_source(options(dir.path()), stalled.clone()));
    let run = {
        let first = first.clone();
        tokio::spawn(async move { first.run().await })
    };

    // Wait until the first half is on disk and recorded.
    tokio::time::timeout(Duration::from_secs(5), async {
        while first.downloaded_bytes() < 50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    first.cancel();
    assert!(matches!(run.await.unwrap(), Err(DownloadError::Cancelled)));
    assert!(dir.path().join("archive.tar.metadata").exists());

    let fresh = Arc::new(ScriptedSource::new(data.clone(), None));
    let second = Downloader::with_source(options(dir.path()), fresh.clone());
    second.run().await.unwrap();

    // Two connections may split the missing half, but together they must
    // ask for exactly [50, 100) and nothing already on disk.
    let mut requested = fresh.requested();
    requested.sort_by_key(|span| span.start);
    assert!(!requested.is_empty());
    assert_eq!(requested[0].start, 50);
    for pair in requested.windows(2) {
        assert_eq!(pair[0].end, Some(pair[1].start));
    }
    assert_eq!(requested.last().and_then(|span| span.end), Some(100));
    assert_eq!(tokio::fs::read(dir.path().join("archive.tar")).await.unwrap(), data);
    assert!(!dir.path().join("archive.tar.metadata").exists());
}

#[tokio::test]
async fn finished_file_without_sidecar_is_fetched_fresh() {
    let dir = tempdir().unwrap();
    let data = content();

    let source = Arc::new(ScriptedSource::new(data.clone(), None));
    Downloader::with_source(options(dir.path()), source.clone()).run().await.unwrap();
    assert_eq!(source.requested().len(), 2);

    // Without a sidecar the next run starts over rather than trusting the file.
    let again = Arc::new(ScriptedSource::new(data.clone(), None));
    Downloader::with_source(options(dir.path()), again.clone()).run().await.unwrap();
    assert_eq!(again.requested().len(), 2);
    assert_eq!(tokio::fs::read(dir.path().join("archive.tar")).await.unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn hard_limit_spreads_the_download_over_time() {
    let dir = tempdir().unwrap();
    let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
    let source = Arc::new(ScriptedSource::new(data.clone(), None));
    let downloader = Downloader::with_source(
        DownloadOptions {
            max_bytes_per_second: Some(100),
            policy: LimiterPolicy::Hard,
            ..options(dir.path())
        },
        source,
    );

    let started = tokio::time::Instant::now();
    downloader.run().await.unwrap();

    // 250 bytes at 100 per second need the refills at 0s, 1s and 2s.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(tokio::fs::read(dir.path().join("archive.tar")).await.unwrap(), data);
}
