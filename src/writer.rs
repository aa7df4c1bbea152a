// src/writer.rs

use crate::models::Chunk;
use crate::queue::{ChunkReceiver, WriterMessage};
use crate::state_manager::StateError;
use crate::tracker::RangeTracker;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("progress sidecar error: {0}")]
    State(#[from] StateError),
    #[error("chunk queue closed before the end marker")]
    Disconnected,
    #[error("writer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl WriterError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> WriterError + '_ {
        move |source| WriterError::Io { path: path.to_path_buf(), source }
    }
}

/// The only task that touches the destination file and the tracker.
///
/// Chunks are written at their own offsets, so arrival order across workers
/// does not matter. Each batch is synced to disk before the tracker is told
/// about it.
pub struct SequentialWriter {
    tracker: RangeTracker,
    receiver: ChunkReceiver,
    progress: Option<Arc<AtomicU64>>,
}

impl SequentialWriter {
    pub fn new(tracker: RangeTracker, receiver: ChunkReceiver) -> Self {
        Self { tracker, receiver, progress: None }
    }

    /// Publishes the covered byte count after every batch.
    pub fn with_progress(mut self, progress: Arc<AtomicU64>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn spawn(self) -> JoinHandle<Result<RangeTracker, WriterError>> {
        tokio::spawn(self.run())
    }

    /// Drains the queue until the end marker, then hands the tracker back.
    pub async fn run(mut self) -> Result<RangeTracker, WriterError> {
        let result = self.drain().await;
        match result {
            Ok(()) => {
                info!(
                    "Writer: {} complete, {} bytes on disk.",
                    self.tracker.filename(),
                    self.tracker.downloaded_bytes()
                );
                Ok(self.tracker)
            }
            Err(e) => {
                error!("Writer: stopping on {}: {}", self.tracker.destination().display(), e);
                Err(e)
            }
        }
    }

    async fn drain(&mut self) -> Result<(), WriterError> {
        let path = self.tracker.destination().to_path_buf();
        let mut file = open_destination(&path, self.tracker.total_size()).await?;

        let limit = self.receiver.capacity();
        let mut batch = Vec::with_capacity(limit);
        loop {
            let mut next = match self.receiver.recv().await {
                Some(message) => Some(message),
                None => return Err(WriterError::Disconnected),
            };

            let mut finished = false;
            while let Some(message) = next.take() {
                match message {
                    WriterMessage::Chunk(chunk) => batch.push(chunk),
                    WriterMessage::Finish => {
                        finished = true;
                        break;
                    }
                }
                if batch.len() < limit {
                    next = self.receiver.try_recv();
                }
            }

            self.commit(&mut file, &path, &mut batch).await?;
            if finished {
                return Ok(());
            }
        }
    }

    async fn commit(
        &mut self,
        file: &mut File,
        path: &Path,
        batch: &mut Vec<Chunk>,
    ) -> Result<(), WriterError> {
        if batch.is_empty() {
            return Ok(());
        }

        for chunk in batch.iter() {
            file.seek(SeekFrom::Start(chunk.offset)).await.map_err(WriterError::io(path))?;
            file.write_all(&chunk.data).await.map_err(WriterError::io(path))?;
        }
        file.flush().await.map_err(WriterError::io(path))?;
        file.sync_data().await.map_err(WriterError::io(path))?;

        debug!("Writer: committed {} chunk(s).", batch.len());
        self.tracker.add_ranges(batch.drain(..).map(|chunk| chunk.range())).await?;

        if let Some(progress) = &self.progress {
            progress.store(self.tracker.downloaded_bytes(), Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Opens the destination without truncating it, then sets its length to the
/// final size when that size is known.
///
/// Covered bytes always lie below the total size, so resizing never drops
/// recorded progress; it only cuts the tail of an older, longer file.
pub async fn open_destination(path: &Path, total_size: Option<u64>) -> Result<File, WriterError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(WriterError::io(path))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(WriterError::io(path))?;

    if let Some(size) = total_size {
        let existing = file.metadata().await.map_err(WriterError::io(path))?.len();
        if existing != size {
            debug!("Writer: resizing {} from {} to {} bytes.", path.display(), existing, size);
            file.set_len(size).await.map_err(WriterError::io(path))?;
        }
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Range;
    use crate::queue::chunk_queue;
    use bytes::Bytes;
    use tempfile::tempdir;

    const URL: &str = "http://example.com/out.bin";

    #[tokio::test]
    async fn out_of_order_chunks_land_at_their_offsets() {
        let dir = tempdir().unwrap();
        let mut tracker = RangeTracker::open(URL, dir.path()).await.unwrap();
        tracker.set_total_size(Some(10)).await.unwrap();

        let (tx, finish, rx) = chunk_queue(4);
        let writer = SequentialWriter::new(tracker, rx).spawn();

        tx.send(Chunk::new(5, Bytes::from_static(b"World"))).await.unwrap();
        tx.send(Chunk::new(0, Bytes::from_static(b"Hello"))).await.unwrap();
        drop(tx);
        finish.finish().await.unwrap();

        let tracker = writer.await.unwrap().unwrap();
        assert!(tracker.is_completed());
        assert_eq!(tracker.covered().ranges(), &[Range::new(0, 10).unwrap()]);

        let content = tokio::fs::read(dir.path().join("out.bin")).await.unwrap();
        assert_eq!(content, b"HelloWorld");
    }

    #[tokio::test]
    async fn partial_progress_is_persisted() {
        let dir = tempdir().unwrap();
        let mut tracker = RangeTracker::open(URL, dir.path()).await.unwrap();
        tracker.set_total_size(Some(100)).await.unwrap();

        let (tx, finish, rx) = chunk_queue(4);
        let progress = Arc::new(AtomicU64::new(0));
        let writer = SequentialWriter::new(tracker, rx).with_progress(progress.clone()).spawn();
        tx.send(Chunk::new(0, Bytes::from(vec![1u8; 50]))).await.unwrap();
        finish.finish().await.unwrap();
        drop(writer.await.unwrap().unwrap());
        assert_eq!(progress.load(Ordering::SeqCst), 50);

        let reopened = RangeTracker::open(URL, dir.path()).await.unwrap();
        assert_eq!(reopened.covered().ranges(), &[Range::new(0, 50).unwrap()]);
    }

    #[tokio::test]
    async fn destination_is_resized_to_the_total() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sized.bin");
        tokio::fs::write(&path, vec![0xEEu8; 200]).await.unwrap();

        drop(open_destination(&path, Some(100)).await.unwrap());
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 100);

        drop(open_destination(&path, Some(150)).await.unwrap());
        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content.len(), 150);
        assert!(content[..100].iter().all(|&b| b == 0xEE));

        // Unknown size leaves the file alone.
        drop(open_destination(&path, None).await.unwrap());
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 150);
    }

    #[tokio::test]
    async fn missing_end_marker_is_an_error() {
        let dir = tempdir().unwrap();
        let tracker = RangeTracker::open(URL, dir.path()).await.unwrap();
        let (tx, finish, rx) = chunk_queue(4);
        let writer = SequentialWriter::new(tracker, rx).spawn();
        drop(tx);
        drop(finish);
        assert!(matches!(writer.await.unwrap(), Err(WriterError::Disconnected)));
    }

    #[tokio::test]
    async fn unwritable_destination_fails_the_writer() {
        let dir = tempdir().unwrap();
        // A directory where the file should be.
        tokio::fs::create_dir(dir.path().join("out.bin")).await.unwrap();
        let tracker = RangeTracker::open(URL, dir.path()).await.unwrap();

        let (tx, _finish, rx) = chunk_queue(4);
        let writer = SequentialWriter::new(tracker, rx).spawn();
        assert!(matches!(writer.await.unwrap(), Err(WriterError::Io { .. })));
        assert!(tx.send(Chunk::new(0, Bytes::from_static(b"x"))).await.is_err());
    }
}
