// src/queue.rs

//! The bounded queue between the range workers and the file writer.
//!
//! Workers get a [`ChunkSender`], which can only carry data. The end marker
//! can only be sent through the single [`FinishSender`], and sending it
//! consumes it.

use crate::models::Chunk;
use thiserror::Error;
use tokio::sync::mpsc;

/// Items travelling from the workers to the writer.
#[derive(Debug, PartialEq, Eq)]
pub enum WriterMessage {
    Chunk(Chunk),
    /// No more chunks will follow.
    Finish,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("the writer is no longer receiving")]
pub struct QueueClosed;

/// Producer side handed to each worker.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    inner: mpsc::Sender<WriterMessage>,
}

impl ChunkSender {
    /// Enqueues `chunk`, waiting while the queue is full.
    pub async fn send(&self, chunk: Chunk) -> Result<(), QueueClosed> {
        self.inner.send(WriterMessage::Chunk(chunk)).await.map_err(|_| QueueClosed)
    }
}

/// The one handle able to end the stream.
#[derive(Debug)]
pub struct FinishSender {
    inner: mpsc::Sender<WriterMessage>,
}

impl FinishSender {
    pub async fn finish(self) -> Result<(), QueueClosed> {
        self.inner.send(WriterMessage::Finish).await.map_err(|_| QueueClosed)
    }
}

/// Consumer side, owned by the writer.
#[derive(Debug)]
pub struct ChunkReceiver {
    inner: mpsc::Receiver<WriterMessage>,
    capacity: usize,
}

impl ChunkReceiver {
    /// Waits for the next message; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<WriterMessage> {
        self.inner.recv().await
    }

    /// Returns a message only if one is already queued.
    pub fn try_recv(&mut self) -> Option<WriterMessage> {
        self.inner.try_recv().ok()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Creates a queue holding at most `capacity` messages (minimum 1).
pub fn chunk_queue(capacity: usize) -> (ChunkSender, FinishSender, ChunkReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChunkSender { inner: tx.clone() },
        FinishSender { inner: tx },
        ChunkReceiver { inner: rx, capacity },
    )
}
