//! Bounded ingest queue, sharded per apply worker.
//!
//! Per-thread ordering across workers is kept by routing every op for a
//! thread to the same shard: `hash(thread_key) % workers`. Within a shard
//! the channel is FIFO, so ops for one thread reach their worker in WAL
//! admission order.

use crate::error::{StorageError, StorageResult};
use crate::QueueOp;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, Receiver, Sender};

#[derive(Clone)]
pub struct IngestQueue {
    senders: Vec<Sender<QueueOp>>,
    timeout: Duration,
}

impl IngestQueue {
    /// Build the queue and hand back one receiver per worker shard.
    pub fn new(
        workers: usize,
        capacity: usize,
        timeout: Duration,
    ) -> (Self, Vec<Receiver<QueueOp>>) {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            receivers.push(rx);
        }
        (Self { senders, timeout }, receivers)
    }

    pub fn shard_for(&self, thread_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        thread_key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Enqueue with a deadline; a full shard for longer than the configured
    /// timeout surfaces as `queue_full`.
    pub async fn enqueue(&self, op: QueueOp) -> StorageResult<()> {
        let shard = self.shard_for(&op.thread_key());
        match self.senders[shard].send_timeout(op, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(StorageError::QueueFull),
            Err(SendTimeoutError::Closed(_)) => Err(StorageError::BadStateError(
                "ingest queue receiver dropped".into(),
            )),
        }
    }
}
