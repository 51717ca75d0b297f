//! Pipeline lifecycle and the admission surface.
//!
//! `open` brings the module-level state up in order (stores, WAL,
//! temp-index promotion, apply workers, WAL replay) and returns the three
//! handles collaborators hold: a [`Reader`], an [`Ingest`] for admissions,
//! and the [`Pipeline`] itself for shutdown. Workers are started before
//! replay so a WAL backlog larger than the queue cannot wedge startup;
//! replayed ops are re-admitted under fresh sequences, which preserves the
//! only-truncate-after-commit rule.
//!
//! Shutdown reverses the order: cancel the workers, let each drain its
//! shard into a final flush, then drop stores last.

use crate::batch;
use crate::config::PipelineConfig;
use crate::error::StorageResult;
use crate::queue::IngestQueue;
use crate::reader::Reader;
use crate::recovery::{self, RecoveryStats};
use crate::stores::Stores;
use crate::wal::Wal;
use crate::{now_ns, Extras, Handler, OpPayload, QueueOp};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Admission front door for the HTTP surface: validate, WAL-append,
/// enqueue. Cheap to clone.
#[derive(Clone)]
pub struct Ingest {
    wal: Arc<Wal>,
    queue: IngestQueue,
}

impl Ingest {
    /// Admit one operation. On success the op is durable in the WAL and
    /// queued for apply; the returned envelope carries the assigned
    /// sequence and the key the caller should hand back to its client.
    pub async fn submit(
        &self,
        handler: Handler,
        payload: OpPayload,
        extras: Extras,
    ) -> StorageResult<QueueOp> {
        let op = QueueOp::new(handler, now_ns(), payload, extras);
        op.validate()?;
        let wal = self.wal.clone();
        let op = tokio::task::spawn_blocking(move || wal.append(op)).await??;
        self.queue.enqueue(op.clone()).await?;
        Ok(op)
    }
}

pub struct Pipeline {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    pub recovery: RecoveryStats,
}

impl Pipeline {
    /// Cancel the workers and wait for each to drain its shard and flush
    /// the remainder. In-flight batch commits complete; nothing is
    /// interrupted mid-commit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.workers {
            if let Err(e) = handle.await {
                log::error!("apply worker join failed: {e}");
            }
        }
    }
}

/// Open the store root and start the pipeline.
pub async fn open(
    root: impl AsRef<Path>,
    config: PipelineConfig,
) -> StorageResult<(Reader, Ingest, Pipeline)> {
    let t0 = Instant::now();
    let root = root.as_ref().to_path_buf();
    let wal_dir = root.join("wal");

    let stores = tokio::task::spawn_blocking(move || Stores::open(&root)).await??;
    let wal_capacity = config.wal_capacity;
    let wal_segment_records = config.wal_segment_records;
    let wal = Arc::new(
        tokio::task::spawn_blocking(move || Wal::open(wal_dir, wal_capacity, wal_segment_records))
            .await??,
    );

    // staged indexes belong to data that already committed; promote them
    // before anything else can write
    let promo_stores = stores.clone();
    let (temp_indexes_recovered, temp_index_errors) =
        tokio::task::spawn_blocking(move || recovery::promote_temp_indexes(&promo_stores))
            .await??;

    let (queue, receivers) = IngestQueue::new(
        config.workers,
        config.queue_capacity,
        config.enqueue_timeout,
    );
    let cancel = CancellationToken::new();
    let mut workers = Vec::with_capacity(receivers.len());
    for (worker_id, rx) in receivers.into_iter().enumerate() {
        workers.push(tokio::spawn(run_worker(
            worker_id,
            rx,
            stores.clone(),
            wal.clone(),
            config.clone(),
            cancel.clone(),
        )));
    }

    let (wal_replayed, wal_errors) = recovery::replay_wal(&wal, &queue).await?;

    let recovery = RecoveryStats {
        wal_replayed,
        wal_errors,
        temp_indexes_recovered,
        temp_index_errors,
        duration: t0.elapsed(),
    };
    if recovery.wal_replayed > 0 || recovery.temp_indexes_recovered > 0 {
        log::info!(
            "recovery: {} wal records replayed ({} errors), {} temp indexes promoted ({} errors) in {:?}",
            recovery.wal_replayed,
            recovery.wal_errors,
            recovery.temp_indexes_recovered,
            recovery.temp_index_errors,
            recovery.duration,
        );
    }

    let reader = Reader::new(stores);
    let ingest = Ingest { wal, queue };
    let pipeline = Pipeline {
        cancel,
        workers,
        recovery,
    };
    Ok((reader, ingest, pipeline))
}

async fn run_worker(
    worker_id: usize,
    mut rx: Receiver<QueueOp>,
    stores: Stores,
    wal: Arc<Wal>,
    config: PipelineConfig,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<QueueOp> = Vec::with_capacity(config.max_batch);
    let mut flush_tick = tokio::time::interval(config.flush_interval);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(op) => {
                    buffer.push(op);
                    if buffer.len() >= config.max_batch {
                        flush(worker_id, &stores, &wal, &mut buffer).await;
                    }
                }
                None => break,
            },
            _ = flush_tick.tick() => {
                if !buffer.is_empty() {
                    flush(worker_id, &stores, &wal, &mut buffer).await;
                }
            }
        }
    }

    // drain what producers already handed over, then flush the remainder
    while let Ok(op) = rx.try_recv() {
        buffer.push(op);
        if buffer.len() >= config.max_batch {
            flush(worker_id, &stores, &wal, &mut buffer).await;
        }
    }
    flush(worker_id, &stores, &wal, &mut buffer).await;
    log::info!("apply worker {worker_id} stopped");
}

/// Apply the buffered ops as one batch, then truncate their WAL records.
/// A failed batch is not retried here: the WAL keeps its records and
/// recovery reruns them on the next start.
async fn flush(worker_id: usize, stores: &Stores, wal: &Arc<Wal>, buffer: &mut Vec<QueueOp>) {
    if buffer.is_empty() {
        return;
    }
    let mut entries = std::mem::take(buffer);
    entries.sort_by_key(|op| (op.ts, op.enq_seq));
    let seqs: Vec<u64> = entries.iter().map(|op| op.enq_seq).collect();
    let count = entries.len();

    let apply_stores = stores.clone();
    let applied =
        tokio::task::spawn_blocking(move || batch::apply_batch(&apply_stores, entries)).await;

    match applied {
        Ok(Ok(())) => {
            log::trace!("worker {worker_id}: committed batch of {count}");
            let truncator = wal.clone();
            match tokio::task::spawn_blocking(move || truncator.truncate_sequences(&seqs)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("worker {worker_id}: wal truncate failed: {e}"),
                Err(e) => log::error!("worker {worker_id}: wal truncate task died: {e}"),
            }
        }
        Ok(Err(e)) => {
            log::error!(
                "worker {worker_id}: batch of {count} failed, wal retains its records: {e}"
            );
        }
        Err(e) => {
            log::error!("worker {worker_id}: apply task died: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys, Message, Thread};
    use std::time::Duration;

    /// Poll until a thread's visible message count reaches `want`.
    async fn wait_for_messages(
        reader: &Reader,
        thread_key: &str,
        want: usize,
    ) -> Vec<Message> {
        for _ in 0..300 {
            let msgs = reader
                .list_messages(thread_key, None, false)
                .await
                .expect("list_messages");
            if msgs.len() >= want {
                return msgs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("messages not applied within 3s");
    }

    fn thread_payload(key: &str, author: &str) -> OpPayload {
        OpPayload::Thread(Thread {
            key: key.to_string(),
            author: author.to_string(),
            ..Default::default()
        })
    }

    fn message_payload(thread_key: &str, msg_ts: i64, author: &str) -> OpPayload {
        OpPayload::Message(Message {
            key: keys::gen_message_provisional_key(thread_key, msg_ts),
            thread: thread_key.to_string(),
            author: author.to_string(),
            body: serde_json::json!({"n": msg_ts}),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn end_to_end_submit_apply_read() -> anyhow::Result<()> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let (reader, ingest, pipeline) =
            open(dir.path(), PipelineConfig::for_tests()).await?;

        let tk = keys::gen_thread_key(1);
        let admitted = ingest
            .submit(
                Handler::ThreadCreate,
                thread_payload(&tk, "u1"),
                Extras::default(),
            )
            .await?;
        assert!(admitted.enq_seq > 0);
        assert!(admitted.ts > 0);

        for msg_ts in [10, 20, 30] {
            ingest
                .submit(
                    Handler::MessageCreate,
                    message_payload(&tk, msg_ts, "u1"),
                    Extras::default(),
                )
                .await?;
        }

        let msgs = wait_for_messages(&reader, &tk, 3).await;
        assert_eq!(msgs.len(), 3);
        let seqs: Vec<Option<u64>> = msgs
            .iter()
            .map(|m| keys::parse_message_key(&m.key).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);

        let thread = reader.get_thread(&tk).await?.expect("thread applied");
        assert_eq!(thread.author, "u1");

        pipeline.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_ops() -> anyhow::Result<()> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let mut config = PipelineConfig::for_tests();
        // make sure nothing flushes until shutdown forces it
        config.flush_interval = Duration::from_secs(30);
        config.max_batch = 1_000;

        let (reader, ingest, pipeline) = open(dir.path(), config).await?;
        let tk = keys::gen_thread_key(2);
        ingest
            .submit(
                Handler::ThreadCreate,
                thread_payload(&tk, "u1"),
                Extras::default(),
            )
            .await?;
        ingest
            .submit(
                Handler::MessageCreate,
                message_payload(&tk, 10, "u1"),
                Extras::default(),
            )
            .await?;

        pipeline.shutdown().await;

        let msgs = reader.list_messages(&tk, None, false).await?;
        assert_eq!(msgs.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn wal_backlog_is_applied_on_restart() -> anyhow::Result<()> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let config = PipelineConfig::for_tests();
        let tk = keys::gen_thread_key(3);

        // simulate a crash after admission but before any flush: records
        // exist in the WAL, nothing reached the stores
        {
            let _stores = Stores::open(dir.path())?;
            let wal = Wal::open(
                dir.path().join("wal"),
                config.wal_capacity,
                config.wal_segment_records,
            )?;
            let mut ts = 1i64;
            wal.append(QueueOp::new(
                Handler::ThreadCreate,
                ts,
                thread_payload(&tk, "u1"),
                Extras::default(),
            ))?;
            for msg_ts in [10, 20] {
                ts += 1;
                wal.append(QueueOp::new(
                    Handler::MessageCreate,
                    ts,
                    message_payload(&tk, msg_ts, "u1"),
                    Extras::default(),
                ))?;
            }
        }

        let (reader, _ingest, pipeline) = open(dir.path(), config).await?;
        assert_eq!(pipeline.recovery.wal_replayed, 3);
        assert_eq!(pipeline.recovery.wal_errors, 0);

        let msgs = wait_for_messages(&reader, &tk, 2).await;
        assert_eq!(msgs.len(), 2);

        pipeline.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_ops_never_reach_the_wal() -> anyhow::Result<()> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let (_reader, ingest, pipeline) =
            open(dir.path(), PipelineConfig::for_tests()).await?;

        let err = ingest
            .submit(
                Handler::ThreadCreate,
                thread_payload("garbage", "u1"),
                Extras::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "invalid_key");

        let err = ingest
            .submit(
                Handler::ThreadCreate,
                thread_payload(&keys::gen_thread_key(1), ""),
                Extras::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "invalid_key");

        pipeline.shutdown().await;
        Ok(())
    }
}
