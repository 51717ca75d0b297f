//! Startup recovery.
//!
//! Two passes run before the pipeline accepts new work:
//!
//! 1. **WAL replay**: every live record is decoded and re-admitted (fresh
//!    WAL append + enqueue), then the old range is truncated. Re-admission
//!    rather than in-place replay keeps the invariant that a record is only
//!    truncated once its effects are durable: the copies carry the ops
//!    until their batches commit. Undecodable (poison) records are logged,
//!    counted and skipped.
//! 2. **Temp-index promotion**: `temp_idx:` entries staged by a failed
//!    index commit are promoted to their real index keys and removed, in
//!    sub-batches of at most [`PROMOTE_SUB_BATCH`] entries.

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::queue::IngestQueue;
use crate::stores::Stores;
use crate::wal::Wal;
use crate::QueueOp;
use std::sync::Arc;
use std::time::Duration;

pub const PROMOTE_SUB_BATCH: usize = 1_000;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryStats {
    pub wal_replayed: usize,
    pub wal_errors: usize,
    pub temp_indexes_recovered: usize,
    pub temp_index_errors: usize,
    pub duration: Duration,
}

/// Promote staged `temp_idx:` entries to their real index keys. Returns
/// `(recovered, errors)`; individual failures are logged and skipped.
pub fn promote_temp_indexes(stores: &Stores) -> StorageResult<(usize, usize)> {
    let lower = keys::TEMP_INDEX_PREFIX.as_bytes().to_vec();
    let upper = keys::next_prefix(keys::TEMP_INDEX_PREFIX);

    let mut recovered = 0usize;
    let mut errors = 0usize;
    let mut batch = stores.index_keyspace.batch();

    for entry in stores.index.range(lower..upper) {
        let (key_bytes, val_bytes) = entry?;
        match std::str::from_utf8(&key_bytes)
            .map_err(|e| StorageError::InvalidKey(format!("non-utf8 temp index key: {e}")))
            .and_then(keys::parse_temp_index_key)
        {
            Ok(("set", target)) => {
                batch.insert(&stores.index, target.as_bytes(), val_bytes);
                recovered += 1;
            }
            Ok(("del", target)) => {
                batch.remove(&stores.index, target.as_bytes());
                recovered += 1;
            }
            Ok((kind, target)) => {
                log::error!("unknown temp index kind {kind:?} for {target:?}, discarding");
                errors += 1;
            }
            Err(e) => {
                log::error!("unparseable temp index entry, discarding: {e}");
                errors += 1;
            }
        }
        // the staged entry goes away either way
        batch.remove(&stores.index, key_bytes);

        if batch.len() >= PROMOTE_SUB_BATCH {
            batch.commit()?;
            stores.sync_index()?;
            batch = stores.index_keyspace.batch();
        }
    }

    if batch.len() > 0 {
        batch.commit()?;
        stores.sync_index()?;
    }
    if recovered > 0 || errors > 0 {
        log::info!("promoted {recovered} temp index entries ({errors} discarded)");
    }
    Ok((recovered, errors))
}

/// Replay unprocessed WAL records into the queue. Returns
/// `(replayed, errors)`.
pub async fn replay_wal(wal: &Arc<Wal>, queue: &IngestQueue) -> StorageResult<(usize, usize)> {
    let first = wal.first_index();
    let last = wal.last_index();
    if first == 0 || last < first {
        return Ok((0, 0));
    }

    let reader = wal.clone();
    let records: Vec<(u64, StorageResult<Vec<u8>>)> =
        tokio::task::spawn_blocking(move || (first..=last).map(|s| (s, reader.read(s))).collect())
            .await?;

    let mut replayed = 0usize;
    let mut errors = 0usize;
    let mut readmit_failures = 0usize;

    for (seq, read) in records {
        let bytes = match read {
            Ok(b) => b,
            Err(StorageError::WalNotFound(_)) => continue,
            Err(e) => {
                log::error!("wal record {seq} unreadable: {e}");
                errors += 1;
                continue;
            }
        };
        let op: QueueOp = match serde_json::from_slice(&bytes) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("wal record {seq} undecodable, skipping: {e}");
                errors += 1;
                continue;
            }
        };

        let appender = wal.clone();
        let readmitted = match tokio::task::spawn_blocking(move || appender.append(op)).await? {
            Ok(op) => op,
            Err(e) => {
                log::error!("re-admission of wal record {seq} failed: {e}");
                errors += 1;
                readmit_failures += 1;
                continue;
            }
        };
        if let Err(e) = queue.enqueue(readmitted).await {
            // the copy is already durable; it will be picked up next start
            log::error!("enqueue of replayed record {seq} failed: {e}");
            errors += 1;
            continue;
        }
        replayed += 1;
    }

    if readmit_failures == 0 {
        let truncator = wal.clone();
        tokio::task::spawn_blocking(move || truncator.truncate_front(last + 1)).await??;
    } else {
        log::error!(
            "{readmit_failures} records could not be re-admitted; leaving wal head in place"
        );
    }
    Ok((replayed, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Extras, Handler, OpPayload, Thread};
    use std::time::Duration;

    fn test_stores() -> (tempfile::TempDir, Stores) {
        crate::init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(dir.path()).unwrap();
        (dir, stores)
    }

    fn make_op(n: i64) -> QueueOp {
        QueueOp::new(
            Handler::ThreadCreate,
            n,
            OpPayload::Thread(Thread {
                key: keys::gen_thread_key(n),
                author: "u1".into(),
                ..Default::default()
            }),
            Extras::default(),
        )
    }

    #[test]
    fn promotes_set_and_del_entries() -> anyhow::Result<()> {
        let (_dir, stores) = test_stores();
        let target_set = keys::rel_user_thread_key("u1", &keys::gen_thread_key(1));
        let target_del = keys::del_marker_key(&keys::gen_thread_key(2));

        stores.index.insert(target_del.as_bytes(), b"1")?;
        stores
            .index
            .insert(keys::temp_index_key("set", &target_set).as_bytes(), b"1")?;
        stores
            .index
            .insert(keys::temp_index_key("del", &target_del).as_bytes(), b"")?;

        let (recovered, errors) = promote_temp_indexes(&stores)?;
        assert_eq!((recovered, errors), (2, 0));

        assert_eq!(stores.get_index(&target_set)?, Some(b"1".to_vec()));
        assert_eq!(stores.get_index(&target_del)?, None);
        // staging entries are gone
        let upper = keys::next_prefix(keys::TEMP_INDEX_PREFIX);
        assert_eq!(
            stores
                .index
                .range(keys::TEMP_INDEX_PREFIX.as_bytes().to_vec()..upper)
                .count(),
            0
        );
        Ok(())
    }

    #[test]
    fn malformed_temp_entries_are_counted_and_discarded() -> anyhow::Result<()> {
        let (_dir, stores) = test_stores();
        stores.index.insert(b"temp_idx:weird", b"?")?;
        stores.index.insert(b"temp_idx:what:ever", b"?")?;

        let (recovered, errors) = promote_temp_indexes(&stores)?;
        assert_eq!(recovered, 0);
        assert_eq!(errors, 2);
        let upper = keys::next_prefix(keys::TEMP_INDEX_PREFIX);
        assert_eq!(
            stores
                .index
                .range(keys::TEMP_INDEX_PREFIX.as_bytes().to_vec()..upper)
                .count(),
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn replay_readmits_and_truncates() -> anyhow::Result<()> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let wal = Arc::new(Wal::open(dir.path(), 1024, 64)?);
        for n in 1..=3 {
            wal.append(make_op(n))?;
        }

        let (queue, mut rxs) = IngestQueue::new(1, 16, Duration::from_millis(100));
        let (replayed, errors) = replay_wal(&wal, &queue).await?;
        assert_eq!((replayed, errors), (3, 0));

        // the queue holds the re-admitted copies, in original order
        let mut rx = rxs.remove(0);
        for n in 1..=3i64 {
            let op = rx.recv().await.expect("replayed op");
            assert_eq!(op.ts, n);
            assert!(op.enq_seq > 3, "replay re-admits under fresh sequences");
        }

        // the old range is gone; only the copies remain live
        assert_eq!(wal.first_index(), 4);
        assert_eq!(wal.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn empty_wal_replays_nothing() -> anyhow::Result<()> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let wal = Arc::new(Wal::open(dir.path(), 1024, 64)?);
        let (queue, _rxs) = IngestQueue::new(1, 4, Duration::from_millis(50));
        assert_eq!(replay_wal(&wal, &queue).await?, (0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn poison_records_are_skipped_and_counted() -> anyhow::Result<()> {
        use std::io::Write;

        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let seg_path = dir.path().join(format!("{:020}.log", 1));
        {
            let wal = Wal::open(dir.path(), 1024, 64)?;
            wal.append(make_op(1))?;
        }
        // hand-craft a frame with a valid checksum but garbage payload
        {
            let payload = b"definitely not an op";
            let seq: u64 = 2;
            let mut body = Vec::new();
            body.extend_from_slice(&seq.to_le_bytes());
            body.extend_from_slice(payload);
            let crc = crc32fast::hash(&body);
            let mut frame = Vec::new();
            frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
            frame.extend_from_slice(&crc.to_le_bytes());
            frame.extend_from_slice(&body);
            let mut f = std::fs::OpenOptions::new().append(true).open(&seg_path)?;
            f.write_all(&frame)?;
        }

        let wal = Arc::new(Wal::open(dir.path(), 1024, 64)?);
        assert_eq!(wal.len(), 2);

        let (queue, mut rxs) = IngestQueue::new(1, 16, Duration::from_millis(100));
        let (replayed, errors) = replay_wal(&wal, &queue).await?;
        assert_eq!((replayed, errors), (1, 1));
        let op = rxs[0].recv().await.expect("good op");
        assert_eq!(op.ts, 1);
        Ok(())
    }
}
