//! Read APIs consumed by collaborators.
//!
//! All scans run on blocking threads; the async surface is a thin
//! `spawn_blocking` wrapper per call. Reads are index-light on purpose:
//! the data store's key order already yields messages in `(msgTS, seq)`
//! order, and tolerating the brief storedb-ahead-of-indexdb window means
//! preferring bounded storedb prefix scans over index lookups.

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::stores::Stores;
use crate::{Message, Thread};

#[derive(Clone)]
pub struct Reader {
    stores: Stores,
}

impl Reader {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn get_thread(&self, key: &str) -> StorageResult<Option<Thread>> {
        let stores = self.stores.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || get_thread_sync(&stores, &key)).await?
    }

    /// Every thread metadata record, deleted ones included; callers filter
    /// by author/title/slug/deleted.
    pub async fn list_threads(&self) -> StorageResult<Vec<Thread>> {
        let stores = self.stores.clone();
        tokio::task::spawn_blocking(move || list_threads_sync(&stores)).await?
    }

    /// Messages of a thread in `(msgTS, seq)` order, latest value per id.
    /// Soft-deleted messages are filtered unless `include_deleted` (the
    /// admin view) is set.
    pub async fn list_messages(
        &self,
        thread_key: &str,
        limit: Option<usize>,
        include_deleted: bool,
    ) -> StorageResult<Vec<Message>> {
        let stores = self.stores.clone();
        let thread_key = thread_key.to_string();
        tokio::task::spawn_blocking(move || {
            list_messages_sync(&stores, &thread_key, limit, include_deleted)
        })
        .await?
    }

    /// Newest value stored under a message's final key. A provisional key
    /// is resolved with a bounded prefix scan.
    pub async fn get_latest_message(&self, msg_id: &str) -> StorageResult<Option<Message>> {
        let stores = self.stores.clone();
        let msg_id = msg_id.to_string();
        tokio::task::spawn_blocking(move || get_latest_message_sync(&stores, &msg_id)).await?
    }

    /// Full ascending history: appended pre-image rows, then the current
    /// record.
    pub async fn list_message_versions(&self, msg_id: &str) -> StorageResult<Vec<Message>> {
        let stores = self.stores.clone();
        let msg_id = msg_id.to_string();
        tokio::task::spawn_blocking(move || list_message_versions_sync(&stores, &msg_id)).await?
    }

    pub async fn storage_stats(&self) -> StorageResult<serde_json::Value> {
        let stores = self.stores.clone();
        tokio::task::spawn_blocking(move || {
            Ok(serde_json::json!({
                "storedb_disk_space": stores.store_keyspace.disk_space(),
                "storedb_journal_count": stores.store_keyspace.journal_count(),
                "storedb_sequence": stores.store_keyspace.instant(),
                "indexdb_disk_space": stores.index_keyspace.disk_space(),
                "indexdb_journal_count": stores.index_keyspace.journal_count(),
                "indexdb_sequence": stores.index_keyspace.instant(),
            }))
        })
        .await?
    }
}

fn get_thread_sync(stores: &Stores, key: &str) -> StorageResult<Option<Thread>> {
    keys::validate_thread_key(key)?;
    let Some(bytes) = stores.get_store(key)? else {
        return Ok(None);
    };
    let thread = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::BadStateError(format!("corrupt thread {key}: {e}")))?;
    Ok(Some(thread))
}

fn list_threads_sync(stores: &Stores) -> StorageResult<Vec<Thread>> {
    let mut out = Vec::new();
    for entry in stores.store.prefix(keys::THREAD_PREFIX.as_bytes()) {
        let (key_bytes, val_bytes) = entry?;
        let Ok(key) = std::str::from_utf8(&key_bytes) else {
            continue;
        };
        // message and version rows share the keyspace; only exact thread
        // keys are metadata
        if !keys::is_thread_key(key) {
            continue;
        }
        let thread = serde_json::from_slice(&val_bytes)
            .map_err(|e| StorageError::BadStateError(format!("corrupt thread {key}: {e}")))?;
        out.push(thread);
    }
    Ok(out)
}

fn list_messages_sync(
    stores: &Stores,
    thread_key: &str,
    limit: Option<usize>,
    include_deleted: bool,
) -> StorageResult<Vec<Message>> {
    keys::validate_thread_key(thread_key)?;
    let limit = limit.unwrap_or(usize::MAX);
    let prefix = keys::thread_messages_prefix(thread_key);
    let mut out = Vec::new();
    for entry in stores.store.prefix(prefix.as_bytes()) {
        if out.len() >= limit {
            break;
        }
        let (key_bytes, val_bytes) = entry?;
        let Ok(key) = std::str::from_utf8(&key_bytes) else {
            continue;
        };
        if !keys::is_final_message_key(key) {
            continue;
        }
        let message: Message = serde_json::from_slice(&val_bytes)
            .map_err(|e| StorageError::BadStateError(format!("corrupt message {key}: {e}")))?;
        if message.deleted && !include_deleted {
            continue;
        }
        out.push(message);
    }
    Ok(out)
}

/// Resolve a possibly-provisional message id to the final key under which
/// the record lives, if any.
fn resolve_msg_id(stores: &Stores, msg_id: &str) -> StorageResult<Option<String>> {
    let parsed = keys::parse_message_key(msg_id)?;
    if !parsed.is_provisional() {
        return Ok(Some(msg_id.to_string()));
    }
    let lower = format!("{msg_id}:");
    let upper = keys::next_prefix(&lower);
    let Some(entry) = stores.store.range(lower.into_bytes()..upper).next() else {
        return Ok(None);
    };
    let (key_bytes, _) = entry?;
    let key = String::from_utf8(key_bytes.to_vec())
        .map_err(|e| StorageError::BadStateError(format!("non-utf8 message key: {e}")))?;
    Ok(Some(key))
}

fn get_latest_message_sync(stores: &Stores, msg_id: &str) -> StorageResult<Option<Message>> {
    let Some(final_key) = resolve_msg_id(stores, msg_id)? else {
        return Ok(None);
    };
    let Some(bytes) = stores.get_store(&final_key)? else {
        return Ok(None);
    };
    let message = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::BadStateError(format!("corrupt message {final_key}: {e}")))?;
    Ok(Some(message))
}

fn list_message_versions_sync(stores: &Stores, msg_id: &str) -> StorageResult<Vec<Message>> {
    let Some(final_key) = resolve_msg_id(stores, msg_id)? else {
        return Ok(vec![]);
    };
    let mut out = Vec::new();
    let prefix = keys::message_versions_prefix(&final_key);
    for entry in stores.store.prefix(prefix.as_bytes()) {
        let (key_bytes, val_bytes) = entry?;
        let message = serde_json::from_slice(&val_bytes).map_err(|e| {
            StorageError::BadStateError(format!(
                "corrupt version row {:?}: {e}",
                String::from_utf8_lossy(&key_bytes)
            ))
        })?;
        out.push(message);
    }
    // the live record is the newest version
    if let Some(bytes) = stores.get_store(&final_key)? {
        let message = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::BadStateError(format!("corrupt message {final_key}: {e}")))?;
        out.push(message);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::apply_batch;
    use crate::{Extras, Handler, MessagePatch, OpPayload, QueueOp, Tombstone};

    fn test_reader() -> (tempfile::TempDir, Stores, Reader) {
        crate::init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(dir.path()).unwrap();
        let reader = Reader::new(stores.clone());
        (dir, stores, reader)
    }

    fn op(seq: u64, handler: Handler, ts: i64, payload: OpPayload, user: &str) -> QueueOp {
        QueueOp {
            enq_seq: seq,
            handler,
            ts,
            payload,
            extras: Extras {
                user_id: Some(user.to_string()),
            },
        }
    }

    fn seed_thread_with_messages(stores: &Stores, thread_ts: i64, msg_ts: &[i64]) -> String {
        let tk = keys::gen_thread_key(thread_ts);
        let mut ops = vec![op(
            1,
            Handler::ThreadCreate,
            thread_ts,
            OpPayload::Thread(Thread {
                key: tk.clone(),
                author: "u1".into(),
                ..Default::default()
            }),
            "u1",
        )];
        for (i, ts) in msg_ts.iter().enumerate() {
            ops.push(op(
                2 + i as u64,
                Handler::MessageCreate,
                thread_ts + 1 + i as i64,
                OpPayload::Message(Message {
                    key: keys::gen_message_provisional_key(&tk, *ts),
                    thread: tk.clone(),
                    author: "u1".into(),
                    body: serde_json::json!({"n": ts}),
                    ..Default::default()
                }),
                "u1",
            ));
        }
        apply_batch(stores, ops).unwrap();
        tk
    }

    #[tokio::test]
    async fn list_threads_skips_message_rows() -> anyhow::Result<()> {
        let (_dir, stores, reader) = test_reader();
        seed_thread_with_messages(&stores, 1, &[10, 20]);
        seed_thread_with_messages(&stores, 2, &[30]);

        let threads = reader.list_threads().await?;
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|t| keys::is_thread_key(&t.key)));
        Ok(())
    }

    #[tokio::test]
    async fn list_messages_orders_and_limits() -> anyhow::Result<()> {
        let (_dir, stores, reader) = test_reader();
        let tk = seed_thread_with_messages(&stores, 1, &[30, 10, 20]);

        let msgs = reader.list_messages(&tk, None, false).await?;
        assert_eq!(msgs.len(), 3);
        let ts: Vec<i64> = msgs.iter().map(|m| m.created_ts).collect();
        assert_eq!(ts, vec![10, 20, 30]);

        let limited = reader.list_messages(&tk, Some(2), false).await?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].created_ts, 10);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_messages_hidden_from_non_admin() -> anyhow::Result<()> {
        let (_dir, stores, reader) = test_reader();
        let tk = seed_thread_with_messages(&stores, 1, &[10, 20]);
        let victim = keys::gen_message_key(&tk, 10, 0);

        apply_batch(
            &stores,
            vec![op(
                10,
                Handler::MessageDelete,
                99,
                OpPayload::Tombstone(Tombstone {
                    key: victim.clone(),
                    author: "u1".into(),
                }),
                "u1",
            )],
        )?;

        let visible = reader.list_messages(&tk, None, false).await?;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].created_ts, 20);

        let admin = reader.list_messages(&tk, None, true).await?;
        assert_eq!(admin.len(), 2);
        assert!(admin[0].deleted);
        Ok(())
    }

    #[tokio::test]
    async fn version_history_is_ascending_and_ends_live() -> anyhow::Result<()> {
        let (_dir, stores, reader) = test_reader();
        let tk = seed_thread_with_messages(&stores, 1, &[100]);
        let prov = keys::gen_message_provisional_key(&tk, 100);

        apply_batch(
            &stores,
            vec![
                op(
                    10,
                    Handler::MessageUpdate,
                    150,
                    OpPayload::MessagePatch(MessagePatch {
                        key: prov.clone(),
                        body: Some(serde_json::json!({"v": 2})),
                    }),
                    "u1",
                ),
                op(
                    11,
                    Handler::MessageDelete,
                    200,
                    OpPayload::Tombstone(Tombstone {
                        key: prov.clone(),
                        author: "u1".into(),
                    }),
                    "u1",
                ),
            ],
        )?;

        let versions = reader.list_message_versions(&prov).await?;
        assert_eq!(versions.len(), 3);
        let stamps: Vec<i64> = versions.iter().map(|m| m.updated_ts).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(versions.last().unwrap().deleted);
        assert_eq!(versions.last().unwrap().updated_ts, 200);
        Ok(())
    }

    #[tokio::test]
    async fn latest_message_resolves_provisional_ids() -> anyhow::Result<()> {
        let (_dir, stores, reader) = test_reader();
        let tk = seed_thread_with_messages(&stores, 1, &[10]);
        let prov = keys::gen_message_provisional_key(&tk, 10);
        let final_key = keys::gen_message_key(&tk, 10, 0);

        let by_final = reader.get_latest_message(&final_key).await?.unwrap();
        let by_prov = reader.get_latest_message(&prov).await?.unwrap();
        assert_eq!(by_final, by_prov);
        assert_eq!(by_final.key, final_key);

        assert!(reader
            .get_latest_message(&keys::gen_message_provisional_key(&tk, 999))
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn get_thread_round_trip() -> anyhow::Result<()> {
        let (_dir, stores, reader) = test_reader();
        let tk = seed_thread_with_messages(&stores, 1, &[]);
        let thread = reader.get_thread(&tk).await?.unwrap();
        assert_eq!(thread.author, "u1");
        assert!(reader.get_thread(&keys::gen_thread_key(9)).await?.is_none());
        assert!(reader.get_thread("bogus").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn stats_cover_both_stores() -> anyhow::Result<()> {
        let (_dir, _stores, reader) = test_reader();
        let stats = reader.storage_stats().await?;
        assert!(stats.get("storedb_sequence").is_some());
        assert!(stats.get("indexdb_sequence").is_some());
        Ok(())
    }
}
