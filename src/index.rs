//! Derived-index state for one batch cycle.
//!
//! The per-thread message index lives in indexdb as seven keys
//! (`idx:t:<T>:ms:{start,end,cdeltas,udeltas,skips,lc,lu}`). A batch loads
//! each touched thread's fields into memory once, mutates them as ops
//! apply, and writes all fields back through the KvManager at the end.
//! `end` doubles as the sequence allocator: it counts every sequence ever
//! assigned in the thread and never decreases.
//!
//! Ownership (`rel:u:<user>:t:<T>`), participation (`rel:t:<T>:u:<user>`)
//! and soft-delete (`del:<key>`) markers are plain `"1"` rows in indexdb.

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::kv::KvManager;
use crate::stores::Stores;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MARKER_VALUE: &[u8] = b"1";

const FIELDS: [&str; 7] = ["start", "end", "cdeltas", "udeltas", "skips", "lc", "lu"];

/// In-memory form of a thread's message index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadIndex {
    pub start: u64,
    /// Count of sequences ever assigned; the next allocation.
    pub end: u64,
    /// Created-timestamp deltas, appended per message write.
    pub cdeltas: Vec<i64>,
    /// Updated-timestamp deltas.
    pub udeltas: Vec<i64>,
    /// Final keys of soft-deleted messages, for readers to skip.
    pub skips: Vec<String>,
    /// Latest created timestamp seen.
    pub lc: i64,
    /// Latest updated timestamp seen.
    pub lu: i64,
}

impl ThreadIndex {
    pub fn note_created(&mut self, created_ts: i64, updated_ts: i64) {
        self.cdeltas.push(created_ts - self.lc);
        self.udeltas.push(updated_ts - self.lu);
        if created_ts > self.lc {
            self.lc = created_ts;
        }
        if updated_ts > self.lu {
            self.lu = updated_ts;
        }
    }

    pub fn note_updated(&mut self, updated_ts: i64) {
        self.udeltas.push(updated_ts - self.lu);
        if updated_ts > self.lu {
            self.lu = updated_ts;
        }
    }

    pub fn note_skip(&mut self, final_key: String) {
        if !self.skips.contains(&final_key) {
            self.skips.push(final_key);
        }
    }
}

#[derive(Debug, Default)]
pub struct IndexManager {
    threads: HashMap<String, ThreadIndex>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a thread's index fields into memory; missing fields initialize
    /// to zeros. Any store failure other than not-found fails the batch.
    pub fn load_thread(
        &mut self,
        kv: &KvManager,
        stores: &Stores,
        thread_key: &str,
    ) -> StorageResult<()> {
        if self.threads.contains_key(thread_key) {
            return Ok(());
        }
        let mut idx = ThreadIndex::default();
        for field in FIELDS {
            let key = keys::thread_index_field_key(thread_key, field);
            let Some(bytes) = kv.get_index(stores, &key)? else {
                continue;
            };
            parse_field(&mut idx, field, &bytes)
                .map_err(|e| StorageError::BadStateError(format!("corrupt index {key}: {e}")))?;
        }
        self.threads.insert(thread_key.to_string(), idx);
        Ok(())
    }

    pub fn thread(&self, thread_key: &str) -> Option<&ThreadIndex> {
        self.threads.get(thread_key)
    }

    pub fn thread_mut(&mut self, thread_key: &str) -> &mut ThreadIndex {
        self.threads.entry(thread_key.to_string()).or_default()
    }

    /// Serialize every loaded thread's fields into the index buffer.
    pub fn save_all(&self, kv: &mut KvManager) -> StorageResult<()> {
        for (thread_key, idx) in &self.threads {
            kv.put_index(
                keys::thread_index_field_key(thread_key, "start"),
                serde_json::to_vec(&idx.start)?,
            );
            kv.put_index(
                keys::thread_index_field_key(thread_key, "end"),
                serde_json::to_vec(&idx.end)?,
            );
            kv.put_index(
                keys::thread_index_field_key(thread_key, "cdeltas"),
                serde_json::to_vec(&idx.cdeltas)?,
            );
            kv.put_index(
                keys::thread_index_field_key(thread_key, "udeltas"),
                serde_json::to_vec(&idx.udeltas)?,
            );
            kv.put_index(
                keys::thread_index_field_key(thread_key, "skips"),
                serde_json::to_vec(&idx.skips)?,
            );
            kv.put_index(
                keys::thread_index_field_key(thread_key, "lc"),
                serde_json::to_vec(&idx.lc)?,
            );
            kv.put_index(
                keys::thread_index_field_key(thread_key, "lu"),
                serde_json::to_vec(&idx.lu)?,
            );
        }
        Ok(())
    }

    pub fn set_ownership(&self, kv: &mut KvManager, user_id: &str, thread_key: &str) {
        kv.put_index(
            keys::rel_user_thread_key(user_id, thread_key),
            MARKER_VALUE.to_vec(),
        );
        kv.put_index(
            keys::rel_thread_user_key(thread_key, user_id),
            MARKER_VALUE.to_vec(),
        );
    }

    pub fn set_participation(&self, kv: &mut KvManager, thread_key: &str, user_id: &str) {
        kv.put_index(
            keys::rel_thread_user_key(thread_key, user_id),
            MARKER_VALUE.to_vec(),
        );
    }

    pub fn owns(
        &self,
        kv: &KvManager,
        stores: &Stores,
        user_id: &str,
        thread_key: &str,
    ) -> StorageResult<bool> {
        let key = keys::rel_user_thread_key(user_id, thread_key);
        Ok(kv.get_index(stores, &key)?.is_some())
    }

    pub fn participates(
        &self,
        kv: &KvManager,
        stores: &Stores,
        user_id: &str,
        thread_key: &str,
    ) -> StorageResult<bool> {
        let key = keys::rel_thread_user_key(thread_key, user_id);
        Ok(kv.get_index(stores, &key)?.is_some())
    }

    pub fn set_deleted_marker(&self, kv: &mut KvManager, key: &str) {
        kv.put_index(keys::del_marker_key(key), MARKER_VALUE.to_vec());
    }

    pub fn is_marked_deleted(
        &self,
        kv: &KvManager,
        stores: &Stores,
        key: &str,
    ) -> StorageResult<bool> {
        Ok(kv.get_index(stores, &keys::del_marker_key(key))?.is_some())
    }
}

fn parse_field(idx: &mut ThreadIndex, field: &str, bytes: &[u8]) -> serde_json::Result<()> {
    match field {
        "start" => idx.start = serde_json::from_slice(bytes)?,
        "end" => idx.end = serde_json::from_slice(bytes)?,
        "cdeltas" => idx.cdeltas = serde_json::from_slice(bytes)?,
        "udeltas" => idx.udeltas = serde_json::from_slice(bytes)?,
        "skips" => idx.skips = serde_json::from_slice(bytes)?,
        "lc" => idx.lc = serde_json::from_slice(bytes)?,
        "lu" => idx.lu = serde_json::from_slice(bytes)?,
        _ => unreachable!("unknown index field {field}"),
    }
    Ok(())
}
