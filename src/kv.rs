//! Buffered writes for one batch cycle.
//!
//! Nothing an op applier does touches the stores directly: mutations
//! accumulate in `store_kv`/`index_kv` and become visible in one
//! `flush()`: a fsynced storedb commit followed by a fsynced indexdb
//! commit. `state_kv` is per-batch scratch and is never persisted.
//!
//! The two commits are not one transaction. Committing data first means
//! readers may briefly see storedb ahead of indexdb; if the index commit
//! then fails, the index mutations are staged as `temp_idx:` entries so
//! startup recovery can promote them (the batch still reports failure and
//! the WAL keeps its records).

use crate::error::StorageResult;
use crate::keys;
use crate::stores::Stores;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct KvManager {
    /// Pending data-store writes; `None` is a delete.
    store_kv: HashMap<String, Option<Vec<u8>>>,
    /// Pending index-store writes.
    index_kv: HashMap<String, Option<Vec<u8>>>,
    /// Batch-local scratch (provisional mappings, lookups); never persisted.
    state_kv: HashMap<String, String>,
}

impl KvManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_store(&mut self, key: String, value: Vec<u8>) {
        self.store_kv.insert(key, Some(value));
    }

    pub fn delete_store(&mut self, key: String) {
        self.store_kv.insert(key, None);
    }

    pub fn put_index(&mut self, key: String, value: Vec<u8>) {
        self.index_kv.insert(key, Some(value));
    }

    pub fn delete_index(&mut self, key: String) {
        self.index_kv.insert(key, None);
    }

    pub fn state_put(&mut self, key: String, value: String) {
        self.state_kv.insert(key, value);
    }

    pub fn state_get(&self, key: &str) -> Option<&str> {
        self.state_kv.get(key).map(String::as_str)
    }

    /// Read-through get: the batch's own pending write wins over the store.
    pub fn get_store(&self, stores: &Stores, key: &str) -> StorageResult<Option<Vec<u8>>> {
        if let Some(pending) = self.store_kv.get(key) {
            return Ok(pending.clone());
        }
        stores.get_store(key)
    }

    pub fn get_index(&self, stores: &Stores, key: &str) -> StorageResult<Option<Vec<u8>>> {
        if let Some(pending) = self.index_kv.get(key) {
            return Ok(pending.clone());
        }
        stores.get_index(key)
    }

    pub fn is_empty(&self) -> bool {
        self.store_kv.is_empty() && self.index_kv.is_empty()
    }

    /// Commit everything: storedb first, indexdb second, each fsynced.
    /// On success all three maps are cleared; on failure the caller leaves
    /// the WAL intact so the ops run again.
    pub fn flush(&mut self, stores: &Stores) -> StorageResult<()> {
        if self.is_empty() {
            self.state_kv.clear();
            return Ok(());
        }

        let mut store_batch = stores.store_keyspace.batch();
        for (key, value) in &self.store_kv {
            match value {
                Some(v) => store_batch.insert(&stores.store, key.as_bytes(), v.as_slice()),
                None => store_batch.remove(&stores.store, key.as_bytes()),
            }
        }
        store_batch.commit()?;
        stores.sync_store()?;

        let mut index_batch = stores.index_keyspace.batch();
        for (key, value) in &self.index_kv {
            match value {
                Some(v) => index_batch.insert(&stores.index, key.as_bytes(), v.as_slice()),
                None => index_batch.remove(&stores.index, key.as_bytes()),
            }
        }
        if let Err(e) = index_batch
            .commit()
            .map_err(Into::into)
            .and_then(|()| stores.sync_index())
        {
            log::error!("index commit failed after data commit; staging temp indexes: {e}");
            self.stage_temp_indexes(stores);
            return Err(e);
        }

        self.store_kv.clear();
        self.index_kv.clear();
        self.state_kv.clear();
        Ok(())
    }

    /// Best-effort staging of the index mutations that should exist because
    /// their data already committed. Promoted (and removed) by recovery.
    fn stage_temp_indexes(&self, stores: &Stores) {
        for (key, value) in &self.index_kv {
            let (kind, bytes) = match value {
                Some(v) => ("set", v.as_slice()),
                None => ("del", &b""[..]),
            };
            let staged = keys::temp_index_key(kind, key);
            if let Err(e) = stores.index.insert(staged.as_bytes(), bytes) {
                log::error!("failed to stage temp index for {key}: {e}");
            }
        }
        if let Err(e) = stores.sync_index() {
            log::error!("failed to sync staged temp indexes: {e}");
        }
    }
}
