//! The two embedded stores and the on-disk root layout.
//!
//! `<root>/storedb` holds canonical thread/message/version records;
//! `<root>/indexdb` holds everything derived (thread-message indexes,
//! rel/del markers, temp-index staging). Both are fjall keyspaces with a
//! single `default` partition. `<root>/system.json` stamps the schema so a
//! newer on-disk layout refuses to open under an older library.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SystemManifest {
    schema_version: u32,
    created_at: DateTime<Utc>,
    migrated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Stores {
    pub store_keyspace: Keyspace,
    pub store: PartitionHandle,
    pub index_keyspace: Keyspace,
    pub index: PartitionHandle,
}

impl Stores {
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        check_or_write_manifest(root)?;

        let store_keyspace = Config::new(root.join("storedb")).open()?;
        let store = store_keyspace.open_partition("default", PartitionCreateOptions::default())?;
        let index_keyspace = Config::new(root.join("indexdb")).open()?;
        let index = index_keyspace.open_partition("default", PartitionCreateOptions::default())?;

        Ok(Self {
            store_keyspace,
            store,
            index_keyspace,
            index,
        })
    }

    pub fn get_store(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.store.get(key.as_bytes())?.map(|s| s.to_vec()))
    }

    pub fn get_index(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.index.get(key.as_bytes())?.map(|s| s.to_vec()))
    }

    /// Make a just-committed storedb batch durable.
    pub fn sync_store(&self) -> StorageResult<()> {
        self.store_keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Make a just-committed indexdb batch durable.
    pub fn sync_index(&self) -> StorageResult<()> {
        self.index_keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

fn check_or_write_manifest(root: &Path) -> StorageResult<()> {
    let path = root.join("system.json");
    if path.exists() {
        let bytes = fs::read(&path)?;
        let manifest: SystemManifest = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::InitError(format!("unreadable system.json: {e}")))?;
        if manifest.schema_version > SCHEMA_VERSION {
            return Err(StorageError::InitError(format!(
                "store schema v{} is newer than supported v{SCHEMA_VERSION}, refusing to open",
                manifest.schema_version
            )));
        }
        if manifest.schema_version < SCHEMA_VERSION {
            // no migrations exist yet below the current version; just restamp
            log::info!(
                "migrating store schema v{} -> v{SCHEMA_VERSION}",
                manifest.schema_version
            );
            let migrated = SystemManifest {
                schema_version: SCHEMA_VERSION,
                created_at: manifest.created_at,
                migrated_at: Utc::now(),
            };
            fs::write(&path, serde_json::to_vec_pretty(&migrated)?)?;
        }
        return Ok(());
    }
    log::info!("initializing a fresh db at {root:?}");
    let now = Utc::now();
    let manifest = SystemManifest {
        schema_version: SCHEMA_VERSION,
        created_at: now,
        migrated_at: now,
    };
    fs::write(&path, serde_json::to_vec_pretty(&manifest)?)?;
    Ok(())
}
