//! Provisional-key resolution and per-thread sequence allocation.
//!
//! Sequences are allocated from the in-memory `ThreadIndex::end` only; the
//! durable counter advances when the batch flushes. A batch that fails to
//! commit releases its allocations with it, and the matching message writes
//! died in the same failed commit, so reassignment on retry is safe.

use crate::error::StorageResult;
use crate::index::ThreadIndex;
use crate::keys;
use crate::stores::Stores;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MessageSequencer {
    /// provisional key -> final key, valid for this batch only.
    mapping: HashMap<String, String>,
}

impl MessageSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve already-persisted final keys for every provisional key the
    /// batch mentions, so the per-op path never reads the stores. The final
    /// key differs from the provisional only by its `:<seq>` suffix, so one
    /// bounded scan per key finds it.
    pub fn preload<'a>(
        &mut self,
        stores: &Stores,
        provisional: impl IntoIterator<Item = &'a str>,
    ) -> StorageResult<()> {
        for prov in provisional {
            if self.mapping.contains_key(prov) {
                continue;
            }
            let lower = format!("{prov}:");
            let upper = keys::next_prefix(&lower);
            let Some(entry) = stores.store.range(lower.into_bytes()..upper).next() else {
                continue;
            };
            let (key_bytes, _) = entry?;
            let final_key = match std::str::from_utf8(&key_bytes) {
                Ok(s) => s.to_string(),
                Err(e) => panic!("non-utf8 message key in store under {prov:?}: {e}"),
            };
            log::trace!("sequencer preload: {prov} -> {final_key}");
            self.mapping.insert(prov.to_string(), final_key);
        }
        Ok(())
    }

    pub fn resolve(&self, provisional: &str) -> Option<&str> {
        self.mapping.get(provisional).map(String::as_str)
    }

    /// Allocate the next sequence for this thread and record the mapping.
    /// Idempotence is the caller's job: check [`resolve`] first.
    pub fn assign(
        &mut self,
        thread_key: &str,
        provisional: &str,
        msg_ts: i64,
        idx: &mut ThreadIndex,
    ) -> String {
        let seq = idx.end;
        idx.end += 1;
        let final_key = keys::gen_message_key(thread_key, msg_ts, seq);
        self.mapping
            .insert(provisional.to_string(), final_key.clone());
        final_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stores() -> (tempfile::TempDir, Stores) {
        crate::init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(dir.path()).unwrap();
        (dir, stores)
    }

    #[test]
    fn assign_increments_end_and_caches() {
        let tk = keys::gen_thread_key(1);
        let prov = keys::gen_message_provisional_key(&tk, 10);
        let mut idx = ThreadIndex::default();
        let mut seq = MessageSequencer::new();

        let final_key = seq.assign(&tk, &prov, 10, &mut idx);
        assert_eq!(final_key, keys::gen_message_key(&tk, 10, 0));
        assert_eq!(idx.end, 1);
        assert_eq!(seq.resolve(&prov), Some(final_key.as_str()));

        // a second provisional gets the next sequence
        let prov2 = keys::gen_message_provisional_key(&tk, 20);
        let final2 = seq.assign(&tk, &prov2, 20, &mut idx);
        assert_eq!(final2, keys::gen_message_key(&tk, 20, 1));
        assert_eq!(idx.end, 2);
    }

    #[test]
    fn preload_finds_persisted_final_keys() -> anyhow::Result<()> {
        let (_dir, stores) = test_stores();
        let tk = keys::gen_thread_key(1);
        let prov = keys::gen_message_provisional_key(&tk, 10);
        let final_key = keys::gen_message_key(&tk, 10, 4);
        stores.store.insert(final_key.as_bytes(), b"{}")?;

        // a later message must not be picked up by the bounded scan
        let other = keys::gen_message_key(&tk, 11, 5);
        stores.store.insert(other.as_bytes(), b"{}")?;

        let mut seq = MessageSequencer::new();
        seq.preload(&stores, [prov.as_str(), "t:00000000000000000002:m:00000000000000000099"])?;
        assert_eq!(seq.resolve(&prov), Some(final_key.as_str()));
        assert_eq!(
            seq.resolve("t:00000000000000000002:m:00000000000000000099"),
            None
        );
        Ok(())
    }

    #[test]
    fn preload_does_not_clobber_in_batch_assignment() -> anyhow::Result<()> {
        let (_dir, stores) = test_stores();
        let tk = keys::gen_thread_key(1);
        let prov = keys::gen_message_provisional_key(&tk, 10);
        let mut idx = ThreadIndex::default();
        let mut seq = MessageSequencer::new();
        let assigned = seq.assign(&tk, &prov, 10, &mut idx);

        seq.preload(&stores, [prov.as_str()])?;
        assert_eq!(seq.resolve(&prov), Some(assigned.as_str()));
        Ok(())
    }
}
