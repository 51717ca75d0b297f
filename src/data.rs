//! Thread metadata and message bodies, read and written through the batch
//! buffer so in-batch mutations are visible to later ops in the same batch.

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::kv::KvManager;
use crate::stores::Stores;
use crate::{Message, Thread};

pub fn load_thread(
    kv: &KvManager,
    stores: &Stores,
    thread_key: &str,
) -> StorageResult<Option<Thread>> {
    let Some(bytes) = kv.get_store(stores, thread_key)? else {
        return Ok(None);
    };
    let thread = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::BadStateError(format!("corrupt thread {thread_key}: {e}")))?;
    Ok(Some(thread))
}

pub fn save_thread(kv: &mut KvManager, thread: &Thread) -> StorageResult<()> {
    kv.put_store(thread.key.clone(), serde_json::to_vec(thread)?);
    Ok(())
}

pub fn load_message(
    kv: &KvManager,
    stores: &Stores,
    final_key: &str,
) -> StorageResult<Option<Message>> {
    let Some(bytes) = kv.get_store(stores, final_key)? else {
        return Ok(None);
    };
    let message = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::BadStateError(format!("corrupt message {final_key}: {e}")))?;
    Ok(Some(message))
}

pub fn save_message(kv: &mut KvManager, message: &Message) -> StorageResult<()> {
    kv.put_store(message.key.clone(), serde_json::to_vec(message)?);
    Ok(())
}

/// Append a version row holding the pre-image of a message that is about to
/// be rewritten. The row is keyed by the pre-image's own `(ts, seq)` so the
/// `v:` prefix reads back as an ascending history.
pub fn append_version(kv: &mut KvManager, pre_image: &Message) -> StorageResult<()> {
    let parsed = match keys::parse_message_key(&pre_image.key) {
        Ok(p) => p,
        // a stored record whose own key doesn't parse means the store is
        // corrupt; continuing would spread the damage
        Err(e) => panic!("unparseable stored message key {:?}: {e}", pre_image.key),
    };
    let seq = parsed
        .seq
        .unwrap_or_else(|| panic!("stored message {:?} has a provisional key", pre_image.key));
    let ts = if pre_image.updated_ts != 0 {
        pre_image.updated_ts
    } else {
        pre_image.created_ts
    };
    let version_key = keys::gen_version_key(&pre_image.key, ts, seq);
    kv.put_store(version_key, serde_json::to_vec(pre_image)?);
    Ok(())
}
