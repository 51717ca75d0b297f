//! The batch apply protocol.
//!
//! `apply_batch` takes the ops an ApplyWorker accumulated and makes their
//! effects durable in one cycle: group by thread, load each thread's index
//! state, preload provisional-key mappings, apply per thread in
//! `(priority, ts)` order into the batch buffers, then flush both stores.
//! Either every effect commits or none do (modulo the storedb-first window
//! the KvManager documents).
//!
//! Validation, access and not-found failures poison only their own op: the
//! op is logged and dropped, and its WAL record is still truncated by the
//! caller. Store failures abort the whole batch with the WAL intact.

use crate::error::{StorageError, StorageResult};
use crate::index::IndexManager;
use crate::keys;
use crate::kv::KvManager;
use crate::sequencer::MessageSequencer;
use crate::stores::Stores;
use crate::{data, Handler, Message, MessagePatch, OpPayload, QueueOp, ReactionChange, Thread, ThreadPatch, Tombstone};
use std::collections::HashMap;

pub fn apply_batch(stores: &Stores, entries: Vec<QueueOp>) -> StorageResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut kv = KvManager::new();
    let mut indexes = IndexManager::new();
    let mut sequencer = MessageSequencer::new();

    // (a) bucket by thread
    let mut by_thread: HashMap<String, Vec<QueueOp>> = HashMap::new();
    for op in entries {
        by_thread.entry(op.thread_key()).or_default().push(op);
    }

    // (b) load per-thread index state
    for thread_key in by_thread.keys().filter(|k| !k.is_empty()) {
        indexes.load_thread(&kv, stores, thread_key)?;
    }

    // (c) resolve provisional keys already persisted by earlier batches
    let provisional: Vec<&str> = by_thread
        .values()
        .flatten()
        .map(|op| op.payload_key())
        .filter(|k| keys::is_provisional_message_key(k))
        .collect();
    sequencer.preload(stores, provisional)?;

    // (d) apply per thread in (priority, ts) order
    for (thread_key, mut ops) in by_thread {
        if thread_key.is_empty() {
            for op in &ops {
                log::warn!(
                    "dropping {:?} (seq {}): no thread key",
                    op.handler,
                    op.enq_seq
                );
            }
            continue;
        }
        ops.sort_by(|a, b| {
            (a.handler.priority(), a.ts, a.enq_seq).cmp(&(b.handler.priority(), b.ts, b.enq_seq))
        });
        for op in ops {
            match apply_op(stores, &mut kv, &mut indexes, &mut sequencer, &thread_key, &op) {
                Ok(()) => {}
                Err(e) if e.is_op_local() => {
                    log::warn!(
                        "dropping {:?} (seq {}): {} ({e})",
                        op.handler,
                        op.enq_seq,
                        e.kind().as_str()
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    // (e) flush
    indexes.save_all(&mut kv)?;
    kv.flush(stores)
}

fn apply_op(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    sequencer: &mut MessageSequencer,
    thread_key: &str,
    op: &QueueOp,
) -> StorageResult<()> {
    match (&op.handler, &op.payload) {
        (Handler::ThreadCreate, OpPayload::Thread(t)) => {
            thread_create(stores, kv, indexes, thread_key, op, t)
        }
        (Handler::ThreadUpdate, OpPayload::ThreadPatch(p)) => {
            thread_update(stores, kv, indexes, thread_key, op, p)
        }
        (Handler::ThreadDelete, OpPayload::Tombstone(t)) => {
            thread_delete(stores, kv, indexes, thread_key, op, t)
        }
        (Handler::MessageCreate, OpPayload::Message(m)) => {
            message_create(stores, kv, indexes, sequencer, thread_key, op, m)
        }
        (Handler::MessageUpdate, OpPayload::MessagePatch(p)) => {
            message_update(stores, kv, indexes, sequencer, thread_key, op, p)
        }
        (Handler::MessageDelete, OpPayload::Tombstone(t)) => {
            message_delete(stores, kv, indexes, sequencer, thread_key, op, t)
        }
        (Handler::ReactionAdd, OpPayload::Reaction(r)) => {
            reaction_apply(stores, kv, indexes, sequencer, thread_key, op, r, true)
        }
        (Handler::ReactionDelete, OpPayload::Reaction(r)) => {
            reaction_apply(stores, kv, indexes, sequencer, thread_key, op, r, false)
        }
        (handler, _) => Err(StorageError::Validation(format!(
            "payload variant does not match handler {handler:?}"
        ))),
    }
}

fn require_member(
    indexes: &IndexManager,
    kv: &KvManager,
    stores: &Stores,
    caller: &str,
    thread_key: &str,
) -> StorageResult<()> {
    if indexes.owns(kv, stores, caller, thread_key)?
        || indexes.participates(kv, stores, caller, thread_key)?
    {
        Ok(())
    } else {
        Err(StorageError::Forbidden(format!(
            "{caller} is not a member of {thread_key}"
        )))
    }
}

fn require_caller(op: &QueueOp) -> StorageResult<&str> {
    op.caller()
        .ok_or_else(|| StorageError::Validation("caller identity required".into()))
}

/// Resolve a payload message key to its final form, consulting the batch
/// scratch first and the sequencer cache second. A provisional key that
/// maps to nothing was never admitted as a create: `invalid_key`.
fn resolve_final_key(
    kv: &KvManager,
    sequencer: &MessageSequencer,
    key: &str,
) -> StorageResult<String> {
    let parsed = keys::parse_message_key(key)?;
    if !parsed.is_provisional() {
        return Ok(key.to_string());
    }
    kv.state_get(key)
        .or_else(|| sequencer.resolve(key))
        .map(str::to_string)
        .ok_or_else(|| StorageError::InvalidKey(key.to_string()))
}

fn thread_create(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    thread_key: &str,
    op: &QueueOp,
    payload: &Thread,
) -> StorageResult<()> {
    if payload.author.is_empty() {
        return Err(StorageError::Validation("thread author required".into()));
    }
    if let Some(mut existing) = data::load_thread(kv, stores, thread_key)? {
        if existing.author != payload.author {
            return Err(StorageError::Forbidden(format!(
                "{thread_key} already belongs to another author"
            )));
        }
        // re-submission: no-op except the update stamp
        existing.updated_ts = op.ts;
        data::save_thread(kv, &existing)?;
        indexes.set_ownership(kv, &existing.author, thread_key);
        return Ok(());
    }

    let mut thread = payload.clone();
    if thread.created_ts == 0 {
        thread.created_ts = keys::parse_thread_key(thread_key)?;
    }
    if thread.updated_ts == 0 {
        thread.updated_ts = op.ts;
    }
    thread.deleted = false;
    data::save_thread(kv, &thread)?;
    indexes.set_ownership(kv, &thread.author, thread_key);
    // message index starts at zeros; load_thread in step (b) put it there
    indexes.thread_mut(thread_key);
    Ok(())
}

fn thread_update(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    thread_key: &str,
    op: &QueueOp,
    patch: &ThreadPatch,
) -> StorageResult<()> {
    let caller = require_caller(op)?;
    let mut thread = data::load_thread(kv, stores, thread_key)?
        .ok_or_else(|| StorageError::NotFound(thread_key.to_string()))?;
    if !indexes.owns(kv, stores, caller, thread_key)? {
        return Err(StorageError::Forbidden(format!(
            "{caller} does not own {thread_key}"
        )));
    }
    if let Some(title) = &patch.title {
        thread.title = Some(title.clone());
    }
    if let Some(slug) = &patch.slug {
        thread.slug = Some(slug.clone());
    }
    thread.updated_ts = op.ts;
    data::save_thread(kv, &thread)
}

fn thread_delete(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    thread_key: &str,
    op: &QueueOp,
    _tombstone: &Tombstone,
) -> StorageResult<()> {
    let caller = require_caller(op)?;
    let mut thread = data::load_thread(kv, stores, thread_key)?
        .ok_or_else(|| StorageError::NotFound(thread_key.to_string()))?;
    require_member(indexes, kv, stores, caller, thread_key)?;
    thread.deleted = true;
    thread.updated_ts = op.ts;
    data::save_thread(kv, &thread)?;
    // ownership/participation markers stay: admin access checks need them
    indexes.set_deleted_marker(kv, thread_key);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn message_create(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    sequencer: &mut MessageSequencer,
    thread_key: &str,
    op: &QueueOp,
    payload: &Message,
) -> StorageResult<()> {
    if payload.author.is_empty() {
        return Err(StorageError::Validation("message author required".into()));
    }
    let thread = data::load_thread(kv, stores, thread_key)?
        .ok_or_else(|| StorageError::NotFound(thread_key.to_string()))?;
    if thread.deleted {
        return Err(StorageError::Forbidden(format!(
            "{thread_key} is deleted"
        )));
    }
    require_member(indexes, kv, stores, &payload.author, thread_key)?;

    let parsed = keys::parse_message_key(&payload.key)?;
    if !parsed.is_provisional() {
        return Err(StorageError::InvalidKey(payload.key.clone()));
    }
    let final_key = match sequencer.resolve(&payload.key) {
        Some(known) => known.to_string(),
        None => sequencer.assign(
            thread_key,
            &payload.key,
            parsed.msg_ts,
            indexes.thread_mut(thread_key),
        ),
    };
    kv.state_put(payload.key.clone(), final_key.clone());
    if data::load_message(kv, stores, &final_key)?.is_some() {
        // duplicate create for an already-sequenced provisional: no-op
        log::trace!("duplicate create for {} -> {final_key}", payload.key);
        return Ok(());
    }

    let mut message = payload.clone();
    message.key = final_key;
    message.thread = thread_key.to_string();
    if message.created_ts == 0 {
        message.created_ts = parsed.msg_ts;
    }
    if message.updated_ts == 0 {
        message.updated_ts = op.ts;
    }
    message.deleted = false;
    data::save_message(kv, &message)?;
    indexes
        .thread_mut(thread_key)
        .note_created(message.created_ts, message.updated_ts);
    indexes.set_participation(kv, thread_key, &message.author);
    Ok(())
}

fn message_update(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    sequencer: &mut MessageSequencer,
    thread_key: &str,
    op: &QueueOp,
    patch: &MessagePatch,
) -> StorageResult<()> {
    let caller = require_caller(op)?;
    require_member(indexes, kv, stores, caller, thread_key)?;
    let final_key = resolve_final_key(kv, sequencer, &patch.key)?;
    let mut message = data::load_message(kv, stores, &final_key)?
        .ok_or_else(|| StorageError::NotFound(final_key.clone()))?;

    data::append_version(kv, &message)?;
    if let Some(body) = &patch.body {
        message.body = body.clone();
    }
    message.updated_ts = op.ts;
    data::save_message(kv, &message)?;
    indexes.thread_mut(thread_key).note_updated(op.ts);
    Ok(())
}

fn message_delete(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    sequencer: &mut MessageSequencer,
    thread_key: &str,
    op: &QueueOp,
    tombstone: &Tombstone,
) -> StorageResult<()> {
    let caller = require_caller(op)?;
    require_member(indexes, kv, stores, caller, thread_key)?;
    let final_key = resolve_final_key(kv, sequencer, &tombstone.key)?;
    let mut message = data::load_message(kv, stores, &final_key)?
        .ok_or_else(|| StorageError::NotFound(final_key.clone()))?;

    data::append_version(kv, &message)?;
    message.deleted = true;
    message.updated_ts = op.ts;
    data::save_message(kv, &message)?;
    indexes.set_deleted_marker(kv, &final_key);
    indexes.thread_mut(thread_key).note_skip(final_key);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn reaction_apply(
    stores: &Stores,
    kv: &mut KvManager,
    indexes: &mut IndexManager,
    sequencer: &mut MessageSequencer,
    thread_key: &str,
    op: &QueueOp,
    change: &ReactionChange,
    add: bool,
) -> StorageResult<()> {
    let caller = require_caller(op)?;
    require_member(indexes, kv, stores, caller, thread_key)?;
    let final_key = resolve_final_key(kv, sequencer, &change.key)?;
    let mut message = data::load_message(kv, stores, &final_key)?
        .ok_or_else(|| StorageError::NotFound(final_key.clone()))?;

    if add {
        message
            .reactions
            .insert(caller.to_string(), change.reaction.clone());
    } else {
        message.reactions.remove(caller);
    }
    message.updated_ts = op.ts;
    data::save_message(kv, &message)
}
