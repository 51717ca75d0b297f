//! ProgressDB ingest core: a thread/message store over two fjall keyspaces.
//!
//! Collaborators (the HTTP surface) admit operations through
//! [`pipeline::Ingest`], which validates, WAL-appends and enqueues each op.
//! Apply workers drain the queue in batches and commit atomically to the
//! data and index stores; [`reader::Reader`] serves the read side.

pub mod batch;
pub mod config;
pub mod data;
pub mod error;
pub mod index;
pub mod keys;
pub mod kv;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod recovery;
pub mod sequencer;
pub mod stores;
pub mod wal;

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Thread metadata record, stored under `t:<PAD20(createdTS)>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub author: String,
    #[serde(default)]
    pub created_ts: i64,
    #[serde(default)]
    pub updated_ts: i64,
    #[serde(default)]
    pub deleted: bool,
}

/// Message record. `key` is provisional at admission and final once the
/// apply layer has assigned the per-thread sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    #[serde(default)]
    pub thread: String,
    pub author: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub created_ts: i64,
    #[serde(default)]
    pub updated_ts: i64,
    /// Opaque caller payload, stored verbatim.
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub reactions: HashMap<String, String>,
}

/// Partial thread update; only the present fields are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadPatch {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

/// Partial message update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// Delete marker carrying the target key and the requesting author.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub key: String,
    #[serde(default)]
    pub author: String,
}

/// Reaction add/remove; the reacting identity comes from [`Extras`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReactionChange {
    pub key: String,
    #[serde(default)]
    pub reaction: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Handler {
    ThreadCreate,
    ThreadUpdate,
    ThreadDelete,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    ReactionAdd,
    ReactionDelete,
}

impl Handler {
    /// Apply ordering within a thread bucket: thread shape first, content
    /// writes second, deletes last.
    pub fn priority(self) -> u8 {
        match self {
            Handler::ThreadCreate | Handler::ThreadUpdate => 1,
            Handler::MessageCreate
            | Handler::MessageUpdate
            | Handler::ReactionAdd
            | Handler::ReactionDelete => 2,
            Handler::ThreadDelete | Handler::MessageDelete => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OpPayload {
    Thread(Thread),
    Message(Message),
    ThreadPatch(ThreadPatch),
    MessagePatch(MessagePatch),
    Tombstone(Tombstone),
    Reaction(ReactionChange),
}

/// Caller identity when it isn't part of the payload. Update and delete
/// access checks trust this, never the payload author.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// One admitted operation: the WAL record and the in-memory queue envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOp {
    /// Monotonic WAL sequence, assigned at append time.
    pub enq_seq: u64,
    pub handler: Handler,
    /// Server-assigned admission time, unix nanoseconds.
    pub ts: i64,
    pub payload: OpPayload,
    #[serde(default)]
    pub extras: Extras,
}

impl QueueOp {
    pub fn new(handler: Handler, ts: i64, payload: OpPayload, extras: Extras) -> Self {
        Self {
            enq_seq: 0,
            handler,
            ts,
            payload,
            extras,
        }
    }

    /// Verified caller identity. Extras wins; only create ops may fall
    /// back to the payload author, because there the author is the
    /// identity being registered. For updates, deletes and reactions the
    /// payload is a client claim and is never trusted.
    pub fn caller(&self) -> Option<&str> {
        if let Some(user) = self.extras.user_id.as_deref() {
            if !user.is_empty() {
                return Some(user);
            }
        }
        let author = match (&self.handler, &self.payload) {
            (Handler::ThreadCreate, OpPayload::Thread(t)) => t.author.as_str(),
            (Handler::MessageCreate, OpPayload::Message(m)) => m.author.as_str(),
            _ => "",
        };
        (!author.is_empty()).then_some(author)
    }

    /// The key carried by the payload, whatever its entity kind.
    pub fn payload_key(&self) -> &str {
        match &self.payload {
            OpPayload::Thread(t) => &t.key,
            OpPayload::Message(m) => &m.key,
            OpPayload::ThreadPatch(p) => &p.key,
            OpPayload::MessagePatch(p) => &p.key,
            OpPayload::Tombstone(t) => &t.key,
            OpPayload::Reaction(r) => &r.key,
        }
    }

    /// Bucket key for batching: the thread this op belongs to. Message keys
    /// embed their thread, so this works for every payload variant; ops
    /// whose key cannot be resolved land in the empty bucket and are
    /// dropped by the batch processor.
    pub fn thread_key(&self) -> String {
        let key = self.payload_key();
        if keys::is_thread_key(key) {
            return key.to_string();
        }
        if let OpPayload::Message(m) = &self.payload {
            if keys::is_thread_key(&m.thread) {
                return m.thread.clone();
            }
        }
        match keys::parse_message_key(key) {
            Ok(parsed) => parsed.thread_key(),
            Err(_) => String::new(),
        }
    }

    /// Admission-time validation: shape of key and payload per handler.
    /// Fails before the op touches the WAL.
    pub fn validate(&self) -> StorageResult<()> {
        match (&self.handler, &self.payload) {
            (Handler::ThreadCreate, OpPayload::Thread(t)) => {
                keys::validate_thread_key(&t.key)?;
                if t.author.is_empty() {
                    return Err(StorageError::Validation("thread author required".into()));
                }
                Ok(())
            }
            (Handler::ThreadUpdate, OpPayload::ThreadPatch(p)) => {
                keys::validate_thread_key(&p.key)?;
                self.require_caller()
            }
            (Handler::ThreadDelete, OpPayload::Tombstone(t)) => {
                keys::validate_thread_key(&t.key)?;
                self.require_caller()
            }
            (Handler::MessageCreate, OpPayload::Message(m)) => {
                if !keys::is_provisional_message_key(&m.key) {
                    return Err(StorageError::InvalidKey(m.key.clone()));
                }
                if m.author.is_empty() {
                    return Err(StorageError::Validation("message author required".into()));
                }
                Ok(())
            }
            (Handler::MessageUpdate, OpPayload::MessagePatch(p)) => {
                keys::parse_message_key(&p.key)?;
                self.require_caller()
            }
            (Handler::MessageDelete, OpPayload::Tombstone(t)) => {
                keys::parse_message_key(&t.key)?;
                self.require_caller()
            }
            (Handler::ReactionAdd, OpPayload::Reaction(r)) => {
                keys::parse_message_key(&r.key)?;
                if r.reaction.is_empty() {
                    return Err(StorageError::Validation("reaction required".into()));
                }
                self.require_caller()
            }
            (Handler::ReactionDelete, OpPayload::Reaction(r)) => {
                keys::parse_message_key(&r.key)?;
                self.require_caller()
            }
            (handler, _) => Err(StorageError::Validation(format!(
                "payload variant does not match handler {handler:?}"
            ))),
        }
    }

    fn require_caller(&self) -> StorageResult<()> {
        self.caller()
            .map(|_| ())
            .ok_or_else(|| StorageError::Validation("caller identity required".into()))
    }
}

/// Initialize a capture-friendly logger once per test binary so the
/// `log::` output of the code under test is visible on failures.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Current wall clock as unix nanoseconds; admission timestamps and
/// provisional keys are minted from this.
pub fn now_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
