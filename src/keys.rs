//! Key building and parsing for both stores.
//!
//! All keys are padded ASCII strings chosen to sort lexicographically in the
//! intended read order:
//!
//! - thread metadata:   `t:<PAD20(createdTS)>`
//! - provisional msg:   `t:<threadID>:m:<PAD20(msgTS)>`
//! - final msg:         `t:<threadID>:m:<PAD20(msgTS)>:<PAD9(seq)>`
//! - message version:   `v:<msgID>:<PAD20(ts)>:<PAD9(seq)>`
//! - thread-msg index:  `idx:t:<threadID>:ms:<field>`
//! - ownership:         `rel:u:<userID>:t:<threadID>`
//! - participation:     `rel:t:<threadID>:u:<userID>`
//! - soft-delete:       `del:<key>`
//! - temp index:        `temp_idx:<kind>:<targetKey>`
//!
//! A message key is provisional iff the `m:` segment has no sequence suffix.

use crate::error::{StorageError, StorageResult};

pub const THREAD_PREFIX: &str = "t:";
pub const VERSION_PREFIX: &str = "v:";
pub const DEL_PREFIX: &str = "del:";
pub const TEMP_INDEX_PREFIX: &str = "temp_idx:";

const TS_WIDTH: usize = 20;
const SEQ_WIDTH: usize = 9;

pub fn pad20(n: i64) -> String {
    format!("{n:020}")
}

pub fn pad9(n: u64) -> String {
    format!("{n:09}")
}

pub fn gen_thread_key(created_ts: i64) -> String {
    format!("t:{}", pad20(created_ts))
}

pub fn gen_message_provisional_key(thread_key: &str, msg_ts: i64) -> String {
    format!("{thread_key}:m:{}", pad20(msg_ts))
}

pub fn gen_message_key(thread_key: &str, msg_ts: i64, seq: u64) -> String {
    format!("{thread_key}:m:{}:{}", pad20(msg_ts), pad9(seq))
}

pub fn gen_version_key(msg_id: &str, ts: i64, seq: u64) -> String {
    format!("{VERSION_PREFIX}{msg_id}:{}:{}", pad20(ts), pad9(seq))
}

pub fn thread_index_field_key(thread_key: &str, field: &str) -> String {
    format!("idx:{thread_key}:ms:{field}")
}

pub fn rel_user_thread_key(user_id: &str, thread_key: &str) -> String {
    format!("rel:u:{user_id}:{thread_key}")
}

pub fn rel_thread_user_key(thread_key: &str, user_id: &str) -> String {
    format!("rel:{thread_key}:u:{user_id}")
}

pub fn del_marker_key(key: &str) -> String {
    format!("{DEL_PREFIX}{key}")
}

pub fn temp_index_key(kind: &str, target: &str) -> String {
    format!("temp_idx:{kind}:{target}")
}

/// Split `temp_idx:<kind>:<target>` back into its parts.
pub fn parse_temp_index_key(key: &str) -> StorageResult<(&str, &str)> {
    let rest = key
        .strip_prefix(TEMP_INDEX_PREFIX)
        .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
    let (kind, target) = rest
        .split_once(':')
        .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
    if kind.is_empty() || target.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok((kind, target))
}

/// Prefix under which all of a thread's message keys sort.
pub fn thread_messages_prefix(thread_key: &str) -> String {
    format!("{thread_key}:m:")
}

/// Prefix under which all of a message's version rows sort.
pub fn message_versions_prefix(msg_id: &str) -> String {
    format!("{VERSION_PREFIX}{msg_id}:")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessageKey {
    /// The padded thread id digits (without the `t:` prefix).
    pub thread_id: String,
    pub msg_ts: i64,
    /// `None` for provisional keys.
    pub seq: Option<u64>,
}

impl ParsedMessageKey {
    pub fn thread_key(&self) -> String {
        format!("t:{}", self.thread_id)
    }

    pub fn is_provisional(&self) -> bool {
        self.seq.is_none()
    }
}

fn parse_padded(s: &str, width: usize) -> Option<u64> {
    if s.len() != width || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parse `t:<id>:m:<ts>` or `t:<id>:m:<ts>:<seq>`.
pub fn parse_message_key(key: &str) -> StorageResult<ParsedMessageKey> {
    let err = || StorageError::InvalidKey(key.to_string());
    let rest = key.strip_prefix(THREAD_PREFIX).ok_or_else(err)?;
    let (thread_id, rest) = rest.split_once(":m:").ok_or_else(err)?;
    parse_padded(thread_id, TS_WIDTH).ok_or_else(err)?;
    let (ts_part, seq_part) = match rest.split_once(':') {
        Some((ts, seq)) => (ts, Some(seq)),
        None => (rest, None),
    };
    let msg_ts = parse_padded(ts_part, TS_WIDTH).ok_or_else(err)? as i64;
    let seq = match seq_part {
        Some(s) => Some(parse_padded(s, SEQ_WIDTH).ok_or_else(err)?),
        None => None,
    };
    Ok(ParsedMessageKey {
        thread_id: thread_id.to_string(),
        msg_ts,
        seq,
    })
}

pub fn is_provisional_message_key(key: &str) -> bool {
    parse_message_key(key).map(|p| p.is_provisional()).unwrap_or(false)
}

pub fn is_final_message_key(key: &str) -> bool {
    parse_message_key(key).map(|p| !p.is_provisional()).unwrap_or(false)
}

/// A thread key is exactly `t:` followed by 20 digits.
pub fn validate_thread_key(key: &str) -> StorageResult<()> {
    parse_thread_key(key).map(|_| ())
}

/// Extract the creation timestamp a thread key was minted from.
pub fn parse_thread_key(key: &str) -> StorageResult<i64> {
    let rest = key
        .strip_prefix(THREAD_PREFIX)
        .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
    parse_padded(rest, TS_WIDTH)
        .map(|n| n as i64)
        .ok_or_else(|| StorageError::InvalidKey(key.to_string()))
}

pub fn is_thread_key(key: &str) -> bool {
    validate_thread_key(key).is_ok()
}

/// Lexicographic successor of a prefix, usable as an exclusive upper bound
/// for range scans over keys starting with `prefix`.
pub fn next_prefix(prefix: &str) -> Vec<u8> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.last_mut() {
        if *last < 0xff {
            *last += 1;
            return bytes;
        }
        bytes.pop();
    }
    // every byte was 0xff; no finite upper bound exists, so saturate
    vec![0xff; prefix.len() + 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_key_round_trip() {
        let key = gen_thread_key(1234);
        assert_eq!(key, "t:00000000000000001234");
        assert!(validate_thread_key(&key).is_ok());
        assert!(is_thread_key(&key));
        assert!(!is_thread_key("t:123"));
        assert!(!is_thread_key("x:00000000000000001234"));
        assert!(!is_thread_key("t:0000000000000000123x"));
    }

    #[test]
    fn message_key_round_trip() {
        let tk = gen_thread_key(1);
        let prov = gen_message_provisional_key(&tk, 10);
        assert_eq!(prov, "t:00000000000000000001:m:00000000000000000010");
        assert!(is_provisional_message_key(&prov));
        assert!(!is_final_message_key(&prov));

        let fin = gen_message_key(&tk, 10, 2);
        assert_eq!(
            fin,
            "t:00000000000000000001:m:00000000000000000010:000000002"
        );
        assert!(is_final_message_key(&fin));
        assert!(!is_provisional_message_key(&fin));

        let parsed = parse_message_key(&fin).unwrap();
        assert_eq!(parsed.thread_key(), tk);
        assert_eq!(parsed.msg_ts, 10);
        assert_eq!(parsed.seq, Some(2));

        let parsed = parse_message_key(&prov).unwrap();
        assert!(parsed.is_provisional());
        assert_eq!(parsed.msg_ts, 10);
    }

    #[test]
    fn message_key_rejects_malformed() {
        assert!(parse_message_key("t:123:m:456").is_err());
        assert!(parse_message_key("t:00000000000000000001").is_err());
        assert!(parse_message_key("t:00000000000000000001:m:").is_err());
        assert!(parse_message_key(
            "t:00000000000000000001:m:00000000000000000010:12"
        )
        .is_err());
        assert!(parse_message_key(
            "t:00000000000000000001:m:00000000000000000010:000000001:junk"
        )
        .is_err());
    }

    #[test]
    fn message_keys_sort_by_ts_then_seq() {
        let tk = gen_thread_key(7);
        let mut ks = vec![
            gen_message_key(&tk, 20, 0),
            gen_message_key(&tk, 10, 1),
            gen_message_key(&tk, 10, 0),
            gen_message_key(&tk, 30, 2),
        ];
        ks.sort();
        assert_eq!(
            ks,
            vec![
                gen_message_key(&tk, 10, 0),
                gen_message_key(&tk, 10, 1),
                gen_message_key(&tk, 20, 0),
                gen_message_key(&tk, 30, 2),
            ]
        );
    }

    #[test]
    fn version_keys_sort_under_message_prefix() {
        let tk = gen_thread_key(7);
        let fin = gen_message_key(&tk, 10, 0);
        let v1 = gen_version_key(&fin, 10, 0);
        let v2 = gen_version_key(&fin, 15, 0);
        assert!(v1.starts_with(&message_versions_prefix(&fin)));
        assert!(v1 < v2);
    }

    #[test]
    fn temp_index_key_round_trip() {
        let target = rel_user_thread_key("u1", &gen_thread_key(1));
        let staged = temp_index_key("set", &target);
        let (kind, parsed) = parse_temp_index_key(&staged).unwrap();
        assert_eq!(kind, "set");
        assert_eq!(parsed, target);
        assert!(parse_temp_index_key("idx:whatever").is_err());
    }

    #[test]
    fn next_prefix_bounds_a_scan() {
        let p = thread_messages_prefix(&gen_thread_key(1));
        let upper = next_prefix(&p);
        assert!(p.as_bytes() < upper.as_slice());
        let key = gen_message_key(&gen_thread_key(1), 10, 0);
        assert!(key.as_bytes() < upper.as_slice());
        let other_thread = gen_message_key(&gen_thread_key(2), 0, 0);
        assert!(other_thread.as_bytes() > upper.as_slice());

        assert_eq!(next_prefix("a\u{7f}"), vec![0x61, 0x80]);
    }
}
