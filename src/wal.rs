//! Ingest write-ahead log.
//!
//! Every admitted op is appended (and fsynced) here before it is enqueued
//! for apply; the apply layer truncates a record only after its effects are
//! durable in both stores. Records live in segment files named by their
//! first sequence; each record is framed
//!
//! ```text
//! [len: u32 le][crc32: u32 le][seq: u64 le][payload json]
//! ```
//!
//! with `len` covering seq + payload and the checksum over the same bytes.
//! A torn frame at the tail of the newest segment is expected after a crash
//! and is dropped silently; corruption anywhere else is logged and ends the
//! scan of that segment.
//!
//! `truncate_sequences` drops an arbitrary completed set and advances the
//! head frontier over the contiguous prefix; whole segments below the
//! frontier are deleted. Records completed out of order that were not yet
//! below the frontier reappear on restart and are replayed; the batch
//! appliers are idempotent, so this only costs work, never correctness.

use crate::error::{StorageError, StorageResult};
use crate::QueueOp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const FRAME_HEADER_LEN: usize = 8; // len + crc
const SEQ_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize, Default)]
struct WalMeta {
    head: u64,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct Segment {
    first_seq: u64,
    last_seq: u64,
    records: u64,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
struct RecordLoc {
    segment_first: u64,
    /// Byte offset of the payload (past header and seq).
    offset: u64,
    len: u32,
}

pub struct Wal {
    inner: Mutex<WalInner>,
}

struct WalInner {
    dir: PathBuf,
    capacity: u64,
    segment_records: u64,
    segments: BTreeMap<u64, Segment>,
    active: Option<File>,
    active_offset: u64,
    index: BTreeMap<u64, RecordLoc>,
    /// First live sequence; everything below is gone.
    head: u64,
    next_seq: u64,
}

impl Wal {
    pub fn open(
        dir: impl AsRef<Path>,
        capacity: u64,
        segment_records: u64,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta = read_meta(&dir)?;
        let mut inner = WalInner {
            dir,
            capacity,
            segment_records,
            segments: BTreeMap::new(),
            active: None,
            active_offset: 0,
            index: BTreeMap::new(),
            head: meta.head.max(1),
            next_seq: meta.next_seq.max(1),
        };
        inner.scan_segments()?;
        inner.open_active()?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Assign the next sequence, write and fsync the record, and return the
    /// op stamped with its sequence. Safe under concurrent callers.
    pub fn append(&self, mut op: QueueOp) -> StorageResult<QueueOp> {
        let mut inner = self.inner.lock().unwrap();
        if inner.index.len() as u64 >= inner.capacity {
            return Err(StorageError::WalFull);
        }
        let seq = inner.next_seq;
        op.enq_seq = seq;
        let payload = serde_json::to_vec(&op)?;
        inner.write_record(seq, &payload)?;
        inner.next_seq = seq + 1;
        Ok(op)
    }

    /// Smallest live sequence, or 0 when the log is empty.
    pub fn first_index(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.index.keys().next().copied().unwrap_or(0)
    }

    /// Largest sequence ever assigned, or 0 before the first append.
    pub fn last_index(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the payload at a sequence; truncated sequences are gone.
    pub fn read(&self, seq: u64) -> StorageResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let loc = inner
            .index
            .get(&seq)
            .copied()
            .ok_or(StorageError::WalNotFound(seq))?;
        let segment = inner
            .segments
            .get(&loc.segment_first)
            .ok_or(StorageError::WalNotFound(seq))?;
        let mut file = File::open(&segment.path)?;
        file.seek(SeekFrom::Start(loc.offset))?;
        let mut buf = vec![0u8; loc.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Drop every record with sequence below `seq`.
    pub fn truncate_front(&self, seq: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.head = inner.head.max(seq);
        inner.next_seq = inner.next_seq.max(inner.head);
        let head = inner.head;
        inner.index = inner.index.split_off(&head);
        inner.drop_dead_segments()?;
        inner.persist_meta()
    }

    /// Drop a specific set of just-applied records, then advance the head
    /// frontier over the contiguous completed prefix.
    pub fn truncate_sequences(&self, seqs: &[u64]) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for seq in seqs {
            inner.index.remove(seq);
        }
        while inner.head < inner.next_seq && !inner.index.contains_key(&inner.head) {
            inner.head += 1;
        }
        inner.drop_dead_segments()?;
        inner.persist_meta()
    }
}

impl WalInner {
    fn segment_path(&self, first_seq: u64) -> PathBuf {
        self.dir.join(format!("{first_seq:020}.log"))
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn persist_meta(&self) -> StorageResult<()> {
        let meta = WalMeta {
            head: self.head,
            next_seq: self.next_seq,
        };
        fs::write(self.meta_path(), serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    /// Rebuild the in-memory index from the segment files on disk.
    fn scan_segments(&mut self) -> StorageResult<()> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
            .collect();
        paths.sort();

        let count = paths.len();
        for (i, path) in paths.into_iter().enumerate() {
            let is_last = i + 1 == count;
            let bytes = fs::read(&path)?;
            let mut offset = 0usize;
            let mut segment: Option<Segment> = None;

            loop {
                let remaining = &bytes[offset..];
                if remaining.is_empty() {
                    break;
                }
                if remaining.len() < FRAME_HEADER_LEN {
                    self.handle_tail(&path, offset as u64, is_last, "short header")?;
                    break;
                }
                let len = u32::from_le_bytes(remaining[0..4].try_into().unwrap()) as usize;
                let crc = u32::from_le_bytes(remaining[4..8].try_into().unwrap());
                if len < SEQ_LEN || remaining.len() < FRAME_HEADER_LEN + len {
                    self.handle_tail(&path, offset as u64, is_last, "short frame")?;
                    break;
                }
                let body = &remaining[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
                if crc32fast::hash(body) != crc {
                    self.handle_tail(&path, offset as u64, is_last, "checksum mismatch")?;
                    break;
                }
                let seq = u64::from_le_bytes(body[0..8].try_into().unwrap());
                let payload_len = (len - SEQ_LEN) as u32;
                let payload_offset = offset as u64 + (FRAME_HEADER_LEN + SEQ_LEN) as u64;

                let seg = segment.get_or_insert_with(|| Segment {
                    first_seq: seq,
                    last_seq: seq,
                    records: 0,
                    path: path.clone(),
                });
                seg.last_seq = seq;
                seg.records += 1;

                if seq >= self.head {
                    self.index.insert(
                        seq,
                        RecordLoc {
                            segment_first: seg.first_seq,
                            offset: payload_offset,
                            len: payload_len,
                        },
                    );
                }
                self.next_seq = self.next_seq.max(seq + 1);
                offset += FRAME_HEADER_LEN + len;
            }

            if let Some(seg) = segment {
                if is_last {
                    self.active_offset = offset as u64;
                }
                self.segments.insert(seg.first_seq, seg);
            } else if is_last {
                self.active_offset = 0;
            }
        }
        Ok(())
    }

    fn handle_tail(
        &self,
        path: &Path,
        valid_end: u64,
        is_last: bool,
        what: &str,
    ) -> StorageResult<()> {
        if is_last {
            log::warn!("wal: dropping torn tail ({what}) in {path:?} at byte {valid_end}");
            OpenOptions::new().write(true).open(path)?.set_len(valid_end)?;
        } else {
            log::error!("wal: {what} mid-log in {path:?} at byte {valid_end}; later records in this segment are lost");
        }
        Ok(())
    }

    /// Open (or create) the newest segment for appending.
    fn open_active(&mut self) -> StorageResult<()> {
        if self.segments.is_empty() {
            let first = self.next_seq;
            let path = self.segment_path(first);
            self.segments.insert(
                first,
                Segment {
                    first_seq: first,
                    last_seq: first,
                    records: 0,
                    path: path.clone(),
                },
            );
            self.active = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?,
            );
            self.active_offset = 0;
            self.persist_meta()?;
            return Ok(());
        }
        let path = self
            .segments
            .values()
            .next_back()
            .map(|s| s.path.clone())
            .expect("segments non-empty");
        self.active = Some(OpenOptions::new().create(true).append(true).open(path)?);
        Ok(())
    }

    fn rotate_if_needed(&mut self) -> StorageResult<()> {
        let full = self
            .segments
            .values()
            .next_back()
            .is_some_and(|s| s.records >= self.segment_records);
        if !full {
            return Ok(());
        }
        if let Some(file) = self.active.take() {
            file.sync_all()?;
        }
        let first = self.next_seq;
        let path = self.segment_path(first);
        self.segments.insert(
            first,
            Segment {
                first_seq: first,
                last_seq: first,
                records: 0,
                path: path.clone(),
            },
        );
        self.active = Some(OpenOptions::new().create(true).append(true).open(path)?);
        self.active_offset = 0;
        Ok(())
    }

    fn write_record(&mut self, seq: u64, payload: &[u8]) -> StorageResult<()> {
        self.rotate_if_needed()?;

        let len = SEQ_LEN + payload.len();
        let mut body = Vec::with_capacity(len);
        body.extend_from_slice(&seq.to_le_bytes());
        body.extend_from_slice(payload);
        let crc = crc32fast::hash(&body);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + len);
        frame.extend_from_slice(&(len as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&body);

        let file = self
            .active
            .as_mut()
            .ok_or_else(|| StorageError::BadStateError("wal has no active segment".into()))?;
        file.write_all(&frame)?;
        file.sync_all()?;

        let payload_offset = self.active_offset + (FRAME_HEADER_LEN + SEQ_LEN) as u64;
        self.active_offset += frame.len() as u64;

        let seg = self
            .segments
            .values_mut()
            .next_back()
            .ok_or_else(|| StorageError::BadStateError("wal has no active segment".into()))?;
        seg.last_seq = seq;
        seg.records += 1;
        self.index.insert(
            seq,
            RecordLoc {
                segment_first: seg.first_seq,
                offset: payload_offset,
                len: payload.len() as u32,
            },
        );
        Ok(())
    }

    /// Delete whole segment files that hold nothing at or above the head.
    fn drop_dead_segments(&mut self) -> StorageResult<()> {
        let active_first = self.segments.keys().next_back().copied();
        let dead: Vec<u64> = self
            .segments
            .values()
            .filter(|s| Some(s.first_seq) != active_first && s.last_seq < self.head)
            .map(|s| s.first_seq)
            .collect();
        for first in dead {
            if let Some(seg) = self.segments.remove(&first) {
                log::trace!("wal: removing dead segment {:?}", seg.path);
                fs::remove_file(&seg.path)?;
            }
        }
        Ok(())
    }
}

fn read_meta(dir: &Path) -> StorageResult<WalMeta> {
    let path = dir.join("meta.json");
    if !path.exists() {
        return Ok(WalMeta::default());
    }
    let bytes = fs::read(&path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::InitError(format!("unreadable wal meta: {e}")))
}
