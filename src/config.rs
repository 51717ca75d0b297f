use std::time::Duration;

/// Tuning knobs for the ingest pipeline.
///
/// The defaults favor small deployments; collaborators embedding the crate
/// override what they measure. `workers > 1` enables sharded apply: each
/// thread is routed to exactly one worker by key hash, which is what keeps
/// per-thread ordering without a global lock.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Apply worker count (and queue shard count).
    pub workers: usize,
    /// Bounded depth of each shard's channel.
    pub queue_capacity: usize,
    /// How long an enqueue may wait for space before `queue_full`.
    pub enqueue_timeout: Duration,
    /// Flush a worker's buffer as soon as it holds this many ops.
    pub max_batch: usize,
    /// Flush a non-empty buffer at least this often.
    pub flush_interval: Duration,
    /// Live (unapplied) WAL records allowed before `wal_full`.
    pub wal_capacity: u64,
    /// Records per WAL segment file before rotating.
    pub wal_segment_records: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 4_096,
            enqueue_timeout: Duration::from_secs(2),
            max_batch: 256,
            flush_interval: Duration::from_millis(50),
            wal_capacity: 262_144,
            wal_segment_records: 4_096,
        }
    }
}

impl PipelineConfig {
    /// Small-everything config for tests: single worker, tiny batches,
    /// aggressive flushing.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            workers: 1,
            queue_capacity: 64,
            enqueue_timeout: Duration::from_millis(250),
            max_batch: 8,
            flush_interval: Duration::from_millis(10),
            wal_capacity: 4_096,
            wal_segment_records: 32,
        }
    }
}
