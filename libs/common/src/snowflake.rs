//! Time-ordered 64-bit ids for persisted messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 2026-01-01T00:00:00Z in milliseconds since the Unix epoch.
pub const BEACON_EPOCH_MS: u64 = 1_767_225_600_000;

const SEQUENCE_BITS: u32 = 12;
const WORKER_BITS: u32 = 10;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_MASK: u16 = (1 << WORKER_BITS) - 1;

/// Lock-free id generator.
///
/// An id is `[42 bits: ms since BEACON_EPOCH_MS][10 bits: worker][12 bits: sequence]`.
/// The last issued millisecond and sequence share one atomic word, so ids
/// from one generator strictly increase even if the wall clock steps back or
/// more than 4096 ids are requested within a millisecond (the sequence then
/// carries into the next millisecond).
pub struct SnowflakeGenerator {
    worker: u64,
    /// `ms << SEQUENCE_BITS | sequence` of the last id handed out.
    last: AtomicU64,
}

impl SnowflakeGenerator {
    /// Only the low 10 bits of `worker_id` are used.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker: u64::from(worker_id & WORKER_MASK),
            last: AtomicU64::new(0),
        }
    }

    pub fn generate(&self) -> i64 {
        let now = elapsed_ms() << SEQUENCE_BITS;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return self.compose(next),
                Err(current) => last = current,
            }
        }
    }

    fn compose(&self, stamp: u64) -> i64 {
        let ms = stamp >> SEQUENCE_BITS;
        let sequence = stamp & SEQUENCE_MASK;
        ((ms << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker << SEQUENCE_BITS) | sequence) as i64
    }
}

fn elapsed_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        .saturating_sub(BEACON_EPOCH_MS)
}

/// Creation time of `id` in milliseconds since the Unix epoch.
pub fn snowflake_timestamp_ms(id: i64) -> u64 {
    ((id as u64) >> (WORKER_BITS + SEQUENCE_BITS)) + BEACON_EPOCH_MS
}
