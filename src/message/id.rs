use std::sync::atomic::{AtomicU64, Ordering};

use super::UnixMillis;

/// Millisecond timestamps are taken relative to this epoch (2024-01-01 UTC)
/// so 41 bits of timestamp leave room for worker and sequence bits.
const ID_EPOCH_MILLIS: i64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake-style generator for globally unique numeric message ids.
///
/// An id packs `timestamp | worker | sequence`, which keeps ids unique
/// across processes (distinct worker ids), roughly time-ordered, and
/// representable as the `INTEGER` primary key of the outbox table.
///
/// ## Example
///
/// ```
/// use surebus::IdGenerator;
///
/// let ids = IdGenerator::new(1);
/// let a = ids.next_id();
/// let b = ids.next_id();
/// assert!(b > a);
/// ```
pub struct IdGenerator {
    worker_id: u64,
    /// Packed `millis << SEQUENCE_BITS | sequence` of the last issued id.
    state: AtomicU64,
}

impl IdGenerator {
    /// Create a generator for the given worker. Only the low 10 bits of
    /// `worker_id` participate in the id.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id) & ((1 << WORKER_BITS) - 1),
            state: AtomicU64::new(0),
        }
    }

    /// Mint the next id. Never blocks; if the per-millisecond sequence is
    /// exhausted the id borrows from the next millisecond.
    pub fn next_id(&self) -> i64 {
        loop {
            let now = Self::millis_since_epoch();
            let prev = self.state.load(Ordering::Acquire);
            let (prev_millis, prev_seq) = (prev >> SEQUENCE_BITS, prev & MAX_SEQUENCE);

            let (millis, seq) = if now > prev_millis {
                (now, 0)
            } else if prev_seq < MAX_SEQUENCE {
                (prev_millis, prev_seq + 1)
            } else {
                (prev_millis + 1, 0)
            };

            let next = (millis << SEQUENCE_BITS) | seq;
            if self
                .state
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let id = (millis << (WORKER_BITS + SEQUENCE_BITS))
                    | (self.worker_id << SEQUENCE_BITS)
                    | seq;
                return id as i64;
            }
        }
    }

    fn millis_since_epoch() -> u64 {
        let now = UnixMillis::now().as_i64();
        u64::try_from(now.saturating_sub(ID_EPOCH_MILLIS)).unwrap_or(0)
    }
}

impl Default for IdGenerator {
    /// Worker id derived from the process id; good enough for single-host
    /// deployments, production setups should assign worker ids explicitly.
    fn default() -> Self {
        Self::new(std::process::id() as u16)
    }
}
