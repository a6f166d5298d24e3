//! Relational ledger providers.
//!
//! A provider executes every outbox and inbox operation as a single
//! parameterized statement whose affected-row count is the sole success
//! signal. There is never a separate existence check followed by an
//! update; that split would race against concurrent dispatchers. All
//! cross-process coordination rides on `status` + `lock_id` + `lock_time`
//! conditions evaluated inside the statement itself.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::inbox::{BarrierEnterResult, InboxEntry};
use crate::message::{CodecError, UnixMillis};
use crate::outbox::OutboxEntry;

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;

/// Lifecycle status of a ledger row.
///
/// Pending → Processing → {Succeeded | Failed}; Failed loops back to
/// Processing on retry, Succeeded is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    #[default]
    Pending,
    Processing,
    Failed,
    Succeeded,
}

impl MessageStatus {
    /// Integer form stored in the ledger's `status` column.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Failed => 2,
            Self::Succeeded => 3,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self, LedgerError> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Processing),
            2 => Ok(Self::Failed),
            3 => Ok(Self::Succeeded),
            other => Err(LedgerError::InvalidStatus(other)),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Succeeded
    }
}

/// Error type for ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown status value {0} in ledger row")]
    InvalidStatus(i64),

    /// The broker accepted a publish but the ledger refused the matching
    /// success mark: the message has left the local system while the
    /// ledger disagrees. Needs operator visibility, not a silent retry.
    #[error("ledger inconsistency for message {message_id}: {detail}")]
    Inconsistency { message_id: i64, detail: String },

    #[error("ledger task failed: {0}")]
    Task(String),
}

/// Ledger operations backing the outbox and inbox subsystems.
///
/// One implementation exists per relational engine. Every mutation is a
/// single atomic statement; the boolean results report whether the
/// statement affected a row, which is how callers learn they still own
/// (or have lost) a lock.
#[async_trait]
pub trait LedgerProvider: Send + Sync {
    /// Create tables and indexes if missing. Idempotent.
    async fn ensure_schema(&self) -> Result<(), LedgerError>;

    /// Insert a new Pending outbox row in a provider-owned transaction.
    ///
    /// Callers that need the row atomic with their own business writes
    /// use the engine-specific transactional form instead (see
    /// `SqliteLedger::register_in_tx`).
    async fn insert_outbox(&self, entry: &OutboxEntry) -> Result<(), LedgerError>;

    /// Read one outbox row back.
    async fn fetch_outbox(&self, message_id: i64) -> Result<Option<OutboxEntry>, LedgerError>;

    /// Atomically claim one outbox row for dispatch: set Processing and
    /// `lock_id` only if the row is Pending or Failed and no live lock is
    /// held (a lock older than `lock_timeout` counts as dead). Returns
    /// whether the claim won.
    async fn try_lock_outbox(
        &self,
        message_id: i64,
        lock_id: &str,
        now: UnixMillis,
        lock_timeout: Duration,
    ) -> Result<bool, LedgerError>;

    /// Atomically claim up to `limit` dispatch-eligible rows: Pending,
    /// Failed and due for retry, or Processing with an expired lock
    /// (previous owner presumed crashed). Returns the claimed rows.
    async fn lock_outbox_batch(
        &self,
        limit: usize,
        lock_id: &str,
        now: UnixMillis,
        lock_timeout: Duration,
    ) -> Result<Vec<OutboxEntry>, LedgerError>;

    /// Mark a claimed row Succeeded, conditioned on `lock_id`. Returns
    /// false when the lock was lost (zero rows affected).
    async fn mark_outbox_succeeded(
        &self,
        message_id: i64,
        lock_id: &str,
        now: UnixMillis,
    ) -> Result<bool, LedgerError>;

    /// Mark a claimed row Failed, increment `retry_count`, store the
    /// (pre-truncated) error and the next retry time. Conditioned on
    /// `lock_id`; returns false when the lock was lost.
    async fn mark_outbox_failed(
        &self,
        message_id: i64,
        lock_id: &str,
        error: &str,
        next_retry_time: UnixMillis,
        now: UnixMillis,
    ) -> Result<bool, LedgerError>;

    /// Delete up to `limit` Succeeded outbox rows last updated before
    /// `cutoff`. Returns the number deleted.
    async fn purge_outbox(&self, cutoff: UnixMillis, limit: usize) -> Result<usize, LedgerError>;

    /// Enter the inbox barrier for (consumer, message): insert a fresh
    /// Processing row, or (on the unique-key collision) conditionally
    /// take over an entry that is not Succeeded and whose lock is not
    /// live. Duplicate-key races are outcomes here, never errors.
    async fn try_enter_inbox(
        &self,
        entry: &InboxEntry,
        lock_id: &str,
        now: UnixMillis,
        lock_timeout: Duration,
    ) -> Result<BarrierEnterResult, LedgerError>;

    /// Mark an entered barrier Succeeded, conditioned on `lock_id` so a
    /// preempted owner cannot overwrite a newer owner's result.
    async fn mark_inbox_succeeded(
        &self,
        consumer_name: &str,
        message_id: i64,
        lock_id: &str,
        now: UnixMillis,
    ) -> Result<bool, LedgerError>;

    /// Mark an entered barrier Failed with a (pre-truncated) error,
    /// conditioned on `lock_id`.
    async fn mark_inbox_failed(
        &self,
        consumer_name: &str,
        message_id: i64,
        lock_id: &str,
        error: &str,
        now: UnixMillis,
    ) -> Result<bool, LedgerError>;

    /// Read one inbox row back.
    async fn fetch_inbox(
        &self,
        consumer_name: &str,
        message_id: i64,
    ) -> Result<Option<InboxEntry>, LedgerError>;

    /// Delete up to `limit` Succeeded inbox rows last updated before
    /// `cutoff`. Returns the number deleted.
    async fn purge_inbox(&self, cutoff: UnixMillis, limit: usize) -> Result<usize, LedgerError>;
}

/// Truncate externally sourced error text to `max_bytes` before it is
/// stored in a `last_error` column, never splitting a UTF-8 code point.
pub(crate) fn truncate_error(error: &str, max_bytes: usize) -> &str {
    if error.len() <= max_bytes {
        return error;
    }
    let mut end = max_bytes;
    while end > 0 && !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}
