//! SQLite ledger provider.
//!
//! Each logical operation opens its own connection, runs one statement,
//! and disposes the connection; nothing is shared across concurrent
//! tasks, and no database lock is ever held across broker I/O. The
//! blocking rusqlite calls run on the tokio blocking pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::debug;

use super::{LedgerError, LedgerProvider, MessageStatus};
use crate::inbox::{BarrierEnterResult, InboxEntry};
use crate::message::{MessageHeader, UnixMillis};
use crate::outbox::OutboxEntry;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outbox_messages (
    message_id      INTEGER PRIMARY KEY,
    exchange        TEXT NOT NULL,
    routing_key     TEXT NOT NULL,
    message_header  TEXT NOT NULL,
    message_body    BLOB NOT NULL,
    message_text    TEXT,
    status          INTEGER NOT NULL DEFAULT 0,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    next_retry_time INTEGER,
    lock_id         TEXT,
    lock_time       INTEGER,
    last_error      TEXT,
    create_time     INTEGER NOT NULL,
    update_time     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbox_eligible
    ON outbox_messages (status, next_retry_time, lock_time);
CREATE INDEX IF NOT EXISTS idx_outbox_purge
    ON outbox_messages (status, update_time);

CREATE TABLE IF NOT EXISTS inbox_messages (
    consumer_name   TEXT NOT NULL,
    message_id      INTEGER NOT NULL,
    message_header  TEXT NOT NULL,
    exchange        TEXT NOT NULL,
    routing_key     TEXT NOT NULL,
    status          INTEGER NOT NULL DEFAULT 1,
    lock_id         TEXT,
    lock_time       INTEGER,
    last_error      TEXT,
    create_time     INTEGER NOT NULL,
    update_time     INTEGER NOT NULL,
    PRIMARY KEY (consumer_name, message_id)
);
CREATE INDEX IF NOT EXISTS idx_inbox_purge
    ON inbox_messages (status, update_time);
";

const OUTBOX_COLUMNS: &str = "message_id, exchange, routing_key, message_header, message_body, \
     message_text, status, retry_count, next_retry_time, lock_id, lock_time, last_error, \
     create_time, update_time";

/// SQLite implementation of [`LedgerProvider`].
///
/// Stores the path only; every call opens a fresh connection with WAL
/// journaling and a busy timeout, so concurrent dispatchers contend via
/// SQLite's own locking rather than a shared in-process handle.
#[derive(Clone, Debug)]
pub struct SqliteLedger {
    path: PathBuf,
}

impl SqliteLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open a connection configured the way the provider opens its own.
    ///
    /// Use this when the outbox row must be atomic with business writes:
    /// begin a transaction on this connection, do the business writes,
    /// call [`Self::register_in_tx`], and commit.
    pub fn open_connection(&self) -> Result<Connection, LedgerError> {
        Self::open(&self.path)
    }

    /// Insert a Pending outbox row through the caller's own transaction.
    ///
    /// This is what makes "business write" and "intent to publish" one
    /// atomic unit: the row commits or rolls back with everything else
    /// in `tx`. No broker communication happens here.
    pub fn register_in_tx(
        tx: &rusqlite::Transaction<'_>,
        entry: &OutboxEntry,
    ) -> Result<(), LedgerError> {
        insert_outbox_row(tx, entry)
    }

    fn open(path: &Path) -> Result<Connection, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::Task(format!("create ledger directory: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }

    /// Run `f` with a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LedgerError::Task(e.to_string()))?
    }
}

fn insert_outbox_row(conn: &Connection, entry: &OutboxEntry) -> Result<(), LedgerError> {
    let header_json = entry.header.to_json()?;
    let text = entry.text.clone().unwrap_or_else(|| entry.display_text());
    conn.execute(
        "INSERT INTO outbox_messages (message_id, exchange, routing_key, message_header, \
         message_body, message_text, status, retry_count, next_retry_time, lock_id, lock_time, \
         last_error, create_time, update_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL, NULL, ?9, ?10)",
        params![
            entry.message_id,
            entry.exchange,
            entry.routing_key,
            header_json,
            entry.body,
            text,
            entry.status.as_i64(),
            entry.retry_count,
            entry.create_time.as_i64(),
            entry.update_time.as_i64(),
        ],
    )?;
    Ok(())
}

/// Column values of one outbox row before header/status decoding.
struct RawOutboxRow {
    message_id: i64,
    exchange: String,
    routing_key: String,
    header_json: String,
    body: Vec<u8>,
    text: Option<String>,
    status: i64,
    retry_count: u32,
    next_retry_time: Option<i64>,
    lock_id: Option<String>,
    lock_time: Option<i64>,
    last_error: Option<String>,
    create_time: i64,
    update_time: i64,
}

fn raw_outbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOutboxRow> {
    Ok(RawOutboxRow {
        message_id: row.get(0)?,
        exchange: row.get(1)?,
        routing_key: row.get(2)?,
        header_json: row.get(3)?,
        body: row.get(4)?,
        text: row.get(5)?,
        status: row.get(6)?,
        retry_count: row.get(7)?,
        next_retry_time: row.get(8)?,
        lock_id: row.get(9)?,
        lock_time: row.get(10)?,
        last_error: row.get(11)?,
        create_time: row.get(12)?,
        update_time: row.get(13)?,
    })
}

impl TryFrom<RawOutboxRow> for OutboxEntry {
    type Error = LedgerError;

    fn try_from(raw: RawOutboxRow) -> Result<Self, LedgerError> {
        Ok(Self {
            message_id: raw.message_id,
            exchange: raw.exchange,
            routing_key: raw.routing_key,
            header: MessageHeader::from_json(&raw.header_json)?,
            body: raw.body,
            text: raw.text,
            status: MessageStatus::from_i64(raw.status)?,
            retry_count: raw.retry_count,
            next_retry_time: raw.next_retry_time.map(UnixMillis),
            lock_id: raw.lock_id,
            lock_time: raw.lock_time.map(UnixMillis),
            last_error: raw.last_error,
            create_time: UnixMillis(raw.create_time),
            update_time: UnixMillis(raw.update_time),
        })
    }
}

#[async_trait]
impl LedgerProvider for SqliteLedger {
    async fn ensure_schema(&self) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    async fn insert_outbox(&self, entry: &OutboxEntry) -> Result<(), LedgerError> {
        let entry = entry.clone();
        self.with_conn(move |conn| insert_outbox_row(conn, &entry)).await
    }

    async fn fetch_outbox(&self, message_id: i64) -> Result<Option<OutboxEntry>, LedgerError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE message_id = ?1"
            ))?;
            match stmt.query_row(params![message_id], raw_outbox_row) {
                Ok(raw) => Ok(Some(OutboxEntry::try_from(raw)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn try_lock_outbox(
        &self,
        message_id: i64,
        lock_id: &str,
        now: UnixMillis,
        lock_timeout: Duration,
    ) -> Result<bool, LedgerError> {
        let lock_id = lock_id.to_string();
        let stale_before = now.saturating_sub(lock_timeout);
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "UPDATE outbox_messages \
                 SET status = 1, lock_id = ?2, lock_time = ?3, update_time = ?3 \
                 WHERE message_id = ?1 \
                   AND status IN (0, 2) \
                   AND (lock_id IS NULL OR lock_time IS NULL OR lock_time <= ?4)",
                params![message_id, lock_id, now.as_i64(), stale_before.as_i64()],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn lock_outbox_batch(
        &self,
        limit: usize,
        lock_id: &str,
        now: UnixMillis,
        lock_timeout: Duration,
    ) -> Result<Vec<OutboxEntry>, LedgerError> {
        let lock_id = lock_id.to_string();
        let stale_before = now.saturating_sub(lock_timeout);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            // One atomic claim over every eligible row: Pending, Failed and
            // due, or Processing whose lock expired (owner presumed crashed).
            let claimed = conn.execute(
                "UPDATE outbox_messages \
                 SET status = 1, lock_id = ?1, lock_time = ?2, update_time = ?2 \
                 WHERE message_id IN ( \
                     SELECT message_id FROM outbox_messages \
                     WHERE status = 0 \
                        OR (status = 2 AND (next_retry_time IS NULL OR next_retry_time <= ?2)) \
                        OR (status = 1 AND (lock_time IS NULL OR lock_time <= ?3)) \
                     ORDER BY create_time \
                     LIMIT ?4)",
                params![lock_id, now.as_i64(), stale_before.as_i64(), limit],
            )?;
            if claimed == 0 {
                return Ok(Vec::new());
            }
            debug!(claimed, "claimed outbox batch");

            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox_messages \
                 WHERE lock_id = ?1 AND status = 1 ORDER BY create_time"
            ))?;
            let rows = stmt.query_map(params![lock_id], raw_outbox_row)?;
            let mut entries = Vec::new();
            for raw in rows {
                entries.push(OutboxEntry::try_from(raw?)?);
            }
            Ok(entries)
        })
        .await
    }

    async fn mark_outbox_succeeded(
        &self,
        message_id: i64,
        lock_id: &str,
        now: UnixMillis,
    ) -> Result<bool, LedgerError> {
        let lock_id = lock_id.to_string();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "UPDATE outbox_messages \
                 SET status = 3, lock_id = NULL, lock_time = NULL, last_error = NULL, \
                     update_time = ?3 \
                 WHERE message_id = ?1 AND lock_id = ?2",
                params![message_id, lock_id, now.as_i64()],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn mark_outbox_failed(
        &self,
        message_id: i64,
        lock_id: &str,
        error: &str,
        next_retry_time: UnixMillis,
        now: UnixMillis,
    ) -> Result<bool, LedgerError> {
        let lock_id = lock_id.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "UPDATE outbox_messages \
                 SET status = 2, retry_count = retry_count + 1, next_retry_time = ?3, \
                     last_error = ?4, lock_id = NULL, lock_time = NULL, update_time = ?5 \
                 WHERE message_id = ?1 AND lock_id = ?2",
                params![
                    message_id,
                    lock_id,
                    next_retry_time.as_i64(),
                    error,
                    now.as_i64()
                ],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn purge_outbox(&self, cutoff: UnixMillis, limit: usize) -> Result<usize, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM outbox_messages \
                 WHERE message_id IN ( \
                     SELECT message_id FROM outbox_messages \
                     WHERE status = 3 AND update_time < ?1 \
                     LIMIT ?2)",
                params![cutoff.as_i64(), limit],
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn try_enter_inbox(
        &self,
        entry: &InboxEntry,
        lock_id: &str,
        now: UnixMillis,
        lock_timeout: Duration,
    ) -> Result<BarrierEnterResult, LedgerError> {
        let entry = entry.clone();
        let lock_id = lock_id.to_string();
        let stale_before = now.saturating_sub(lock_timeout);
        self.with_conn(move |conn| {
            let header_json = entry.header.to_json()?;
            let inserted = conn.execute(
                "INSERT INTO inbox_messages (consumer_name, message_id, message_header, \
                 exchange, routing_key, status, lock_id, lock_time, last_error, create_time, \
                 update_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, NULL, ?7, ?7)",
                params![
                    entry.consumer_name,
                    entry.message_id,
                    header_json,
                    entry.exchange,
                    entry.routing_key,
                    lock_id,
                    now.as_i64(),
                ],
            );
            match inserted {
                Ok(_) => return Ok(BarrierEnterResult::Entered),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation => {}
                Err(e) => return Err(e.into()),
            }

            // The key exists. Take it over only if it has not succeeded and
            // no live lock is held.
            let taken = conn.execute(
                "UPDATE inbox_messages \
                 SET status = 1, lock_id = ?3, lock_time = ?4, update_time = ?4 \
                 WHERE consumer_name = ?1 AND message_id = ?2 \
                   AND status != 3 \
                   AND (status != 1 OR lock_time IS NULL OR lock_time <= ?5)",
                params![
                    entry.consumer_name,
                    entry.message_id,
                    lock_id,
                    now.as_i64(),
                    stale_before.as_i64(),
                ],
            )?;
            if taken == 1 {
                return Ok(BarrierEnterResult::Entered);
            }

            let status: i64 = conn.query_row(
                "SELECT status FROM inbox_messages \
                 WHERE consumer_name = ?1 AND message_id = ?2",
                params![entry.consumer_name, entry.message_id],
                |row| row.get(0),
            )?;
            if MessageStatus::from_i64(status)? == MessageStatus::Succeeded {
                Ok(BarrierEnterResult::AlreadyCompleted)
            } else {
                Ok(BarrierEnterResult::Busy)
            }
        })
        .await
    }

    async fn mark_inbox_succeeded(
        &self,
        consumer_name: &str,
        message_id: i64,
        lock_id: &str,
        now: UnixMillis,
    ) -> Result<bool, LedgerError> {
        let consumer_name = consumer_name.to_string();
        let lock_id = lock_id.to_string();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "UPDATE inbox_messages \
                 SET status = 3, lock_id = NULL, lock_time = NULL, last_error = NULL, \
                     update_time = ?4 \
                 WHERE consumer_name = ?1 AND message_id = ?2 AND lock_id = ?3",
                params![consumer_name, message_id, lock_id, now.as_i64()],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn mark_inbox_failed(
        &self,
        consumer_name: &str,
        message_id: i64,
        lock_id: &str,
        error: &str,
        now: UnixMillis,
    ) -> Result<bool, LedgerError> {
        let consumer_name = consumer_name.to_string();
        let lock_id = lock_id.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "UPDATE inbox_messages \
                 SET status = 2, last_error = ?4, lock_id = NULL, lock_time = NULL, \
                     update_time = ?5 \
                 WHERE consumer_name = ?1 AND message_id = ?2 AND lock_id = ?3",
                params![consumer_name, message_id, lock_id, error, now.as_i64()],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn fetch_inbox(
        &self,
        consumer_name: &str,
        message_id: i64,
    ) -> Result<Option<InboxEntry>, LedgerError> {
        let consumer_name = consumer_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT consumer_name, message_id, message_header, exchange, routing_key, \
                 status, lock_id, lock_time, last_error, create_time, update_time \
                 FROM inbox_messages WHERE consumer_name = ?1 AND message_id = ?2",
            )?;
            type RawInboxRow = (
                String,
                i64,
                String,
                String,
                String,
                i64,
                Option<String>,
                Option<i64>,
                Option<String>,
                i64,
                i64,
            );
            let raw: Option<RawInboxRow> = match stmt.query_row(
                params![consumer_name, message_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                    ))
                },
            ) {
                Ok(raw) => Some(raw),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            let Some(raw) = raw else { return Ok(None) };
            Ok(Some(InboxEntry {
                consumer_name: raw.0,
                message_id: raw.1,
                header: MessageHeader::from_json(&raw.2)?,
                exchange: raw.3,
                routing_key: raw.4,
                status: MessageStatus::from_i64(raw.5)?,
                lock_id: raw.6,
                lock_time: raw.7.map(UnixMillis),
                last_error: raw.8,
                create_time: UnixMillis(raw.9),
                update_time: UnixMillis(raw.10),
            }))
        })
        .await
    }

    async fn purge_inbox(&self, cutoff: UnixMillis, limit: usize) -> Result<usize, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM inbox_messages \
                 WHERE (consumer_name, message_id) IN ( \
                     SELECT consumer_name, message_id FROM inbox_messages \
                     WHERE status = 3 AND update_time < ?1 \
                     LIMIT ?2)",
                params![cutoff.as_i64(), limit],
            )?;
            Ok(deleted)
        })
        .await
    }
}
