//! Background sweeper: claims dispatch-eligible outbox rows in batches,
//! publishes them, and garbage-collects terminal rows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use super::{DispatchOutcome, OutboxPublisher};
use crate::broker::BrokerChannel;
use crate::message::UnixMillis;
use crate::provider::{LedgerError, LedgerProvider};

/// Counters accumulated over a sweeper's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub claimed: u64,
    pub published: u64,
    pub failed: u64,
    pub purged: u64,
    pub errors: u64,
}

impl SweeperStats {
    fn merge(&mut self, other: SweeperStats) {
        self.sweeps += other.sweeps;
        self.claimed += other.claimed;
        self.published += other.published;
        self.failed += other.failed;
        self.purged += other.purged;
        self.errors += other.errors;
    }
}

/// Periodically drains the outbox.
///
/// Each sweep atomically claims up to `batch_size` eligible rows
/// (Pending, Failed past their retry time, or Processing with an expired
/// lock whose owner is presumed crashed), publishes each one, then
/// batch-deletes Succeeded rows older than the retention cutoff from
/// both ledgers.
///
/// ## Example
///
/// ```ignore
/// let sweeper = OutboxSweeper::new(publisher)
///     .with_batch_size(50)
///     .with_poll_interval(Duration::from_millis(500));
///
/// let handle = sweeper.spawn();
/// // ... shutdown ...
/// let stats = handle.stop().await;
/// ```
pub struct OutboxSweeper<L, B> {
    publisher: OutboxPublisher<L, B>,
    batch_size: usize,
    poll_interval: Duration,
    lock_timeout: Duration,
    retention: Duration,
    purge_batch: usize,
}

impl<L, B> OutboxSweeper<L, B>
where
    L: LedgerProvider + 'static,
    B: BrokerChannel + 'static,
{
    pub fn new(publisher: OutboxPublisher<L, B>) -> Self {
        Self {
            publisher,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
            purge_batch: 200,
        }
    }

    /// Max rows claimed per sweep.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How old a Processing lock must be before the sweeper reclaims it.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// How long Succeeded rows are kept before garbage collection.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Max rows deleted per ledger per sweep.
    pub fn with_purge_batch(mut self, size: usize) -> Self {
        self.purge_batch = size;
        self
    }

    /// Run a single sweep: claim, publish, purge.
    pub async fn sweep_once(&self) -> Result<SweeperStats, LedgerError> {
        let mut stats = SweeperStats {
            sweeps: 1,
            ..SweeperStats::default()
        };
        let ledger = Arc::clone(self.publisher.ledger());
        let lock_id = Uuid::new_v4().to_string();
        let now = UnixMillis::now();

        let claimed = ledger
            .lock_outbox_batch(self.batch_size, &lock_id, now, self.lock_timeout)
            .await?;
        stats.claimed = claimed.len() as u64;

        for entry in &claimed {
            match self.publisher.deliver(entry, &lock_id).await {
                Ok(DispatchOutcome::Published) => stats.published += 1,
                Ok(DispatchOutcome::Failed) => stats.failed += 1,
                Ok(DispatchOutcome::Skipped) => {}
                Err(error) => {
                    stats.errors += 1;
                    error!(%error, message_id = entry.message_id, "sweep delivery failed");
                }
            }
        }

        let cutoff = now.saturating_sub(self.retention);
        stats.purged += ledger.purge_outbox(cutoff, self.purge_batch).await? as u64;
        stats.purged += ledger.purge_inbox(cutoff, self.purge_batch).await? as u64;

        if stats.claimed > 0 || stats.purged > 0 {
            debug!(
                claimed = stats.claimed,
                published = stats.published,
                failed = stats.failed,
                purged = stats.purged,
                "outbox sweep complete"
            );
        }
        Ok(stats)
    }

    /// Spawn the sweep loop on the current runtime.
    pub fn spawn(self) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut stats = SweeperStats::default();
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => match self.sweep_once().await {
                        Ok(sweep) => stats.merge(sweep),
                        Err(error) => {
                            stats.errors += 1;
                            error!(%error, "outbox sweep failed");
                        }
                    },
                }
            }
            stats
        });

        SweeperHandle {
            stop: stop_tx,
            handle,
        }
    }
}

/// Handle to a spawned sweeper.
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<SweeperStats>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for its final stats.
    pub async fn stop(self) -> SweeperStats {
        let _ = self.stop.send(true);
        self.handle.await.unwrap_or_default()
    }
}
