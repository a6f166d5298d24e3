use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::OutboxEntry;
use crate::broker::BrokerChannel;
use crate::diagnostics::{Breakdown, TracingBreakdown};
use crate::message::UnixMillis;
use crate::provider::{truncate_error, LedgerError, LedgerProvider};
use crate::retry::RetryPolicy;

/// Result of one dispatch attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The message reached the broker and the ledger recorded Succeeded.
    Published,
    /// Another dispatcher owns the row (or it is already Succeeded);
    /// nothing was done. Not an error.
    Skipped,
    /// The broker publish failed; the row is marked Failed and will be
    /// retried after its backoff.
    Failed,
}

/// Registers outgoing messages and dispatches them to the broker.
///
/// `register` only touches the ledger; `dispatch` is the
/// lock → publish → mark sequence. A crash between the publish and the
/// success mark leaves a Processing row whose lock eventually expires,
/// so a sweeper re-publishes the message: the accepted at-least-once
/// window of the outbox pattern. Downstream consumers deduplicate by
/// message id via the inbox barrier.
pub struct OutboxPublisher<L, B> {
    ledger: Arc<L>,
    channel: Arc<B>,
    breakdown: Arc<dyn Breakdown>,
    /// Backoff applied to `next_retry_time` after a failed publish.
    backoff: RetryPolicy,
    lock_timeout: Duration,
    max_error_len: usize,
}

impl<L, B> Clone for OutboxPublisher<L, B> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            channel: Arc::clone(&self.channel),
            breakdown: Arc::clone(&self.breakdown),
            backoff: self.backoff.clone(),
            lock_timeout: self.lock_timeout,
            max_error_len: self.max_error_len,
        }
    }
}

impl<L: LedgerProvider, B: BrokerChannel> OutboxPublisher<L, B> {
    pub fn new(ledger: Arc<L>, channel: Arc<B>) -> Self {
        Self {
            ledger,
            channel,
            breakdown: Arc::new(TracingBreakdown),
            backoff: RetryPolicy::new(20)
                .with_base_delay(Duration::from_secs(2))
                .with_max_delay(Duration::from_secs(300)),
            lock_timeout: Duration::from_secs(60),
            max_error_len: 512,
        }
    }

    pub fn with_breakdown(mut self, breakdown: Arc<dyn Breakdown>) -> Self {
        self.breakdown = breakdown;
        self
    }

    /// Set the backoff used to schedule failed rows for retry.
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set how old a Processing lock must be before it counts as dead.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Cap (in bytes) applied to stored broker error text.
    pub fn with_max_error_len(mut self, max: usize) -> Self {
        self.max_error_len = max;
        self
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Record the intent to publish. Ledger only; the broker is not
    /// contacted here. Callers holding their own transaction use the
    /// provider's transactional form instead and skip this method.
    pub async fn register(&self, entry: OutboxEntry) -> Result<(), LedgerError> {
        debug!(
            message_id = entry.message_id,
            exchange = %entry.exchange,
            routing_key = %entry.routing_key,
            "registering outbox message"
        );
        self.ledger.insert_outbox(&entry).await
    }

    /// Dispatch one registered message to the broker.
    ///
    /// Phase 1 atomically claims the row; losing the claim returns
    /// [`DispatchOutcome::Skipped`] without error. Phase 2 publishes
    /// outside any transaction. Phase 3 marks the row, conditioned on
    /// the lock still being ours.
    pub async fn dispatch(&self, message_id: i64) -> Result<DispatchOutcome, LedgerError> {
        let lock_id = Uuid::new_v4().to_string();
        let now = UnixMillis::now();

        if !self
            .ledger
            .try_lock_outbox(message_id, &lock_id, now, self.lock_timeout)
            .await?
        {
            debug!(message_id, "outbox row not claimable; skipping");
            return Ok(DispatchOutcome::Skipped);
        }

        let Some(entry) = self.ledger.fetch_outbox(message_id).await? else {
            return Err(LedgerError::Inconsistency {
                message_id,
                detail: "row vanished between claim and read".to_string(),
            });
        };
        self.deliver(&entry, &lock_id).await
    }

    /// Publish an already-claimed row and record the result.
    ///
    /// Used by [`dispatch`](Self::dispatch) and by sweepers after a
    /// batch claim; `lock_id` must be the id the claim was made with.
    pub async fn deliver(
        &self,
        entry: &OutboxEntry,
        lock_id: &str,
    ) -> Result<DispatchOutcome, LedgerError> {
        let published = self
            .channel
            .publish(&entry.exchange, &entry.routing_key, &entry.header, &entry.body)
            .await;
        let now = UnixMillis::now();

        match published {
            Ok(()) => {
                if self
                    .ledger
                    .mark_outbox_succeeded(entry.message_id, lock_id, now)
                    .await?
                {
                    debug!(message_id = entry.message_id, "outbox message published");
                    return Ok(DispatchOutcome::Published);
                }
                // The broker already has the message but the ledger refused
                // the mark: the two systems now disagree about a message
                // that left the process. Raise the alarm.
                let detail = "publish succeeded but success mark affected zero rows";
                self.breakdown.ledger_inconsistency(entry.message_id, detail);
                Err(LedgerError::Inconsistency {
                    message_id: entry.message_id,
                    detail: detail.to_string(),
                })
            }
            Err(error) => {
                let text = error.to_string();
                let text = truncate_error(&text, self.max_error_len);
                let next_retry =
                    now.saturating_add(self.backoff.delay_with_jitter(entry.retry_count + 1));
                if !self
                    .ledger
                    .mark_outbox_failed(entry.message_id, lock_id, text, next_retry, now)
                    .await?
                {
                    warn!(
                        message_id = entry.message_id,
                        "lock lost before failure mark; another dispatcher owns the row"
                    );
                }
                warn!(
                    message_id = entry.message_id,
                    error = text,
                    retry_count = entry.retry_count + 1,
                    "broker publish failed; scheduled for retry"
                );
                Ok(DispatchOutcome::Failed)
            }
        }
    }
}
