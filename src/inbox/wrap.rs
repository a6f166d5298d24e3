use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BarrierEnterResult, InboxEntry};
use crate::consume::{ConsumeContext, Consumer, ConsumerState, DecodedMessage, ExecuteError};
use crate::message::{Codec, CodecError, UnixMillis};
use crate::provider::{truncate_error, LedgerProvider};

/// Wraps a consumer with the inbox barrier.
///
/// Every execution first enters the barrier for
/// `(consumer_name, message_id)`:
///
/// - `Entered`: the inner consumer runs, then the entry is marked
///   Succeeded or Failed under the same lock id;
/// - `AlreadyCompleted`: the inner consumer is skipped and the
///   execution reports success, so the pipeline still acks;
/// - `Busy`: a retryable [`ExecuteError::BarrierBusy`] is returned and
///   the delivery ends up requeued at the broker.
///
/// Two integration shapes exist: [`new`](Self::new) for a consumer with
/// an explicit identity (one that owns its own connection/transaction
/// handling), and [`bound_to_queue`](Self::bound_to_queue) for
/// event-handler chains whose identity is the queue they are bound to.
pub struct IdempotentConsumer<C> {
    consumer_name: String,
    inner: C,
    ledger: Arc<dyn LedgerProvider>,
    lock_timeout: Duration,
    max_error_len: usize,
}

impl<C: Consumer> IdempotentConsumer<C> {
    pub fn new(
        consumer_name: impl Into<String>,
        inner: C,
        ledger: Arc<dyn LedgerProvider>,
    ) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            inner,
            ledger,
            lock_timeout: Duration::from_secs(60),
            max_error_len: 512,
        }
    }

    /// Derive the consumer identity from the bound queue. The barrier is
    /// then shared by every handler consuming that queue, which is the
    /// shape event-handler chains use.
    pub fn bound_to_queue(queue: &str, inner: C, ledger: Arc<dyn LedgerProvider>) -> Self {
        Self::new(queue, inner, ledger)
    }

    /// Set how old a Processing lock must be before a new delivery
    /// attempt may take the barrier over.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Cap (in bytes) applied to handler error text before storage.
    pub fn with_max_error_len(mut self, max: usize) -> Self {
        self.max_error_len = max;
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }
}

#[async_trait]
impl<C: Consumer> Consumer for IdempotentConsumer<C> {
    fn decode(&self, codec: Codec, body: &[u8]) -> Result<DecodedMessage, CodecError> {
        self.inner.decode(codec, body)
    }

    async fn execute(
        &self,
        ctx: &ConsumeContext<'_>,
        message: &(dyn Any + Send + Sync),
    ) -> Result<(), ExecuteError> {
        let entry = InboxEntry::new(self.consumer_name.clone(), ctx.header.clone());
        let lock_id = Uuid::new_v4().to_string();
        let now = UnixMillis::now();

        match self
            .ledger
            .try_enter_inbox(&entry, &lock_id, now, self.lock_timeout)
            .await?
        {
            BarrierEnterResult::AlreadyCompleted => {
                debug!(
                    consumer = %self.consumer_name,
                    message_id = ctx.header.message_id,
                    "duplicate delivery; barrier already completed"
                );
                Ok(())
            }
            BarrierEnterResult::Busy => Err(ExecuteError::BarrierBusy {
                consumer: self.consumer_name.clone(),
                message_id: ctx.header.message_id,
            }),
            BarrierEnterResult::Entered => {
                match self.inner.execute(ctx, message).await {
                    Ok(()) => {
                        let now = UnixMillis::now();
                        if !self
                            .ledger
                            .mark_inbox_succeeded(
                                &self.consumer_name,
                                ctx.header.message_id,
                                &lock_id,
                                now,
                            )
                            .await?
                        {
                            // A newer owner took the barrier over while we
                            // were executing; its result stands, not ours.
                            warn!(
                                consumer = %self.consumer_name,
                                message_id = ctx.header.message_id,
                                "barrier lock lost before success mark"
                            );
                        }
                        Ok(())
                    }
                    Err(error) => {
                        let text = error.to_string();
                        let text = truncate_error(&text, self.max_error_len);
                        let now = UnixMillis::now();
                        if let Err(mark_error) = self
                            .ledger
                            .mark_inbox_failed(
                                &self.consumer_name,
                                ctx.header.message_id,
                                &lock_id,
                                text,
                                now,
                            )
                            .await
                        {
                            warn!(%mark_error, "failed to record barrier failure");
                        }
                        Err(error)
                    }
                }
            }
        }
    }

    async fn on_failure(
        &self,
        ctx: &ConsumeContext<'_>,
        error: &ExecuteError,
    ) -> Result<(), ExecuteError> {
        self.inner.on_failure(ctx, error).await
    }

    async fn fallback(
        &self,
        ctx: &ConsumeContext<'_>,
        error: ExecuteError,
    ) -> Result<ConsumerState, ExecuteError> {
        self.inner.fallback(ctx, error).await
    }
}

/// Runs several handlers, in order, as one consumer.
///
/// The first handler decodes the delivery; every handler then receives
/// the same decoded payload, and the chain fails on the first handler
/// error. Wrap a chain in [`IdempotentConsumer::bound_to_queue`] to give
/// the whole chain a single barrier entry per message.
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Consumer>>,
}

impl HandlerChain {
    pub fn new(first: Arc<dyn Consumer>) -> Self {
        Self {
            handlers: vec![first],
        }
    }

    /// Append a handler. Uses builder pattern, returns `self`.
    pub fn with_handler(mut self, handler: Arc<dyn Consumer>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl Consumer for HandlerChain {
    fn decode(&self, codec: Codec, body: &[u8]) -> Result<DecodedMessage, CodecError> {
        self.handlers[0].decode(codec, body)
    }

    async fn execute(
        &self,
        ctx: &ConsumeContext<'_>,
        message: &(dyn Any + Send + Sync),
    ) -> Result<(), ExecuteError> {
        for handler in &self.handlers {
            handler.execute(ctx, message).await?;
        }
        Ok(())
    }
}
