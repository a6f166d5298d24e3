//! Shared fixtures for the integration suites.
//!
//! Each integration binary compiles this module independently and not
//! every binary touches every helper.
#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use surebus::{
    BrokerChannel, BrokerError, Codec, CodecError, ConsumeContext, Consumer, ConsumerState,
    DecodedMessage, Delivery, ExecuteError, InMemoryBroker, MessageHeader,
};

/// Consumer with scripted behavior and execution counters.
pub struct TestConsumer {
    executions: AtomicU32,
    failure_hooks: AtomicU32,
    fallback_calls: AtomicU32,
    fail_remaining: AtomicU32,
    fallback_state: Option<ConsumerState>,
    hook_errors: bool,
}

impl TestConsumer {
    pub fn succeeding() -> Self {
        Self::failing_first(0)
    }

    /// Fail the first `n` executions, then succeed.
    pub fn failing_first(n: u32) -> Self {
        Self {
            executions: AtomicU32::new(0),
            failure_hooks: AtomicU32::new(0),
            fallback_calls: AtomicU32::new(0),
            fail_remaining: AtomicU32::new(n),
            fallback_state: None,
            hook_errors: false,
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Script the fallback to return `state` instead of the default.
    pub fn with_fallback(mut self, state: ConsumerState) -> Self {
        self.fallback_state = Some(state);
        self
    }

    /// Make the per-attempt failure hook itself return an error.
    pub fn with_failing_hook(mut self) -> Self {
        self.hook_errors = true;
        self
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn failure_hooks(&self) -> u32 {
        self.failure_hooks.load(Ordering::SeqCst)
    }

    pub fn fallback_calls(&self) -> u32 {
        self.fallback_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for TestConsumer {
    fn decode(&self, codec: Codec, body: &[u8]) -> Result<DecodedMessage, CodecError> {
        Ok(Box::new(codec.decode::<serde_json::Value>(body)?))
    }

    async fn execute(
        &self,
        _ctx: &ConsumeContext<'_>,
        _message: &(dyn Any + Send + Sync),
    ) -> Result<(), ExecuteError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(ExecuteError::handler("scripted failure"));
        }
        Ok(())
    }

    async fn on_failure(
        &self,
        _ctx: &ConsumeContext<'_>,
        _error: &ExecuteError,
    ) -> Result<(), ExecuteError> {
        self.failure_hooks.fetch_add(1, Ordering::SeqCst);
        if self.hook_errors {
            return Err(ExecuteError::handler("scripted hook failure"));
        }
        Ok(())
    }

    async fn fallback(
        &self,
        _ctx: &ConsumeContext<'_>,
        _error: ExecuteError,
    ) -> Result<ConsumerState, ExecuteError> {
        self.fallback_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fallback_state.unwrap_or_default())
    }
}

/// Channel wrapper that rejects the first `n` publishes.
pub struct FlakyChannel {
    inner: InMemoryBroker,
    fail_remaining: AtomicU32,
}

impl FlakyChannel {
    pub fn new(inner: InMemoryBroker, fail_first: u32) -> Self {
        Self {
            inner,
            fail_remaining: AtomicU32::new(fail_first),
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.inner
    }
}

#[async_trait]
impl BrokerChannel for FlakyChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::Rejected("scripted broker outage".to_string()));
        }
        self.inner.publish(exchange, routing_key, header, body).await
    }

    async fn poll(
        &self,
        queue: &str,
        timeout: std::time::Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        self.inner.poll(queue, timeout).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner.ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner.nack(delivery_tag, requeue).await
    }
}

/// Header for a JSON test message routed to the orders exchange.
pub fn orders_header(message_id: i64) -> MessageHeader {
    MessageHeader::new(message_id, "OrderCreated").route_to("orders", "created")
}

/// Publish a JSON message straight onto `queue` via the default exchange.
pub async fn publish_to_queue(broker: &InMemoryBroker, queue: &str, header: &MessageHeader) {
    broker
        .publish("", queue, header, br#"{"id":1}"#)
        .await
        .expect("publish");
}
