use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{BrokerChannel, BrokerError, Delivery};
use crate::message::MessageHeader;

/// How often `poll` re-checks an empty queue before its timeout elapses.
const POLL_TICK: Duration = Duration::from_millis(5);

#[derive(Clone, Debug)]
struct QueuedMessage {
    header: MessageHeader,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    /// (exchange, routing_key) → bound queue names.
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    /// Delivered but unsettled messages, keyed by delivery tag.
    unacked: HashMap<u64, (String, QueuedMessage)>,
    /// Messages nacked without requeue.
    dead_letters: Vec<QueuedMessage>,
    /// Published messages no binding matched.
    unrouted: Vec<QueuedMessage>,
}

/// In-memory broker for tests and single-process deployments.
///
/// Implements the AMQP shape this layer relies on: exchanges with
/// (exchange, routing key) → queue bindings, per-queue delivery with
/// delivery tags, ack/nack settlement, redelivery on nack+requeue, and a
/// dead-letter log for nack-without-requeue. Publishing to the default
/// exchange (`""`) routes straight to the queue named by the routing key.
///
/// ## Example
///
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.declare_queue("orders-queue");
/// broker.bind("orders", "created", "orders-queue");
///
/// let header = MessageHeader::new(1, "OrderCreated").route_to("orders", "created");
/// broker.publish("orders", "created", &header, b"{}").await?;
///
/// let delivery = broker.poll("orders-queue", Duration::from_millis(10)).await?.unwrap();
/// broker.ack(delivery.delivery_tag).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    tag_seq: Arc<AtomicU64>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            tag_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Declare a queue. Idempotent.
    pub fn declare_queue(&self, queue: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.queues.entry(queue.into()).or_default();
        }
    }

    /// Bind a queue to an (exchange, routing key) pair, declaring the
    /// queue if needed.
    pub fn bind(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue: impl Into<String>,
    ) {
        let queue = queue.into();
        if let Ok(mut state) = self.state.lock() {
            state.queues.entry(queue.clone()).or_default();
            let bound = state
                .bindings
                .entry((exchange.into(), routing_key.into()))
                .or_default();
            if !bound.contains(&queue) {
                bound.push(queue);
            }
        }
    }

    /// Number of messages waiting (not in flight) on a queue.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.queues.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Number of delivered but unsettled messages.
    pub fn unacked_len(&self) -> usize {
        self.state.lock().map(|state| state.unacked.len()).unwrap_or(0)
    }

    /// Headers of messages nacked without requeue.
    pub fn dead_letters(&self) -> Vec<MessageHeader> {
        self.state
            .lock()
            .map(|state| state.dead_letters.iter().map(|m| m.header.clone()).collect())
            .unwrap_or_default()
    }

    /// Headers of published messages no binding matched.
    pub fn unrouted(&self) -> Vec<MessageHeader> {
        self.state
            .lock()
            .map(|state| state.unrouted.iter().map(|m| m.header.clone()).collect())
            .unwrap_or_default()
    }

    fn try_pop(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        let Some(pending) = state.queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(message) = pending.pop_front() else {
            return Ok(None);
        };

        let delivery_tag = self.tag_seq.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            delivery_tag,
            queue: queue.to_string(),
            redelivered: message.redelivered,
            header: message.header.clone(),
            body: message.body.clone(),
        };
        state.unacked.insert(delivery_tag, (queue.to_string(), message));
        Ok(Some(delivery))
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let message = QueuedMessage {
            header: header.clone(),
            body: body.to_vec(),
            redelivered: false,
        };

        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;

        // Default exchange: route directly to the queue named by the key.
        if exchange.is_empty() {
            if let Some(pending) = state.queues.get_mut(routing_key) {
                pending.push_back(message);
                return Ok(());
            }
            state.unrouted.push(message);
            return Ok(());
        }

        let targets = state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            state.unrouted.push(message);
            return Ok(());
        }
        for queue in targets {
            if let Some(pending) = state.queues.get_mut(&queue) {
                pending.push_back(message.clone());
            }
        }
        Ok(())
    }

    async fn poll(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_pop(queue)? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_TICK).await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        let (queue, mut message) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;

        if requeue {
            message.redelivered = true;
            state.queues.entry(queue).or_default().push_front(message);
        } else {
            state.dead_letters.push(message);
        }
        Ok(())
    }
}
