use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::MessageHeader;

/// Error type for broker channel operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connection to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected the publish.
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// An ack/nack referenced a delivery tag the channel does not know.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// Shared channel state was poisoned by a panicking holder.
    #[error("broker channel state poisoned")]
    Poisoned,
}

/// One message handed to a consumer by the broker.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery.
    pub delivery_tag: u64,
    /// Queue the delivery was consumed from.
    pub queue: String,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

/// Channel to an AMQP-style broker.
///
/// This is a pull-based interface: the consume pipeline polls for
/// deliveries and settles each one with exactly one `ack` or `nack`.
/// Implementations wrap a real broker client; [`InMemoryBroker`]
/// (included) serves tests and single-process deployments.
///
/// [`InMemoryBroker`]: super::InMemoryBroker
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Publish a message to an exchange with a routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Poll for the next delivery on a queue, waiting up to `timeout`.
    async fn poll(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery as processed.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery. With `requeue` the broker redelivers it (with
    /// the redelivered flag set); without, the message is dead-lettered.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
