//! Broker channel abstraction.
//!
//! This module defines the seam between the reliability layer and an
//! AMQP-style broker:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │            Outbox dispatcher / Consume pipeline          │
//! │   publish(exchange, routing_key, ...)   ack / nack(tag)  │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  BrokerChannel (trait)                   │
//! └──────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌─────────────────┐                 ┌─────────────────────┐
//! │ InMemoryBroker  │                 │  AMQP client        │
//! │   (included)    │                 │  (external)         │
//! └─────────────────┘                 └─────────────────────┘
//! ```
//!
//! A channel is borrowed from whatever connection pooling the host
//! provides and is owned by its caller; it is not safe for
//! unsynchronized concurrent publishing.

mod channel;
mod in_memory;

pub use channel::{BrokerChannel, BrokerError, Delivery};
pub use in_memory::InMemoryBroker;
