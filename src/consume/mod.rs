//! Per-message consume pipeline.
//!
//! One delivery flows decode → resolve → execute-with-retry → fallback →
//! acknowledgement:
//!
//! ```text
//! Received ─ decode ─▶ Executing(attempt 1..N) ─ success ─▶ Ack
//!    │                     │
//!    │ decode failed       │ budget exhausted
//!    ▼                     ▼
//!  Nack (default)       Fallback ─▶ Ack | Nack | NackAndRequeue | NackAndNoRequeue
//! ```
//!
//! The fallback's [`ConsumerState`] is the sole authority for the
//! acknowledgement; the pipeline settles every delivery exactly once.

mod options;
mod pipeline;
mod registry;
mod state;

pub use options::ConsumeOptions;
pub use pipeline::{Acknowledgement, ConsumePipeline};
pub use registry::ConsumerRegistry;
pub use state::ConsumerState;

use std::any::Any;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{Codec, CodecError, MessageHeader};
use crate::provider::LedgerError;

/// Type-erased decoded payload, produced by [`Consumer::decode`] and
/// handed back to [`Consumer::execute`].
pub type DecodedMessage = Box<dyn Any + Send + Sync>;

/// Error produced by consumer execution.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// Another in-flight attempt holds the inbox barrier for this
    /// (consumer, message); the delivery should be retried later.
    #[error("inbox barrier busy for {consumer}/{message_id}")]
    BarrierBusy { consumer: String, message_id: i64 },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl ExecuteError {
    /// A business handler failure with the given description.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Context handed to a consumer for one execution attempt.
#[derive(Clone, Copy, Debug)]
pub struct ConsumeContext<'a> {
    pub queue: &'a str,
    pub header: &'a MessageHeader,
    /// Whether the broker marked this delivery as redelivered.
    pub redelivered: bool,
    /// Execution attempt, 1-based.
    pub attempt: u32,
}

/// A registered message consumer.
///
/// `decode` runs once per delivery, before the retry loop; a decode
/// failure is terminal and never retried. `execute` runs once per
/// attempt. `on_failure` runs after every failed attempt for side
/// effects; its own errors are logged and swallowed, never aborting the
/// retry loop. `fallback` runs exactly once after the budget is
/// exhausted and decides the acknowledgement.
///
/// ## Example
///
/// ```ignore
/// struct OrderCreatedConsumer;
///
/// #[async_trait]
/// impl Consumer for OrderCreatedConsumer {
///     fn decode(&self, codec: Codec, body: &[u8]) -> Result<DecodedMessage, CodecError> {
///         Ok(Box::new(codec.decode::<OrderCreated>(body)?))
///     }
///
///     async fn execute(
///         &self,
///         ctx: &ConsumeContext<'_>,
///         message: &(dyn Any + Send + Sync),
///     ) -> Result<(), ExecuteError> {
///         let order = message_as::<OrderCreated>(message)?;
///         process(order).await
///     }
/// }
/// ```
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Decode the delivery body with the codec chosen by content type.
    fn decode(&self, codec: Codec, body: &[u8]) -> Result<DecodedMessage, CodecError>;

    /// Run the business handler for one attempt.
    async fn execute(
        &self,
        ctx: &ConsumeContext<'_>,
        message: &(dyn Any + Send + Sync),
    ) -> Result<(), ExecuteError>;

    /// Side-effect hook invoked after every failed attempt.
    async fn on_failure(
        &self,
        _ctx: &ConsumeContext<'_>,
        _error: &ExecuteError,
    ) -> Result<(), ExecuteError> {
        Ok(())
    }

    /// Terminal compensation once the retry budget is exhausted. The
    /// returned state is the final word on the acknowledgement.
    async fn fallback(
        &self,
        _ctx: &ConsumeContext<'_>,
        _error: ExecuteError,
    ) -> Result<ConsumerState, ExecuteError> {
        Ok(ConsumerState::Nack)
    }
}

/// Downcast a decoded message to its concrete payload type.
pub fn message_as<T: 'static>(message: &(dyn Any + Send + Sync)) -> Result<&T, ExecuteError> {
    message.downcast_ref::<T>().ok_or_else(|| {
        ExecuteError::handler(format!(
            "decoded payload is not a {}",
            std::any::type_name::<T>()
        ))
    })
}
