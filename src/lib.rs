//! surebus: exactly-once-effect messaging over an at-least-once broker.
//!
//! A reliability layer that sits between application code and an
//! AMQP-style broker (exchanges, queues, routing keys, ack/nack). The
//! broker only promises at-least-once delivery; this crate couples
//! message dispatch to a durable relational ledger so that application
//! effects happen exactly once:
//!
//! ```text
//! ┌────────────┐  register (caller's txn)  ┌────────────────────┐
//! │  business  │──────────────────────────▶│   outbox ledger    │
//! │   write    │                           │ (Pending rows)     │
//! └────────────┘                           └─────────┬──────────┘
//!                                                    │ lock → publish → mark
//!                                                    ▼
//!                                          ┌────────────────────┐
//!                                          │       broker       │
//!                                          └─────────┬──────────┘
//!                                                    │ deliver (≥ once)
//!                                                    ▼
//! ┌────────────┐   enter barrier   ┌─────────────────────────────┐
//! │   inbox    │◀──────────────────│      consume pipeline       │
//! │   ledger   │  Entered / Busy / │ decode → retry → fallback → │
//! └────────────┘  AlreadyCompleted │          ack / nack         │
//!                                  └─────────────────────────────┘
//! ```
//!
//! - The **outbox** makes "business write" and "intent to publish" one
//!   atomic transaction, then dispatches asynchronously (lock, publish,
//!   mark, with the broker call outside any database transaction).
//! - The **inbox barrier** makes consumption of a (consumer, message)
//!   pair idempotent across redelivery and concurrent attempts.
//! - The **consume pipeline** gives every delivery bounded retries and a
//!   terminal fallback whose result decides the acknowledgement.
//!
//! All cross-process coordination uses row-level conditional updates
//! (`status` + `lock_id` + `lock_time`): there is no external lock
//! manager, and locks recover automatically after a crash via the
//! processing timeout.

mod broker;
mod consume;
mod diagnostics;
mod inbox;
mod message;
mod outbox;
mod provider;
mod retry;

pub use broker::{BrokerChannel, BrokerError, Delivery, InMemoryBroker};
pub use consume::{
    message_as, Acknowledgement, ConsumeContext, ConsumeOptions, ConsumePipeline, Consumer,
    ConsumerRegistry, ConsumerState, DecodedMessage, ExecuteError,
};
pub use diagnostics::{
    Breakdown, BreakdownEvent, MetricsSnapshot, NullBreakdown, PipelineMetrics,
    RecordingBreakdown, TracingBreakdown,
};
pub use inbox::{BarrierEnterResult, HandlerChain, IdempotentConsumer, InboxEntry};
pub use message::{
    Codec, CodecError, IdGenerator, MessageHeader, UnixMillis, CONTENT_TYPE_BITCODE,
    CONTENT_TYPE_JSON,
};
pub use outbox::{
    DispatchOutcome, OutboxEntry, OutboxPublisher, OutboxSweeper, SweeperHandle, SweeperStats,
};
pub use provider::{LedgerError, LedgerProvider, MessageStatus};
pub use retry::{
    FixedRetryPolicyFactory, RetryPolicy, RetryPolicyError, RetryPolicyFactory,
};

#[cfg(feature = "sqlite")]
pub use provider::SqliteLedger;
