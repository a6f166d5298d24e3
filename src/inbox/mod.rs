//! Inbox barrier: idempotent consumption of (consumer, message) pairs.
//!
//! The barrier converts the broker's at-least-once delivery into an
//! exactly-once application effect: a redelivery after a crash finds
//! either an `AlreadyCompleted` entry (skip the handler, still ack) or a
//! clean `Entered` slot to retry. Concurrent delivery attempts resolve
//! to `Busy` for all but one owner via a single conditional update, with
//! no external lock service.

mod entry;
mod wrap;

pub use entry::{BarrierEnterResult, InboxEntry};
pub use wrap::{HandlerChain, IdempotentConsumer};
