use crate::message::{MessageHeader, UnixMillis};
use crate::provider::MessageStatus;

/// Outcome of an attempt to enter the inbox barrier for one
/// (consumer, message) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierEnterResult {
    /// The caller now owns the barrier and must run the business handler,
    /// then mark the entry succeeded or failed.
    Entered,
    /// Another in-flight attempt holds a live lock; the caller must not
    /// proceed. Typically surfaced as a retryable error so the broker
    /// requeues the delivery.
    Busy,
    /// The entry is already Succeeded; the caller must skip the business
    /// handler and still acknowledge the delivery as processed.
    AlreadyCompleted,
}

/// One row of the inbox ledger, keyed by (consumer_name, message_id).
///
/// A row is inserted on first delivery and afterwards only transitioned
/// through the provider's conditional updates; the unique composite key
/// is what turns concurrent redeliveries into the
/// Entered / Busy / AlreadyCompleted outcome space instead of duplicate
/// processing.
#[derive(Clone, Debug)]
pub struct InboxEntry {
    pub consumer_name: String,
    pub message_id: i64,
    pub header: MessageHeader,
    pub exchange: String,
    pub routing_key: String,
    pub status: MessageStatus,
    pub lock_id: Option<String>,
    pub lock_time: Option<UnixMillis>,
    pub last_error: Option<String>,
    pub create_time: UnixMillis,
    pub update_time: UnixMillis,
}

impl InboxEntry {
    /// Build a barrier entry for a delivery of `header` to `consumer_name`.
    pub fn new(consumer_name: impl Into<String>, header: MessageHeader) -> Self {
        let now = UnixMillis::now();
        Self {
            consumer_name: consumer_name.into(),
            message_id: header.message_id,
            exchange: header.exchange.clone(),
            routing_key: header.routing_key.clone(),
            header,
            status: MessageStatus::Processing,
            lock_id: None,
            lock_time: None,
            last_error: None,
            create_time: now,
            update_time: now,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == MessageStatus::Succeeded
    }
}
