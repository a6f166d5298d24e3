//! Observability ports: breakdown notifications and pipeline counters.
//!
//! Both are injected collaborators with sensible defaults (a
//! tracing-backed notifier, in-process atomic counters), never global
//! mutable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::error;

use crate::message::MessageHeader;

/// Notifier for conditions that need operator attention.
///
/// Two classes of breakdown exist: configuration holes (a message with no
/// registered consumer, a publish no binding routed) and the
/// ledger-inconsistency alarm (a publish the broker accepted that the
/// ledger refused to record as succeeded).
pub trait Breakdown: Send + Sync {
    /// A delivery arrived for which no consumer is registered.
    fn missing_consumer(&self, queue: &str, type_name: &str, header: &MessageHeader);

    /// A published message matched no binding.
    fn unroutable(&self, exchange: &str, routing_key: &str, message_id: i64);

    /// The broker has the message but the ledger disagrees.
    fn ledger_inconsistency(&self, message_id: i64, detail: &str);
}

/// Default notifier: logs every breakdown at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingBreakdown;

impl Breakdown for TracingBreakdown {
    fn missing_consumer(&self, queue: &str, type_name: &str, header: &MessageHeader) {
        error!(
            queue,
            type_name,
            message_id = header.message_id,
            "no consumer registered for delivery"
        );
    }

    fn unroutable(&self, exchange: &str, routing_key: &str, message_id: i64) {
        error!(exchange, routing_key, message_id, "message matched no binding");
    }

    fn ledger_inconsistency(&self, message_id: i64, detail: &str) {
        error!(message_id, detail, "outbox ledger inconsistency");
    }
}

/// Notifier that drops every breakdown.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBreakdown;

impl Breakdown for NullBreakdown {
    fn missing_consumer(&self, _queue: &str, _type_name: &str, _header: &MessageHeader) {}
    fn unroutable(&self, _exchange: &str, _routing_key: &str, _message_id: i64) {}
    fn ledger_inconsistency(&self, _message_id: i64, _detail: &str) {}
}

/// One recorded breakdown, kept by [`RecordingBreakdown`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakdownEvent {
    MissingConsumer {
        queue: String,
        type_name: String,
        message_id: i64,
    },
    Unroutable {
        exchange: String,
        routing_key: String,
        message_id: i64,
    },
    LedgerInconsistency {
        message_id: i64,
        detail: String,
    },
}

/// Notifier that buffers breakdowns for inspection. Intended for tests.
#[derive(Debug, Default)]
pub struct RecordingBreakdown {
    events: Mutex<Vec<BreakdownEvent>>,
}

impl RecordingBreakdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BreakdownEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: BreakdownEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Breakdown for RecordingBreakdown {
    fn missing_consumer(&self, queue: &str, type_name: &str, header: &MessageHeader) {
        self.push(BreakdownEvent::MissingConsumer {
            queue: queue.to_string(),
            type_name: type_name.to_string(),
            message_id: header.message_id,
        });
    }

    fn unroutable(&self, exchange: &str, routing_key: &str, message_id: i64) {
        self.push(BreakdownEvent::Unroutable {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message_id,
        });
    }

    fn ledger_inconsistency(&self, message_id: i64, detail: &str) {
        self.push(BreakdownEvent::LedgerInconsistency {
            message_id,
            detail: detail.to_string(),
        });
    }
}

/// Counters kept by the consume pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
    decode_failures: AtomicU64,
    missing_consumers: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub decode_failures: u64,
    pub missing_consumers: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_nacked(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_missing_consumer(&self) {
        self.missing_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            missing_consumers: self.missing_consumers.load(Ordering::Relaxed),
        }
    }
}
