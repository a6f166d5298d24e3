use std::time::Duration;

/// Per-queue consumption options.
#[derive(Clone, Debug)]
pub struct ConsumeOptions {
    /// Queue to consume from.
    pub queue: String,
    /// Maximum unacknowledged deliveries in flight (Qos). `prefetch = 1`
    /// forces strict per-consumer serialization; higher values allow
    /// out-of-order completion.
    pub prefetch: u16,
    /// Requeue flag applied when a fallback returns plain `Nack`, and by
    /// the conservative-default branch (decode failure, missing
    /// consumer, fallback error).
    pub requeue_on_exhausted: bool,
    /// How long one poll waits before the run loop re-checks shutdown.
    pub poll_timeout: Duration,
}

impl ConsumeOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 16,
            requeue_on_exhausted: true,
            poll_timeout: Duration::from_millis(500),
        }
    }

    /// Set the prefetch count; clamped to at least 1.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_requeue_on_exhausted(mut self, requeue: bool) -> Self {
        self.requeue_on_exhausted = requeue;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}
