use std::collections::HashMap;
use std::sync::Arc;

use super::Consumer;

/// Static registry mapping (queue, message type name) to a consumer.
///
/// Built once at startup from configuration or code and handed to the
/// pipeline immutably; consumer wiring is explicit, never discovered at
/// runtime. Registering the same key twice replaces the earlier
/// consumer, which keeps startup wiring order-independent for overrides.
///
/// ## Example
///
/// ```ignore
/// let registry = ConsumerRegistry::new()
///     .register("orders-queue", "OrderCreated", Arc::new(OrderCreatedConsumer))
///     .register("orders-queue", "OrderCancelled", Arc::new(OrderCancelledConsumer));
/// ```
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<(String, String), Arc<dyn Consumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer for deliveries of `type_name` on `queue`.
    ///
    /// Uses builder pattern, returns `self` for chaining.
    pub fn register(
        mut self,
        queue: impl Into<String>,
        type_name: impl Into<String>,
        consumer: Arc<dyn Consumer>,
    ) -> Self {
        self.consumers.insert((queue.into(), type_name.into()), consumer);
        self
    }

    /// Look up the consumer for a (queue, type name) pair.
    pub fn resolve(&self, queue: &str, type_name: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers
            .get(&(queue.to_string(), type_name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
