use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, warn};

use super::{ConsumeContext, ConsumeOptions, ConsumerRegistry, ConsumerState};
use crate::broker::{BrokerChannel, BrokerError, Delivery};
use crate::diagnostics::{Breakdown, PipelineMetrics, TracingBreakdown};
use crate::message::Codec;
use crate::retry::{FixedRetryPolicyFactory, RetryPolicyFactory};

/// Final settlement of one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
}

/// Drives deliveries through decode → execute-with-retry → fallback →
/// acknowledgement.
///
/// One pipeline serves one channel; `run` consumes a queue with one task
/// per in-flight delivery, bounded by the queue's prefetch. There is no
/// shared mutable state across deliveries beyond the atomic counters in
/// [`PipelineMetrics`].
///
/// ## Example
///
/// ```ignore
/// let pipeline = ConsumePipeline::new(channel, registry)
///     .with_retry_factory(Arc::new(FixedRetryPolicyFactory::new(policy)));
///
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// pipeline.run(ConsumeOptions::new("orders-queue"), shutdown_rx).await?;
/// ```
pub struct ConsumePipeline<B> {
    channel: Arc<B>,
    registry: Arc<ConsumerRegistry>,
    retry_factory: Arc<dyn RetryPolicyFactory>,
    breakdown: Arc<dyn Breakdown>,
    metrics: Arc<PipelineMetrics>,
}

impl<B> Clone for ConsumePipeline<B> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            registry: Arc::clone(&self.registry),
            retry_factory: Arc::clone(&self.retry_factory),
            breakdown: Arc::clone(&self.breakdown),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<B: BrokerChannel + 'static> ConsumePipeline<B> {
    pub fn new(channel: Arc<B>, registry: Arc<ConsumerRegistry>) -> Self {
        Self {
            channel,
            registry,
            retry_factory: Arc::new(FixedRetryPolicyFactory::default()),
            breakdown: Arc::new(TracingBreakdown),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_retry_factory(mut self, factory: Arc<dyn RetryPolicyFactory>) -> Self {
        self.retry_factory = factory;
        self
    }

    pub fn with_breakdown(mut self, breakdown: Arc<dyn Breakdown>) -> Self {
        self.breakdown = breakdown;
        self
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Consume `options.queue` until `shutdown` flips to true.
    ///
    /// Each delivery is handled on its own task; the semaphore bounds
    /// in-flight deliveries to the prefetch count. Shutdown only stops
    /// acceptance of new deliveries; a message already executing runs
    /// its retry/fallback sequence to completion.
    pub async fn run(
        &self,
        options: ConsumeOptions,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let limit = Arc::new(Semaphore::new(usize::from(options.prefetch)));

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                polled = self.channel.poll(&options.queue, options.poll_timeout) => polled?,
            };
            let Some(delivery) = polled else { continue };

            let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                return Ok(());
            };
            let pipeline = self.clone();
            let options = options.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(error) = pipeline.handle_delivery(&options, delivery).await {
                    error!(%error, queue = %options.queue, "failed to settle delivery");
                }
            });
        }
    }

    /// Run one delivery through the pipeline and settle it.
    ///
    /// The returned value is the acknowledgement that was sent; the only
    /// error case is the broker refusing the ack/nack itself.
    pub async fn handle_delivery(
        &self,
        options: &ConsumeOptions,
        delivery: Delivery,
    ) -> Result<Acknowledgement, BrokerError> {
        self.metrics.record_received();
        let header = &delivery.header;
        let conservative = Acknowledgement::Nack {
            requeue: options.requeue_on_exhausted,
        };

        let codec = match Codec::for_content_type(&header.content_type) {
            Ok(codec) => codec,
            Err(error) => {
                warn!(
                    %error,
                    message_id = header.message_id,
                    "cannot select codec for delivery"
                );
                self.metrics.record_decode_failure();
                return self.settle(delivery.delivery_tag, conservative).await;
            }
        };

        // No registered consumer is a configuration hole, not a transient
        // fault: notify, never retry in-process.
        let Some(consumer) = self.registry.resolve(&options.queue, &header.type_name) else {
            self.breakdown
                .missing_consumer(&options.queue, &header.type_name, header);
            self.metrics.record_missing_consumer();
            return self.settle(delivery.delivery_tag, conservative).await;
        };

        let decoded = match consumer.decode(codec, &delivery.body) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(
                    %error,
                    message_id = header.message_id,
                    type_name = %header.type_name,
                    "delivery body failed to decode"
                );
                self.metrics.record_decode_failure();
                return self.settle(delivery.delivery_tag, conservative).await;
            }
        };

        let policy = self
            .retry_factory
            .create_policy(&options.queue, header.message_id);
        let mut attempt = 1u32;
        let last_error = loop {
            let ctx = ConsumeContext {
                queue: &options.queue,
                header,
                redelivered: delivery.redelivered,
                attempt,
            };
            match consumer.execute(&ctx, decoded.as_ref()).await {
                Ok(()) => {
                    debug!(message_id = header.message_id, attempt, "delivery handled");
                    return self.settle(delivery.delivery_tag, Acknowledgement::Ack).await;
                }
                Err(error) => {
                    if let Err(hook_error) = consumer.on_failure(&ctx, &error).await {
                        warn!(%hook_error, "failure hook errored; continuing retry loop");
                    }
                    if attempt >= policy.max_attempts() {
                        break error;
                    }
                    warn!(
                        %error,
                        message_id = header.message_id,
                        attempt,
                        "execution failed; retrying"
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        };

        // Budget exhausted: the fallback runs exactly once and owns the
        // acknowledgement decision.
        self.metrics.record_fallback();
        let ctx = ConsumeContext {
            queue: &options.queue,
            header,
            redelivered: delivery.redelivered,
            attempt,
        };
        let state = match consumer.fallback(&ctx, last_error).await {
            Ok(state) => state,
            Err(error) => {
                warn!(
                    %error,
                    message_id = header.message_id,
                    "fallback errored; using conservative default"
                );
                ConsumerState::Nack
            }
        };

        let acknowledgement = match state.requeue(options.requeue_on_exhausted) {
            None => Acknowledgement::Ack,
            Some(requeue) => Acknowledgement::Nack { requeue },
        };
        self.settle(delivery.delivery_tag, acknowledgement).await
    }

    async fn settle(
        &self,
        delivery_tag: u64,
        acknowledgement: Acknowledgement,
    ) -> Result<Acknowledgement, BrokerError> {
        match acknowledgement {
            Acknowledgement::Ack => {
                self.channel.ack(delivery_tag).await?;
                self.metrics.record_acked();
            }
            Acknowledgement::Nack { requeue } => {
                self.channel.nack(delivery_tag, requeue).await?;
                self.metrics.record_nacked();
            }
        }
        Ok(acknowledgement)
    }
}

// Behavioral coverage lives in tests/consume_pipeline.rs; these exercise
// the wiring only.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    #[test]
    fn pipeline_is_cheap_to_clone() {
        let pipeline = ConsumePipeline::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(ConsumerRegistry::new()),
        );
        let clone = pipeline.clone();
        assert_eq!(
            pipeline.metrics().snapshot().received,
            clone.metrics().snapshot().received
        );
    }
}
