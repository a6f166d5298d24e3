//! Inbox barrier semantics: idempotent redelivery, exclusivity under
//! concurrency, lock recovery, and the consumer integration shapes.
#![cfg(feature = "sqlite")]

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{orders_header, publish_to_queue, TestConsumer};
use surebus::{
    Acknowledgement, BarrierEnterResult, BrokerChannel, ConsumeOptions, ConsumePipeline,
    ConsumerRegistry, ExecuteError, FixedRetryPolicyFactory, HandlerChain, IdempotentConsumer,
    InMemoryBroker, InboxEntry, LedgerProvider, RetryPolicy, SqliteLedger, UnixMillis,
};

const QUEUE: &str = "orders-queue";
const CONSUMER: &str = "orders-worker";

async fn ledger() -> (Arc<SqliteLedger>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(SqliteLedger::new(dir.path().join("ledger.db")));
    ledger.ensure_schema().await.expect("schema");
    (ledger, dir)
}

fn fast_policy(max_attempts: u32) -> Arc<FixedRetryPolicyFactory> {
    Arc::new(FixedRetryPolicyFactory::new(
        RetryPolicy::new(max_attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2)),
    ))
}

/// Pipeline whose registered consumer is `inner` wrapped in the barrier.
fn barrier_pipeline(
    broker: &InMemoryBroker,
    ledger: &Arc<SqliteLedger>,
    inner: Arc<TestConsumer>,
) -> ConsumePipeline<InMemoryBroker> {
    let wrapped = IdempotentConsumer::new(
        CONSUMER,
        ChainInner(inner),
        Arc::clone(ledger) as Arc<dyn LedgerProvider>,
    );
    let registry = ConsumerRegistry::new().register(
        QUEUE,
        "OrderCreated",
        Arc::new(wrapped) as Arc<dyn surebus::Consumer>,
    );
    ConsumePipeline::new(Arc::new(broker.clone()), Arc::new(registry))
        .with_retry_factory(fast_policy(2))
}

/// Adapter so the shared `Arc<TestConsumer>` can sit inside the generic
/// wrapper while the test keeps its own handle for assertions.
struct ChainInner(Arc<TestConsumer>);

#[async_trait::async_trait]
impl surebus::Consumer for ChainInner {
    fn decode(
        &self,
        codec: surebus::Codec,
        body: &[u8],
    ) -> Result<surebus::DecodedMessage, surebus::CodecError> {
        self.0.decode(codec, body)
    }

    async fn execute(
        &self,
        ctx: &surebus::ConsumeContext<'_>,
        message: &(dyn std::any::Any + Send + Sync),
    ) -> Result<(), ExecuteError> {
        self.0.execute(ctx, message).await
    }
}

#[tokio::test]
async fn second_delivery_skips_the_handler_and_still_acks() {
    let (ledger, _dir) = ledger().await;
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE);
    let inner = Arc::new(TestConsumer::succeeding());
    let pipeline = barrier_pipeline(&broker, &ledger, Arc::clone(&inner));
    let options = ConsumeOptions::new(QUEUE);

    // First delivery: barrier entered, handler runs, acked.
    publish_to_queue(&broker, QUEUE, &orders_header(42)).await;
    let delivery = broker.poll(QUEUE, Duration::from_millis(50)).await.unwrap().unwrap();
    let ack = pipeline.handle_delivery(&options, delivery).await.unwrap();
    assert_eq!(ack, Acknowledgement::Ack);
    assert_eq!(inner.executions(), 1);

    let row = ledger.fetch_inbox(CONSUMER, 42).await.unwrap().unwrap();
    assert!(row.is_succeeded());

    // Simulated redelivery of the same message id: the handler does not
    // run again, yet the delivery is still acked.
    publish_to_queue(&broker, QUEUE, &orders_header(42)).await;
    let delivery = broker.poll(QUEUE, Duration::from_millis(50)).await.unwrap().unwrap();
    let ack = pipeline.handle_delivery(&options, delivery).await.unwrap();
    assert_eq!(ack, Acknowledgement::Ack);
    assert_eq!(inner.executions(), 1);
    assert_eq!(pipeline.metrics().snapshot().acked, 2);
}

#[tokio::test]
async fn live_lock_surfaces_as_busy_and_requeues() {
    let (ledger, _dir) = ledger().await;
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE);
    let inner = Arc::new(TestConsumer::succeeding());
    let pipeline = barrier_pipeline(&broker, &ledger, Arc::clone(&inner));
    let options = ConsumeOptions::new(QUEUE).with_requeue_on_exhausted(true);

    // Another in-flight attempt holds the barrier.
    let barrier = InboxEntry::new(CONSUMER, orders_header(7));
    let entered = ledger
        .try_enter_inbox(&barrier, "other-attempt", UnixMillis::now(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(entered, BarrierEnterResult::Entered);

    publish_to_queue(&broker, QUEUE, &orders_header(7)).await;
    let delivery = broker.poll(QUEUE, Duration::from_millis(50)).await.unwrap().unwrap();
    let ack = pipeline.handle_delivery(&options, delivery).await.unwrap();

    // Busy exhausts the (small) retry budget without ever running the
    // handler, then the default nack requeues for a later attempt.
    assert_eq!(ack, Acknowledgement::Nack { requeue: true });
    assert_eq!(inner.executions(), 0);
    assert_eq!(broker.queue_len(QUEUE), 1);
}

#[tokio::test]
async fn failed_handler_records_the_error_and_can_retry() {
    let (ledger, _dir) = ledger().await;
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE);
    let inner = Arc::new(TestConsumer::failing_first(1));
    let pipeline = barrier_pipeline(&broker, &ledger, Arc::clone(&inner));
    let options = ConsumeOptions::new(QUEUE);

    publish_to_queue(&broker, QUEUE, &orders_header(9)).await;
    let delivery = broker.poll(QUEUE, Duration::from_millis(50)).await.unwrap().unwrap();
    let ack = pipeline.handle_delivery(&options, delivery).await.unwrap();

    // Attempt 1 failed (barrier marked Failed), attempt 2 re-entered the
    // barrier and succeeded.
    assert_eq!(ack, Acknowledgement::Ack);
    assert_eq!(inner.executions(), 2);
    let row = ledger.fetch_inbox(CONSUMER, 9).await.unwrap().unwrap();
    assert!(row.is_succeeded());
}

#[tokio::test]
async fn direct_execute_returns_busy_error_for_held_barrier() {
    let (ledger, _dir) = ledger().await;
    let inner = TestConsumer::succeeding();
    let wrapped = IdempotentConsumer::new(
        CONSUMER,
        inner,
        Arc::clone(&ledger) as Arc<dyn LedgerProvider>,
    );

    let barrier = InboxEntry::new(CONSUMER, orders_header(5));
    ledger
        .try_enter_inbox(&barrier, "holder", UnixMillis::now(), Duration::from_secs(60))
        .await
        .unwrap();

    let header = orders_header(5);
    let ctx = surebus::ConsumeContext {
        queue: QUEUE,
        header: &header,
        redelivered: false,
        attempt: 1,
    };
    let decoded = surebus::Consumer::decode(&wrapped, surebus::Codec::Json, br#"{"id":1}"#).unwrap();
    let error = surebus::Consumer::execute(&wrapped, &ctx, decoded.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(error, ExecuteError::BarrierBusy { message_id: 5, .. }));
}

#[tokio::test]
async fn handler_chain_runs_all_handlers_under_one_barrier() {
    let (ledger, _dir) = ledger().await;
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE);

    let first = Arc::new(TestConsumer::succeeding());
    let second = Arc::new(TestConsumer::succeeding());
    let chain = HandlerChain::new(Arc::new(ChainInner(Arc::clone(&first))))
        .with_handler(Arc::new(ChainInner(Arc::clone(&second))));
    assert_eq!(chain.len(), 2);

    // Consumer identity derived from the bound queue.
    let wrapped = IdempotentConsumer::bound_to_queue(
        QUEUE,
        chain,
        Arc::clone(&ledger) as Arc<dyn LedgerProvider>,
    );
    assert_eq!(wrapped.consumer_name(), QUEUE);

    let registry = ConsumerRegistry::new().register(
        QUEUE,
        "OrderCreated",
        Arc::new(wrapped) as Arc<dyn surebus::Consumer>,
    );
    let pipeline = ConsumePipeline::new(Arc::new(broker.clone()), Arc::new(registry))
        .with_retry_factory(fast_policy(2));
    let options = ConsumeOptions::new(QUEUE);

    publish_to_queue(&broker, QUEUE, &orders_header(11)).await;
    let delivery = broker.poll(QUEUE, Duration::from_millis(50)).await.unwrap().unwrap();
    pipeline.handle_delivery(&options, delivery).await.unwrap();
    assert_eq!(first.executions(), 1);
    assert_eq!(second.executions(), 1);

    // Redelivery: the whole chain is skipped.
    publish_to_queue(&broker, QUEUE, &orders_header(11)).await;
    let delivery = broker.poll(QUEUE, Duration::from_millis(50)).await.unwrap().unwrap();
    let ack = pipeline.handle_delivery(&options, delivery).await.unwrap();
    assert_eq!(ack, Acknowledgement::Ack);
    assert_eq!(first.executions(), 1);
    assert_eq!(second.executions(), 1);

    let row = ledger.fetch_inbox(QUEUE, 11).await.unwrap().unwrap();
    assert!(row.is_succeeded());
}

#[tokio::test]
async fn expired_lock_lets_a_new_attempt_enter() {
    let (ledger, _dir) = ledger().await;
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE);
    let inner = Arc::new(TestConsumer::succeeding());

    // Zero lock timeout: a previous crashed attempt's lock never blocks.
    let wrapped = IdempotentConsumer::new(
        CONSUMER,
        ChainInner(Arc::clone(&inner)),
        Arc::clone(&ledger) as Arc<dyn LedgerProvider>,
    )
    .with_lock_timeout(Duration::ZERO);
    let registry = ConsumerRegistry::new().register(
        QUEUE,
        "OrderCreated",
        Arc::new(wrapped) as Arc<dyn surebus::Consumer>,
    );
    let pipeline = ConsumePipeline::new(Arc::new(broker.clone()), Arc::new(registry))
        .with_retry_factory(fast_policy(2));
    let options = ConsumeOptions::new(QUEUE);

    let barrier = InboxEntry::new(CONSUMER, orders_header(13));
    ledger
        .try_enter_inbox(&barrier, "crashed-attempt", UnixMillis::now(), Duration::from_secs(60))
        .await
        .unwrap();

    publish_to_queue(&broker, QUEUE, &orders_header(13)).await;
    let delivery = broker.poll(QUEUE, Duration::from_millis(50)).await.unwrap().unwrap();
    let ack = pipeline.handle_delivery(&options, delivery).await.unwrap();

    assert_eq!(ack, Acknowledgement::Ack);
    assert_eq!(inner.executions(), 1);
}
