//! Outbox ledger flow: register, lock, dispatch, retry, recovery, GC.
#![cfg(feature = "sqlite")]

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{orders_header, FlakyChannel};
use surebus::{
    BreakdownEvent, DispatchOutcome, InMemoryBroker, LedgerProvider, MessageStatus, OutboxEntry,
    OutboxPublisher, OutboxSweeper, RecordingBreakdown, RetryPolicy, SqliteLedger, UnixMillis,
};

async fn ledger() -> (Arc<SqliteLedger>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(SqliteLedger::new(dir.path().join("ledger.db")));
    ledger.ensure_schema().await.expect("schema");
    (ledger, dir)
}

fn orders_broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.bind("orders", "created", "orders-queue");
    broker
}

fn entry(message_id: i64) -> OutboxEntry {
    OutboxEntry::new(orders_header(message_id), br#"{"id":42}"#.to_vec())
}

/// Dispatch backoff that retries (nearly) immediately, for test speed.
fn immediate_backoff() -> RetryPolicy {
    RetryPolicy::new(20)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(1))
        .with_jitter(Duration::ZERO)
}

#[tokio::test]
async fn register_then_read_back_round_trips() {
    let (ledger, _dir) = ledger().await;
    let broker = orders_broker();
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::new(broker));

    publisher.register(entry(42)).await.unwrap();

    let row = ledger.fetch_outbox(42).await.unwrap().expect("row");
    assert_eq!(row.message_id, 42);
    assert_eq!(row.exchange, "orders");
    assert_eq!(row.routing_key, "created");
    assert_eq!(row.header.type_name, "OrderCreated");
    assert_eq!(row.header.message_id, 42);
    assert_eq!(row.status, MessageStatus::Pending);
}

#[tokio::test]
async fn dispatch_publishes_and_replay_is_rejected() {
    let (ledger, _dir) = ledger().await;
    let broker = orders_broker();
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::new(broker.clone()));

    // Registered → Pending.
    publisher.register(entry(42)).await.unwrap();
    assert_eq!(
        ledger.fetch_outbox(42).await.unwrap().unwrap().status,
        MessageStatus::Pending
    );

    // Dispatched → broker has it, row Succeeded.
    assert_eq!(publisher.dispatch(42).await.unwrap(), DispatchOutcome::Published);
    assert_eq!(broker.queue_len("orders-queue"), 1);
    assert_eq!(
        ledger.fetch_outbox(42).await.unwrap().unwrap().status,
        MessageStatus::Succeeded
    );

    // A replayed dispatch on the same row finds nothing to claim.
    assert_eq!(publisher.dispatch(42).await.unwrap(), DispatchOutcome::Skipped);
    assert_eq!(broker.queue_len("orders-queue"), 1);
}

#[tokio::test]
async fn concurrent_locks_are_mutually_exclusive() {
    let (ledger, _dir) = ledger().await;
    ledger.insert_outbox(&entry(7)).await.unwrap();

    let now = UnixMillis::now();
    let timeout = Duration::from_secs(60);
    let (a, b) = tokio::join!(
        ledger.try_lock_outbox(7, "lock-a", now, timeout),
        ledger.try_lock_outbox(7, "lock-b", now, timeout),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a ^ b, "exactly one of two concurrent claims must win");
}

#[tokio::test]
async fn failed_publish_marks_the_row_for_retry() {
    let (ledger, _dir) = ledger().await;
    let channel = Arc::new(FlakyChannel::new(orders_broker(), 1));
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::clone(&channel))
        .with_backoff(immediate_backoff());

    publisher.register(entry(1)).await.unwrap();
    assert_eq!(publisher.dispatch(1).await.unwrap(), DispatchOutcome::Failed);

    let row = ledger.fetch_outbox(1).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Failed);
    assert_eq!(row.retry_count, 1);
    assert!(row.next_retry_time.is_some());
    assert_eq!(row.last_error.as_deref(), Some("publish rejected: scripted broker outage"));
    assert_eq!(channel.broker().queue_len("orders-queue"), 0);

    // The outage is over; the retry succeeds once the backoff elapses.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(publisher.dispatch(1).await.unwrap(), DispatchOutcome::Published);
    assert_eq!(channel.broker().queue_len("orders-queue"), 1);
}

#[tokio::test]
async fn stored_error_text_is_length_capped() {
    let (ledger, _dir) = ledger().await;
    let channel = Arc::new(FlakyChannel::new(orders_broker(), 1));
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::clone(&channel))
        .with_backoff(immediate_backoff())
        .with_max_error_len(10);

    publisher.register(entry(1)).await.unwrap();
    publisher.dispatch(1).await.unwrap();

    let row = ledger.fetch_outbox(1).await.unwrap().unwrap();
    assert_eq!(row.last_error.as_deref(), Some("publish re"));
}

#[tokio::test]
async fn sweeper_drains_pending_and_failed_rows() {
    let (ledger, _dir) = ledger().await;
    let channel = Arc::new(FlakyChannel::new(orders_broker(), 1));
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::clone(&channel))
        .with_backoff(immediate_backoff());

    publisher.register(entry(1)).await.unwrap();
    publisher.register(entry(2)).await.unwrap();

    let sweeper = OutboxSweeper::new(publisher).with_batch_size(10);

    // First sweep: one publish fails (scripted), the other lands.
    let stats = sweeper.sweep_once().await.unwrap();
    assert_eq!(stats.claimed, 2);
    assert_eq!(stats.published, 1);
    assert_eq!(stats.failed, 1);

    // Second sweep: the failed row is due again and now succeeds.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let stats = sweeper.sweep_once().await.unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(channel.broker().queue_len("orders-queue"), 2);
}

#[tokio::test]
async fn sweeper_recovers_rows_from_a_crashed_dispatcher() {
    let (ledger, _dir) = ledger().await;
    let broker = orders_broker();
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::new(broker.clone()));

    publisher.register(entry(1)).await.unwrap();
    // A dispatcher claims the row and then "crashes" before publishing.
    let now = UnixMillis::now();
    assert!(ledger
        .try_lock_outbox(1, "crashed-owner", now, Duration::from_secs(60))
        .await
        .unwrap());

    // Zero lock timeout: the abandoned lock is immediately reclaimable.
    let sweeper = OutboxSweeper::new(publisher).with_lock_timeout(Duration::ZERO);
    let stats = sweeper.sweep_once().await.unwrap();

    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.published, 1);
    assert_eq!(
        ledger.fetch_outbox(1).await.unwrap().unwrap().status,
        MessageStatus::Succeeded
    );
    assert_eq!(broker.queue_len("orders-queue"), 1);
}

#[tokio::test]
async fn sweeper_purges_old_succeeded_rows_only() {
    let (ledger, _dir) = ledger().await;
    let broker = orders_broker();
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::new(broker));

    publisher.register(entry(1)).await.unwrap();
    publisher.register(entry(2)).await.unwrap();
    assert_eq!(publisher.dispatch(1).await.unwrap(), DispatchOutcome::Published);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let sweeper = OutboxSweeper::new(publisher)
        .with_batch_size(0) // no claiming this sweep, GC only
        .with_retention(Duration::ZERO);
    let stats = sweeper.sweep_once().await.unwrap();

    assert_eq!(stats.purged, 1);
    assert!(ledger.fetch_outbox(1).await.unwrap().is_none());
    assert!(ledger.fetch_outbox(2).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_sweeper_drains_in_the_background() {
    let (ledger, _dir) = ledger().await;
    let broker = orders_broker();
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::new(broker.clone()));

    for id in 1..=3 {
        publisher.register(entry(id)).await.unwrap();
    }

    let handle = OutboxSweeper::new(publisher)
        .with_poll_interval(Duration::from_millis(10))
        .spawn();

    for _ in 0..100 {
        if broker.queue_len("orders-queue") == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = handle.stop().await;

    assert_eq!(broker.queue_len("orders-queue"), 3);
    assert_eq!(stats.published, 3);
    assert!(stats.sweeps >= 1);
}

#[tokio::test]
async fn ledger_inconsistency_raises_the_alarm() {
    let (ledger, _dir) = ledger().await;
    let broker = orders_broker();
    let breakdown = Arc::new(RecordingBreakdown::new());
    let publisher = OutboxPublisher::new(Arc::clone(&ledger), Arc::new(broker))
        .with_breakdown(Arc::clone(&breakdown) as Arc<dyn surebus::Breakdown>);

    publisher.register(entry(1)).await.unwrap();

    // Claim the row ourselves, then deliver under a lock id the ledger
    // does not recognize: the publish lands, the success mark affects
    // zero rows.
    let now = UnixMillis::now();
    assert!(ledger
        .try_lock_outbox(1, "real-owner", now, Duration::from_secs(60))
        .await
        .unwrap());
    let row = ledger.fetch_outbox(1).await.unwrap().unwrap();
    let result = publisher.deliver(&row, "stale-owner").await;

    assert!(result.is_err());
    assert_eq!(
        breakdown.events(),
        vec![BreakdownEvent::LedgerInconsistency {
            message_id: 1,
            detail: "publish succeeded but success mark affected zero rows".to_string(),
        }]
    );
}
