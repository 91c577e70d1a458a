//! Delivery guarantees of the outbox dispatcher against the in-memory store.
//!
//! Every message must end up delivered at least once or quarantined, no matter
//! how handlers fail or how many dispatchers compete for the same outbox.

use std::sync::Arc;
use std::time::Duration;

use payrecon::{
    BatchSize, Concurrency, DispatcherConfig, HandlerError, HandlerRegistry, MaxRetries,
    MessageId, OutboxDispatcher, OutboxError, OutboxStatus, OutboxStore, RetryPolicy, WorkerId,
};
use payrecon_memory::InMemoryOutboxStore;
use payrecon_testing::chaos::{ChaosConfig, ChaosStoreExt};
use payrecon_testing::fixtures::{message_type, outbox_message};
use payrecon_testing::{
    FailNTimesHandler, FailingHandler, PanickingHandler, RecordingHandler, SlowHandler,
};
use tokio_util::sync::CancellationToken;

const PAYMENT_CAPTURED: &str = "PaymentCaptured";

fn config(max_retries: u32) -> DispatcherConfig {
    DispatcherConfig {
        batch_size: BatchSize::try_new(10).unwrap(),
        concurrency: Concurrency::try_new(4).unwrap(),
        lease: Duration::from_secs(5),
        handler_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(5),
        max_idle_backoff: Duration::from_millis(20),
        retry: RetryPolicy {
            max_retries: MaxRetries::try_new(max_retries).unwrap(),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        },
    }
}

fn worker(name: &str) -> WorkerId {
    WorkerId::unique(name).unwrap()
}

fn registry_with<H>(handler: H) -> HandlerRegistry
where
    H: payrecon::OutboxHandler + 'static,
{
    HandlerRegistry::new().with_handler(message_type(PAYMENT_CAPTURED), handler)
}

async fn enqueue_payment<S: OutboxStore>(store: &S, order: u32) -> MessageId {
    store
        .enqueue(outbox_message(
            PAYMENT_CAPTURED,
            serde_json::json!({ "order": order }),
        ))
        .await
        .unwrap()
}

async fn status_of<S: OutboxStore>(store: &S, id: MessageId) -> payrecon::OutboxMessage {
    store.get(id).await.unwrap().expect("message exists")
}

#[tokio::test]
async fn successful_delivery_marks_message_delivered() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let recorder = RecordingHandler::new();
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(recorder.clone()),
        config(5),
        worker("dispatcher"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;

    let stats = dispatcher.dispatch_once().await.unwrap();

    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(recorder.deliveries(), vec![id]);
    let message = status_of(store.as_ref(), id).await;
    assert_eq!(message.status, OutboxStatus::Delivered);
    assert!(message.processed_at.is_some());
    assert_eq!(message.retry_count, 0);
}

#[tokio::test]
async fn transient_failures_are_retried_until_delivered() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let handler = FailNTimesHandler::new(3);
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(handler.clone()),
        config(5),
        worker("dispatcher"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;

    for _ in 0..10 {
        let _ = dispatcher.dispatch_once().await.unwrap();
        if status_of(store.as_ref(), id).await.status == OutboxStatus::Delivered {
            break;
        }
    }

    let message = status_of(store.as_ref(), id).await;
    assert_eq!(message.status, OutboxStatus::Delivered);
    assert_eq!(message.retry_count, 3);
    assert_eq!(handler.attempts_for(id), 4);
    assert_eq!(handler.delivered().count_for(id), 1);
}

#[tokio::test]
async fn retries_stop_at_the_cap_and_quarantine_the_message() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let handler = FailingHandler::new(HandlerError::retryable("merchant API returned 503"));
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(handler.clone()),
        config(2),
        worker("dispatcher"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;

    let mut exhausted = 0;
    for _ in 0..10 {
        exhausted += dispatcher.dispatch_once().await.unwrap().exhausted;
    }

    let message = status_of(store.as_ref(), id).await;
    assert_eq!(message.status, OutboxStatus::Failed);
    assert_eq!(message.retry_count, 3);
    assert_eq!(handler.calls(), 3);
    assert_eq!(exhausted, 1);
    assert!(message
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("503")));

    let failed = store.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
}

#[tokio::test]
async fn fatal_failures_are_quarantined_immediately() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let handler = FailingHandler::new(HandlerError::fatal("payload references unknown seller"));
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(handler.clone()),
        config(5),
        worker("dispatcher"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;

    let stats = dispatcher.dispatch_once().await.unwrap();

    assert_eq!(stats.exhausted, 1);
    assert_eq!(handler.calls(), 1);
    let message = status_of(store.as_ref(), id).await;
    assert_eq!(message.status, OutboxStatus::Failed);
    assert_eq!(message.retry_count, 1);
}

#[tokio::test]
async fn requeued_message_is_delivered_again() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let failing = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(FailingHandler::new(HandlerError::fatal("bad config"))),
        config(5),
        worker("failing"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;
    let _ = failing.dispatch_once().await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await.status, OutboxStatus::Failed);

    store.requeue(id).await.unwrap();
    let recorder = RecordingHandler::new();
    let fixed = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(recorder.clone()),
        config(5),
        worker("fixed"),
    );
    let stats = fixed.dispatch_once().await.unwrap();

    assert_eq!(stats.delivered, 1);
    assert_eq!(recorder.count_for(id), 1);
    assert_eq!(status_of(store.as_ref(), id).await.status, OutboxStatus::Delivered);
}

#[tokio::test]
async fn panicking_handler_counts_as_retryable_failure() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(PanickingHandler),
        config(5),
        worker("dispatcher"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;

    let stats = dispatcher.dispatch_once().await.unwrap();

    assert_eq!(stats.retried, 1);
    let message = status_of(store.as_ref(), id).await;
    assert_eq!(message.status, OutboxStatus::Pending);
    assert_eq!(message.retry_count, 1);
    assert!(message
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("panicked")));
}

#[tokio::test]
async fn slow_handler_times_out_and_is_retried() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let handler = SlowHandler::new(Duration::from_secs(2));
    let mut config = config(5);
    config.handler_timeout = Duration::from_millis(50);
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(handler.clone()),
        config,
        worker("dispatcher"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;

    let stats = dispatcher.dispatch_once().await.unwrap();

    assert_eq!(stats.retried, 1);
    assert!(handler.delivered().deliveries().is_empty());
    let message = status_of(store.as_ref(), id).await;
    assert_eq!(message.status, OutboxStatus::Pending);
    assert!(message
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("timed out")));
}

#[tokio::test]
async fn message_without_handler_is_retried_not_dropped() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        HandlerRegistry::new(),
        config(5),
        worker("dispatcher"),
    );
    let id = enqueue_payment(store.as_ref(), 1).await;

    let stats = dispatcher.dispatch_once().await.unwrap();

    assert_eq!(stats.retried, 1);
    let message = status_of(store.as_ref(), id).await;
    assert_eq!(message.status, OutboxStatus::Pending);
    assert!(message
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("no handler registered")));
}

#[tokio::test]
async fn expired_lease_of_crashed_dispatcher_is_reclaimed() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let id = enqueue_payment(store.as_ref(), 1).await;

    // A dispatcher claims the message and dies before settling it.
    let crashed = worker("crashed");
    let claimed = store
        .claim_batch(10, &crashed, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    tokio::time::sleep(Duration::from_millis(40)).await;

    let recorder = RecordingHandler::new();
    let survivor = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(recorder.clone()),
        config(5),
        worker("survivor"),
    );
    let stats = survivor.dispatch_once().await.unwrap();

    assert_eq!(stats.delivered, 1);
    assert_eq!(recorder.count_for(id), 1);
    assert!(matches!(
        store.mark_delivered(id, &crashed).await,
        Err(OutboxError::ClaimLost { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_dispatchers_deliver_each_message_once() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let recorder = RecordingHandler::new();
    let mut ids = Vec::new();
    for order in 0..60 {
        ids.push(enqueue_payment(store.as_ref(), order).await);
    }

    let mut tasks = Vec::new();
    for index in 0..4 {
        let dispatcher = OutboxDispatcher::new(
            Arc::clone(&store),
            registry_with(recorder.clone()),
            config(5),
            worker(&format!("dispatcher-{index}")),
        );
        tasks.push(tokio::spawn(async move {
            loop {
                let stats = dispatcher.dispatch_once().await.unwrap();
                if stats.claimed == 0 {
                    break;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for id in ids {
        assert_eq!(recorder.count_for(id), 1, "message {id} delivered more than once");
        assert_eq!(status_of(store.as_ref(), id).await.status, OutboxStatus::Delivered);
    }
}

#[tokio::test]
async fn partitioned_messages_are_delivered_in_enqueue_order() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let recorder = RecordingHandler::new();
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(recorder.clone()),
        config(5),
        worker("dispatcher"),
    );
    let key = payrecon_testing::fixtures::partition_key("order-42");
    let mut ids = Vec::new();
    for step in 0..3 {
        let message = outbox_message(PAYMENT_CAPTURED, serde_json::json!({ "step": step }))
            .with_partition_key(key.clone());
        ids.push(store.enqueue(message).await.unwrap());
    }

    for _ in 0..3 {
        let stats = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(stats.claimed, 1, "one message per key and batch");
    }

    assert_eq!(recorder.deliveries(), ids);
}

#[tokio::test]
async fn dispatch_survives_lost_claims_and_store_faults() {
    let store = Arc::new(
        InMemoryOutboxStore::new().with_chaos(
            ChaosConfig::deterministic()
                .with_failure_probability(0.1)
                .with_claim_lost_probability(0.3),
        ),
    );
    let recorder = RecordingHandler::new();
    let mut config = config(5);
    config.lease = Duration::from_millis(30);
    config.handler_timeout = Duration::from_millis(20);
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(recorder.clone()),
        config,
        worker("dispatcher"),
    );

    let mut ids = Vec::new();
    for order in 0..20 {
        let message = outbox_message(PAYMENT_CAPTURED, serde_json::json!({ "order": order }));
        ids.push(store.inner().enqueue(message).await.unwrap());
    }

    let inner = store.inner();
    let all_delivered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let _ = dispatcher.dispatch_once().await;
            let mut pending = 0;
            for id in &ids {
                if status_of(inner, *id).await.status != OutboxStatus::Delivered {
                    pending += 1;
                }
            }
            if pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(35)).await;
        }
    })
    .await;

    assert!(all_delivered.is_ok(), "every message is eventually delivered");
    for id in ids {
        assert!(recorder.count_for(id) >= 1);
    }
}

#[tokio::test]
async fn run_loop_drains_outbox_and_stops_on_shutdown() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let recorder = RecordingHandler::new();
    let dispatcher = Arc::new(OutboxDispatcher::new(
        Arc::clone(&store),
        registry_with(recorder.clone()),
        config(5),
        worker("dispatcher"),
    ));
    let shutdown = CancellationToken::new();
    let running = {
        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };

    let id = enqueue_payment(store.as_ref(), 1).await;
    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.count_for(id) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(delivered.is_ok());

    shutdown.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(1), running).await;
    assert!(stopped.is_ok(), "run loop stops after cancellation");
}
