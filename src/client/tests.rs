use super::connection::{Connection, ConnectionOptions, Subscription};
use crate::config::Settings;
use crate::delivery::handler::{Completion, Handler, handler_fn};
use crate::delivery::message::{Headers, Message, RETRY_COUNT_HEADER, RETRY_DELAY_HEADER};
use crate::transport::Transport;
use crate::transport::memory::MemoryTransport;
use crate::utils::error::{ConnectionError, TransportError};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

async fn connect(settings: Settings) -> (Connection, MemoryTransport) {
    let transport = MemoryTransport::new();
    let connection = Connection::open_with(
        Arc::new(transport.clone()),
        ConnectionOptions::new(settings),
    )
    .await
    .unwrap();
    (connection, transport)
}

fn counting_handler(calls: Arc<AtomicUsize>, fail: bool) -> impl Handler {
    handler_fn(move |_message: Message, done: Completion| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                done.fail("always fails");
            } else {
                done.ok();
            }
        }
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not met in time");
}

fn retry_headers(retry_count: u64, delay_ms: u64) -> Headers {
    json!({ RETRY_COUNT_HEADER: retry_count, RETRY_DELAY_HEADER: delay_ms })
        .as_object()
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn test_open_declares_exchange_pair() {
    let (connection, _transport) = connect(Settings::default()).await;
    assert_eq!(connection.exchanges().origin.name(), "retrysub");
    assert_eq!(connection.exchanges().dead_letter.name(), "retrysub.dead");
}

#[test]
fn test_options_from_settings_carry_no_logger() {
    let mut settings = Settings::default();
    settings.connection.name = "orders".to_string();
    let options = ConnectionOptions::from(settings);
    assert_eq!(options.settings.connection.name, "orders");
    assert!(options.logger.is_none());
}

#[tokio::test]
async fn test_open_on_closed_transport_fails() {
    let transport = MemoryTransport::new();
    transport.close().await.unwrap();

    let result = Connection::open_with(Arc::new(transport), ConnectionOptions::default()).await;
    assert!(matches!(result, Err(ConnectionError::Topology { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_successful_handler_is_acked_once() {
    let (connection, transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    connection
        .subscribe(Subscription::new("r1", "consumer", counting_handler(calls.clone(), false)))
        .await
        .unwrap();

    connection.publish("r1", &json!({"a": 1}), None).await.unwrap();

    wait_until(|| transport.stats().acknowledged == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = transport.stats();
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.published, 1);
    assert_eq!(stats.duplicate_acks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_handler_retries_then_dead_letters() {
    let (connection, transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let registration = connection
        .subscribe(Subscription::new("r1", "consumer", counting_handler(calls.clone(), true)))
        .await
        .unwrap();
    assert_eq!(registration.dead_letter_queue().unwrap().name, "dead.consumer");

    connection
        .publish("r1", &json!({"a": 1}), Some(retry_headers(1, 50)))
        .await
        .unwrap();

    wait_until(|| transport.backlog("dead.consumer").len() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let dead = transport.backlog("dead.consumer");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].routing_key, "r1");
    assert_eq!(dead[0].body, "{\"a\":1}");
    assert_eq!(dead[0].headers[RETRY_COUNT_HEADER], json!(0));

    // original publish plus one retry
    assert_eq!(transport.published_to("retrysub").len(), 2);
    assert_eq!(transport.published_to("retrysub.dead").len(), 1);
    assert_eq!(transport.stats().acknowledged, 2);
}

#[tokio::test(start_paused = true)]
async fn test_handler_invoked_retry_count_plus_one_times() {
    let (connection, transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    connection
        .subscribe(Subscription::new("r3", "consumer", counting_handler(calls.clone(), true)))
        .await
        .unwrap();

    connection
        .publish("r3", &json!({"n": 3}), Some(retry_headers(3, 10)))
        .await
        .unwrap();

    wait_until(|| transport.published_to("retrysub.dead").len() == 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(transport.published_to("retrysub.dead").len(), 1);
    assert_eq!(transport.stats().acknowledged, 4);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_handler_follows_retry_path() {
    let (connection, transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        handler_fn(move |_message: Message, done: Completion| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                done.ok();
            }
        })
    };
    connection
        .subscribe(
            Subscription::new("slow", "consumer", handler).with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    connection
        .publish("slow", &json!({}), Some(retry_headers(0, 10)))
        .await
        .unwrap();

    wait_until(|| transport.backlog("dead.consumer").len() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = transport.stats();
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.duplicate_acks, 0);
    assert_eq!(transport.published_to("retrysub.dead").len(), 1);
}

#[tokio::test]
async fn test_subscribe_requires_routing_key_and_consumer() {
    let (connection, _transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let missing_key = connection
        .subscribe(Subscription::new("", "consumer", counting_handler(calls.clone(), false)))
        .await;
    assert!(matches!(missing_key, Err(TransportError::InvalidArgument(_))));

    let missing_consumer = connection
        .subscribe(Subscription::new("r1", "", counting_handler(calls, false)))
        .await;
    assert!(matches!(missing_consumer, Err(TransportError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_dead_letter_queue_can_be_disabled() {
    let mut settings = Settings::default();
    settings.delivery.dead_letter_queues = false;
    let (connection, _transport) = connect(settings).await;

    let registration = connection
        .subscribe(Subscription::new(
            "r1",
            "consumer",
            counting_handler(Arc::new(AtomicUsize::new(0)), false),
        ))
        .await
        .unwrap();
    assert!(registration.dead_letter_queue().is_none());
    assert_eq!(registration.queue().routing_key, "r1");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_registration_stops_consuming() {
    let (connection, transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let registration = connection
        .subscribe(Subscription::new("r1", "consumer", counting_handler(calls.clone(), false)))
        .await
        .unwrap();

    registration.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    connection.publish("r1", &json!({}), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(transport.backlog("consumer").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_requeues_deliveries_not_yet_handled() {
    let (connection, transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let registration = connection
        .subscribe(Subscription::new("r1", "consumer", counting_handler(calls.clone(), false)))
        .await
        .unwrap();

    // Both are handed to the consumer before it gets a chance to run.
    connection.publish("r1", &json!({"n": 1}), None).await.unwrap();
    connection.publish("r1", &json!({"n": 2}), None).await.unwrap();
    registration.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let stats = transport.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.acknowledged, 0);
    assert_eq!(transport.backlog("consumer").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_subscription_timeout_does_not_fail_fast_handlers() {
    let (connection, transport) = connect(Settings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    connection
        .subscribe(
            Subscription::new("r1", "consumer", counting_handler(calls.clone(), false))
                .with_timeout(Duration::ZERO),
        )
        .await
        .unwrap();

    connection
        .publish("r1", &json!({}), Some(retry_headers(1, 10)))
        .await
        .unwrap();
    wait_until(|| transport.stats().acknowledged == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.stats().published, 1);
    assert!(transport.backlog("dead.consumer").is_empty());
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    let (connection, transport) = connect(Settings::default()).await;
    connection.close().await.unwrap();
    assert!(transport.is_closed());

    let result = connection.publish("r1", &json!({}), None).await;
    let err = result.unwrap_err();
    assert_eq!(err.routing_key, "r1");
    assert!(matches!(err.source, TransportError::Closed));
}

#[tokio::test]
async fn test_publish_requires_routing_key() {
    let (connection, transport) = connect(Settings::default()).await;
    let result = connection.publish("", &json!({}), None).await;
    assert!(result.is_err());
    assert!(transport.published().is_empty());
}
