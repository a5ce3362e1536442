//! Producer publish tests against the in-memory broker

use futures::future::join_all;
use mqbridge::config::BridgeConfig;
use mqbridge::consumer::Consumer;
use mqbridge::error::{PublishStage, TransportError};
use mqbridge::producer::Producer;
use mqbridge::testing::{capture_logs, RecordingHandler};
use mqbridge::transport::{BrokerCall, DestinationKind, MemoryBroker, ReasonCode};
use serde::ser::{Error as _, Serialize, Serializer};
use serde_json::json;
use std::sync::Arc;
use tracing::Level;

fn config() -> BridgeConfig {
    BridgeConfig::from_toml_str(
        r#"
[broker]
connection_name = "localhost(1414)"
manager_name = "QM1"
channel_name = "DEV.APP.SVRCONN"
user = "app"
password = "passw0rd"
poll_interval_ms = 100
topic_name = "dev/"
queue_name = "DEV.QUEUE.1"
"#,
    )
    .unwrap()
}

fn producer(broker: &Arc<MemoryBroker>, kind: DestinationKind) -> Producer {
    Producer::new(broker.clone(), config().broker, kind)
}

struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("cyclic structure"))
    }
}

#[tokio::test]
async fn test_publish_resolves_after_put() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.define_queue("DEV.QUEUE.1").await;

    producer(&broker, DestinationKind::Queue)
        .publish(&json!({"id": "1"}))
        .await
        .unwrap();

    // Message is already on the queue when the call returns
    assert_eq!(broker.queue_depth("DEV.QUEUE.1").await, 1);
    let published = broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "DEV.QUEUE.1");
    assert_eq!(&published[0].1[..], br#"{"id":"1"}"#);
}

#[tokio::test]
async fn test_put_failure_rejects_with_reason() {
    let (logs, _guard) = capture_logs();
    let broker = MemoryBroker::with_manager("QM1");
    broker.define_queue("DEV.QUEUE.1").await;
    broker.fail_put(ReasonCode::Q_FULL).await;

    let err = producer(&broker, DestinationKind::Queue)
        .publish(&json!({"id": "1"}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransportError::Publish {
            stage: PublishStage::Put,
            reason: ReasonCode::Q_FULL,
            ..
        }
    ));
    assert!(err.to_string().contains("2053"));
    assert!(logs.contains(Level::ERROR, "2053"));

    // Handles are released even though the put failed
    let stats = broker.stats().await;
    assert_eq!(stats.close_calls, 1);
    assert_eq!(stats.disconnect_calls, 1);
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.open_destinations, 0);
}

#[tokio::test]
async fn test_close_failure_does_not_fail_publish() {
    let (logs, _guard) = capture_logs();
    let broker = MemoryBroker::with_manager("QM1");
    broker.define_queue("DEV.QUEUE.1").await;
    broker.fail_close(ReasonCode::CONNECTION_BROKEN).await;

    producer(&broker, DestinationKind::Queue)
        .publish(&json!({"id": "1"}))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("DEV.QUEUE.1").await, 1);
    let stats = broker.stats().await;
    assert_eq!(stats.disconnect_calls, 1);
    assert_eq!(stats.open_connections, 0);
    assert!(logs.contains(Level::ERROR, "MQCLOSE"));
}

#[tokio::test]
async fn test_unserializable_payload_rejects_before_connect() {
    let broker = MemoryBroker::with_manager("QM1");

    let err = producer(&broker, DestinationKind::Topic)
        .publish(&Unserializable)
        .await
        .unwrap_err();

    match err {
        TransportError::Serialization { message } => assert!(message.contains("cyclic")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(broker.calls().await.is_empty());
}

#[tokio::test]
async fn test_every_publish_uses_its_own_connection() {
    let broker = MemoryBroker::with_manager("QM1");
    let producer = producer(&broker, DestinationKind::Topic);

    for i in 0..3 {
        producer.publish(&json!({"n": i})).await.unwrap();
    }

    let stats = broker.stats().await;
    assert_eq!(stats.connect_calls, 3);
    assert_eq!(stats.disconnect_calls, 3);
    assert_eq!(stats.put_calls, 3);
    assert_eq!(stats.open_connections, 0);
}

#[tokio::test]
async fn test_concurrent_publishes_do_not_share_handles() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.define_queue("DEV.QUEUE.1").await;
    let producer = producer(&broker, DestinationKind::Queue);
    let payloads: Vec<_> = (0..5).map(|n| json!({"n": n})).collect();

    let results = join_all(payloads.iter().map(|p| producer.publish(p))).await;
    assert!(results.iter().all(Result::is_ok));

    assert_eq!(broker.queue_depth("DEV.QUEUE.1").await, 5);
    let stats = broker.stats().await;
    assert_eq!(stats.connect_calls, 5);
    assert_eq!(stats.open_calls, 5);
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.open_destinations, 0);
}

#[tokio::test]
async fn test_publish_to_named_topic_reaches_subscriber() {
    let broker = MemoryBroker::with_manager("QM1");
    let mut config = config();
    config.broker.topic_name = Some("orders/created".to_string());

    let handler = RecordingHandler::new();
    let consumer = Consumer::topic(broker.clone(), config.broker, true).unwrap();
    let handle = consumer.subscribe(handler.clone());
    handle
        .wait_for_state(|s| *s == mqbridge::consumer::ConsumerState::Polling)
        .await;

    producer(&broker, DestinationKind::Topic)
        .send_to("orders/created", &json!({"order": 7}))
        .await
        .unwrap();

    handler.wait_for(1).await;
    assert_eq!(handler.payloads().await, vec![r#"{"order":7}"#.to_string()]);
    handle.stop().await;
}

#[tokio::test]
async fn test_unknown_queue_fails_at_open() {
    let broker = MemoryBroker::with_manager("QM1");

    let err = producer(&broker, DestinationKind::Queue)
        .put_to("NO.SUCH.QUEUE", &json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransportError::Publish {
            stage: PublishStage::Open,
            reason: ReasonCode::UNKNOWN_OBJECT_NAME,
            ..
        }
    ));
    assert!(err.to_string().contains("2085"));
    assert_eq!(broker.stats().await.open_connections, 0);
}

#[tokio::test]
async fn test_bad_credentials_fail_at_connect() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.require_credentials("app", "other-secret").await;

    let err = producer(&broker, DestinationKind::Topic)
        .write(&json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransportError::Publish {
            stage: PublishStage::Connect,
            reason: ReasonCode::NOT_AUTHORIZED,
            ..
        }
    ));
    assert_eq!(broker.calls().await, vec![BrokerCall::Connect]);
}
