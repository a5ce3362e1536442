//! Health probe deadline and reporting tests

use mqbridge::config::BridgeConfig;
use mqbridge::error::TransportError;
use mqbridge::health::{HealthCheck, HealthCheckManager, HealthProbe, HealthResult};
use mqbridge::transport::{MemoryBroker, ReasonCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready_err, task};

fn probe(broker: &Arc<MemoryBroker>, timeout: Duration) -> HealthProbe {
    let config = BridgeConfig::from_toml_str(
        r#"
[broker]
connection_name = "localhost(1414)"
manager_name = "QM1"
channel_name = "DEV.APP.SVRCONN"
user = "app"
topic_name = "dev/"
"#,
    )
    .unwrap();
    HealthProbe::new(broker.clone(), config.broker.connection, timeout)
}

#[tokio::test(start_paused = true)]
async fn test_stalled_connect_times_out_at_deadline() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.stall_connect().await;
    let probe = probe(&broker, Duration::from_millis(4200));

    let start = Instant::now();
    let err = probe.check().await.unwrap_err();

    assert_eq!(start.elapsed(), Duration::from_millis(4200));
    assert_eq!(err, TransportError::Timeout { timeout_ms: 4200 });
    assert_eq!(err.to_string(), "Timed out in: 4200 milliseconds");
}

#[tokio::test(start_paused = true)]
async fn test_probe_pending_until_last_millisecond() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.stall_connect().await;
    let probe = probe(&broker, Duration::from_millis(4200));

    let mut check = task::spawn(probe.check());
    assert_pending!(check.poll());

    tokio::time::advance(Duration::from_millis(4199)).await;
    assert_pending!(check.poll());

    tokio::time::advance(Duration::from_millis(1)).await;
    let err = assert_ready_err!(check.poll());
    assert_eq!(err, TransportError::Timeout { timeout_ms: 4200 });
}

#[tokio::test(start_paused = true)]
async fn test_custom_deadline_is_honoured() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.stall_connect().await;
    let probe = probe(&broker, Duration::from_millis(750));

    let start = Instant::now();
    let result = probe.health_check().await;

    assert_eq!(start.elapsed(), Duration::from_millis(750));
    assert!(!result.healthy);
    assert_eq!(
        result.detail.as_deref(),
        Some("Timed out in: 750 milliseconds")
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_connect_within_deadline_is_healthy() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.delay_connect(Duration::from_millis(4000)).await;

    let result = probe(&broker, Duration::from_millis(4200))
        .check()
        .await
        .unwrap();
    assert_eq!(result, HealthResult::up("ibmmq"));
    assert_eq!(broker.stats().await.open_connections, 0);
}

#[tokio::test]
async fn test_connect_failure_surfaces_reason() {
    let broker = MemoryBroker::with_manager("QM1");
    broker.fail_connect(ReasonCode::HOST_NOT_AVAILABLE).await;

    let err = probe(&broker, Duration::from_millis(4200))
        .check()
        .await
        .unwrap_err();
    assert_eq!(err.reason(), Some(ReasonCode::HOST_NOT_AVAILABLE));
    assert!(err.to_string().contains("2538"));
}

#[tokio::test]
async fn test_wrong_manager_is_unhealthy() {
    let broker = MemoryBroker::with_manager("QM2");
    let probe = probe(&broker, Duration::from_millis(4200));

    let result = probe.health_check().await;
    assert!(!result.healthy);
    assert_eq!(result.service_name, "ibmmq");
    assert!(result.detail.unwrap().contains("2058"));
}

#[tokio::test]
async fn test_manager_reports_probe() {
    let broker = MemoryBroker::with_manager("QM1");
    let mut manager = HealthCheckManager::new();
    manager.add_health_check(Box::new(probe(&broker, Duration::from_millis(4200))));

    let report = manager.report().await;
    assert!(report.is_up());

    let body = serde_json::to_value(&report).unwrap();
    assert_eq!(
        body,
        serde_json::json!({"status": "UP", "details": {"ibmmq": {"status": "UP"}}})
    );
}
