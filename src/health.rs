//! Health check system for production monitoring
//!
//! Provides the broker liveness probe, the [`HealthCheck`] trait it
//! implements, and the manager that aggregates checks into the report served
//! on `GET /health`.

use crate::config::{ConnectionConfig, DEFAULT_SERVICE_NAME};
use crate::error::TransportError;
use crate::transport::{BrokerDriver, TransportSession};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default probe deadline
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 4200;

/// Outcome of one health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResult {
    pub service_name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthResult {
    pub fn up(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            healthy: true,
            detail: None,
        }
    }

    pub fn down(service_name: &str, detail: impl Into<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check on this component
    async fn health_check(&self) -> HealthResult;

    /// Get the component name for reporting
    fn component_name(&self) -> &str;
}

/// Broker liveness probe: connect then disconnect, raced against a deadline
pub struct HealthProbe {
    session: TransportSession,
    service_name: String,
    timeout: Duration,
}

impl HealthProbe {
    /// A zero `timeout` disables the deadline
    pub fn new(driver: Arc<dyn BrokerDriver>, config: ConnectionConfig, timeout: Duration) -> Self {
        let service_name = if config.service_name.trim().is_empty() {
            DEFAULT_SERVICE_NAME.to_string()
        } else {
            config.service_name.clone()
        };
        Self {
            session: TransportSession::new(driver, config),
            service_name,
            timeout,
        }
    }

    pub fn with_default_timeout(driver: Arc<dyn BrokerDriver>, config: ConnectionConfig) -> Self {
        Self::new(
            driver,
            config,
            Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
        )
    }

    /// Stable identifier of the probed service
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one probe
    pub async fn check(&self) -> Result<HealthResult, TransportError> {
        let probe = async {
            let connection = self.session.connect().await?;
            self.session.release(connection, None).await;
            Ok::<_, TransportError>(HealthResult::up(&self.service_name))
        };

        if self.timeout.is_zero() {
            return probe.await;
        }

        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} health probe timed out after {}ms", self.service_name, timeout_ms);
                Err(TransportError::Timeout { timeout_ms })
            }
        }
    }

    /// Fold a probe outcome into a result, attaching the error as detail
    pub fn build(&self, outcome: Result<HealthResult, TransportError>) -> HealthResult {
        match outcome {
            Ok(result) => result,
            Err(e) => HealthResult::down(&self.service_name, e.to_string()),
        }
    }
}

#[async_trait]
impl HealthCheck for HealthProbe {
    async fn health_check(&self) -> HealthResult {
        let result = self.build(self.check().await);
        debug!(
            "{} health check: healthy={}",
            self.service_name, result.healthy
        );
        result
    }

    fn component_name(&self) -> &str {
        &self.service_name
    }
}

/// Status of one component in the aggregated report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated report served on `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub details: BTreeMap<String, ComponentStatus>,
}

impl HealthReport {
    pub fn is_up(&self) -> bool {
        self.status == "UP"
    }
}

/// Aggregated health check manager
#[derive(Default)]
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a health check to the manager
    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    /// Run all health checks and return their results
    pub async fn run_health_checks(&self) -> Vec<HealthResult> {
        let mut results = Vec::new();
        for health_check in &self.health_checks {
            results.push(health_check.health_check().await);
        }
        results
    }

    /// Overall health: every component must be healthy
    pub async fn calculate_overall_health(&self) -> bool {
        let results = self.run_health_checks().await;
        if results.is_empty() {
            warn!("No health checks configured - assuming healthy");
            return true;
        }
        results.iter().all(|r| r.healthy)
    }

    /// Run all checks and shape the results as a report
    pub async fn report(&self) -> HealthReport {
        let results = self.run_health_checks().await;
        let overall = results.iter().all(|r| r.healthy);

        let details = results
            .into_iter()
            .map(|r| {
                let status = ComponentStatus {
                    status: if r.healthy { "UP" } else { "DOWN" },
                    error: r.detail.filter(|_| !r.healthy),
                };
                (r.service_name, status)
            })
            .collect();

        HealthReport {
            status: if overall { "UP" } else { "DOWN" },
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::transport::{MemoryBroker, ReasonCode};

    fn probe(broker: &Arc<MemoryBroker>, timeout: Duration) -> HealthProbe {
        HealthProbe::new(
            broker.clone(),
            BridgeConfig::test_config().broker.connection,
            timeout,
        )
    }

    #[tokio::test]
    async fn test_probe_connects_and_disconnects() {
        let broker = MemoryBroker::with_manager("QM1");
        let result = probe(&broker, Duration::from_millis(100)).check().await.unwrap();

        assert_eq!(result, HealthResult::up("ibmmq"));
        let stats = broker.stats().await;
        assert_eq!(stats.connect_calls, 1);
        assert_eq!(stats.disconnect_calls, 1);
        assert_eq!(stats.open_calls + stats.subscribe_calls, 0);
    }

    #[tokio::test]
    async fn test_empty_service_name_falls_back() {
        let mut config = BridgeConfig::test_config().broker.connection;
        config.service_name = String::new();
        let probe = HealthProbe::with_default_timeout(MemoryBroker::new(), config);
        assert_eq!(probe.service_name(), "ibmmq");
        assert_eq!(probe.timeout(), Duration::from_millis(4200));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let broker = MemoryBroker::with_manager("QM1");
        broker.fail_connect(ReasonCode::Q_MGR_NOT_AVAILABLE).await;
        let probe = probe(&broker, Duration::from_millis(100));

        let err = probe.check().await.unwrap_err();
        assert_eq!(err.reason(), Some(ReasonCode::Q_MGR_NOT_AVAILABLE));

        let result = probe.health_check().await;
        assert!(!result.healthy);
        assert!(result.detail.unwrap().contains("2059"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_disables_deadline() {
        let broker = MemoryBroker::with_manager("QM1");
        broker.delay_connect(Duration::from_secs(60)).await;

        let result = probe(&broker, Duration::ZERO).check().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_report_shape() {
        let healthy = MemoryBroker::with_manager("QM1");
        let broken = MemoryBroker::with_manager("QM1");
        broken.fail_connect(ReasonCode::HOST_NOT_AVAILABLE).await;

        let mut second = BridgeConfig::test_config().broker.connection;
        second.service_name = "backup-mq".to_string();

        let mut manager = HealthCheckManager::new();
        manager.add_health_check(Box::new(probe(&healthy, Duration::from_millis(100))));
        manager.add_health_check(Box::new(HealthProbe::new(
            broken.clone(),
            second,
            Duration::from_millis(100),
        )));

        let report = manager.report().await;
        assert!(!report.is_up());
        assert_eq!(report.details["ibmmq"].status, "UP");
        assert_eq!(report.details["ibmmq"].error, None);
        assert_eq!(report.details["backup-mq"].status, "DOWN");
        assert!(report.details["backup-mq"].error.is_some());
        assert!(!manager.calculate_overall_health().await);
    }

    #[tokio::test]
    async fn test_empty_manager_is_healthy() {
        let manager = HealthCheckManager::new();
        assert!(manager.calculate_overall_health().await);
        assert!(manager.report().await.is_up());
    }
}
