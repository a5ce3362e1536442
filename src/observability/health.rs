//! Health and log-level HTTP server
//!
//! Serves the aggregated broker health report and a runtime log level
//! switch:
//!
//! - `GET /health` - `{"status":"UP"|"DOWN","details":{..}}`, 200 or 500
//! - `PATCH /log` - body `{"level":"debug"}`, 400 on an unknown level

use crate::error::{BridgeError, BridgeResult};
use crate::health::HealthCheckManager;
use crate::observability::logging::LogController;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    checks: Arc<HealthCheckManager>,
    log: LogController,
}

#[derive(Debug, Deserialize)]
struct LogLevelRequest {
    level: String,
}

#[derive(Debug, Serialize)]
struct LogLevelResponse {
    level: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl HealthServer {
    pub fn new(port: u16, checks: Arc<HealthCheckManager>, log: LogController) -> Self {
        Self { port, checks, log }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route table, usable with `warp::test` without binding a socket
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let checks = self.checks.clone();
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let checks = checks.clone();
                async move {
                    let report = checks.report().await;
                    let status = if report.is_up() {
                        StatusCode::OK
                    } else {
                        StatusCode::INTERNAL_SERVER_ERROR
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&report),
                        status,
                    ))
                }
            });

        let log = self.log.clone();
        let log_route = warp::path("log")
            .and(warp::path::end())
            .and(warp::patch())
            .and(warp::body::json())
            .and_then(move |request: LogLevelRequest| {
                let log = log.clone();
                async move {
                    let reply = match log.set_level(&request.level) {
                        Ok(level) => warp::reply::with_status(
                            warp::reply::json(&LogLevelResponse {
                                level: level.to_string().to_lowercase(),
                            }),
                            StatusCode::OK,
                        ),
                        Err(e) => warp::reply::with_status(
                            warp::reply::json(&ErrorResponse {
                                error: e.to_string(),
                            }),
                            StatusCode::BAD_REQUEST,
                        ),
                    };
                    Ok::<_, Infallible>(reply)
                }
            });

        health_route.or(log_route)
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> BridgeResult<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| BridgeError::internal(format!("Failed to bind {addr}: {e}")))?;

        tracing::info!("Start sub server at port {}", bound.port());
        server.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::health::HealthProbe;
    use crate::transport::{MemoryBroker, ReasonCode};
    use serde_json::Value;
    use std::time::Duration;
    use tracing::Level;

    async fn server(broker: Arc<MemoryBroker>) -> HealthServer {
        let mut checks = HealthCheckManager::new();
        checks.add_health_check(Box::new(HealthProbe::new(
            broker,
            BridgeConfig::test_config().broker.connection,
            Duration::from_millis(200),
        )));
        HealthServer::new(8089, Arc::new(checks), LogController::new(Level::INFO))
    }

    #[tokio::test]
    async fn test_health_up() {
        let routes = server(MemoryBroker::with_manager("QM1")).await.routes();

        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "UP");
        assert_eq!(body["details"]["ibmmq"]["status"], "UP");
    }

    #[tokio::test]
    async fn test_health_down() {
        let broker = MemoryBroker::with_manager("QM1");
        broker.fail_connect(ReasonCode::HOST_NOT_AVAILABLE).await;
        let routes = server(broker).await.routes();

        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "DOWN");
        assert!(body["details"]["ibmmq"]["error"]
            .as_str()
            .unwrap()
            .contains("2538"));
    }

    #[tokio::test]
    async fn test_patch_log_level() {
        let routes = server(MemoryBroker::new()).await.routes();

        let response = warp::test::request()
            .method("PATCH")
            .path("/log")
            .json(&serde_json::json!({"level": "debug"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["level"], "debug");

        let response = warp::test::request()
            .method("PATCH")
            .path("/log")
            .json(&serde_json::json!({"level": "chatty"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
