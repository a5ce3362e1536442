//! mqbridge - broker transport client
//!
//! Connects to a message broker, consumes from a topic or queue by polling and
//! hands each message to a processing pipeline, publishes JSON documents to
//! topics or queues, and probes broker liveness for health reporting.
//!
//! # Overview
//!
//! - [`transport`] - the [`transport::BrokerDriver`] seam, reason codes, the
//!   in-memory broker and the MQTT driver
//! - [`consumer`] - polling consumer with an explicit stop handle
//! - [`producer`] - one-shot publisher, one connection per publish
//! - [`health`] - liveness probe and aggregated health report
//! - [`observability`] - structured logging and the `/health` + `/log` server
//!
//! # Quick Start
//!
//! ```rust
//! use mqbridge::config::BridgeConfig;
//! use mqbridge::consumer::Consumer;
//! use mqbridge::producer::Producer;
//! use mqbridge::testing::RecordingHandler;
//! use mqbridge::transport::MemoryBroker;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::from_toml_str(
//!     r#"
//! [broker]
//! connection_name = "localhost(1414)"
//! manager_name = "QM1"
//! channel_name = "DEV.APP.SVRCONN"
//! user = "app"
//! poll_interval_ms = 50
//! queue_name = "DEV.QUEUE.1"
//!
//! [consumer]
//! kind = "queue"
//! "#,
//! )?;
//!
//! let broker = MemoryBroker::with_manager("QM1");
//! broker.define_queue("DEV.QUEUE.1").await;
//!
//! Producer::queue(broker.clone(), config.broker.clone())
//!     .publish(&json!({"id": "1"}))
//!     .await?;
//!
//! let handler = RecordingHandler::new();
//! let handle = Consumer::queue(broker.clone(), config.broker, true)?.subscribe(handler.clone());
//! handler.wait_for(1).await;
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod health;
pub mod message;
pub mod observability;
pub mod producer;
pub mod testing;
pub mod transport;

pub use config::{BridgeConfig, ConfigError, ConnectionConfig, DestinationConfig};
pub use consumer::{Consumer, ConsumerExit, ConsumerHandle, ConsumerState};
pub use error::{BridgeError, BridgeResult, HandlerError, PublishStage, TransportError};
pub use health::{HealthCheck, HealthCheckManager, HealthProbe, HealthResult};
pub use message::{Attributes, Message, MessageHandler};
pub use producer::Producer;
pub use transport::{BrokerDriver, DestinationKind, ReasonCode};
