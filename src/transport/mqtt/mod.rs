//! MQTT v5 broker driver
//!
//! Bridges the broker driver seam onto an MQTT broker through rumqttc.
//!
//! # Architecture
//!
//! - [`connection`] - Pure option building, connection name parsing and
//!   reason code mapping
//! - [`driver`] - Impure I/O: client connections, the event loop task and
//!   per-subscription inboxes
//!
//! Queues are carried on `queue/<name>` topics. Consumers read them through a
//! shared subscription `$share/<service>/queue/<name>`, so each message
//! reaches one member of the service group.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqbridge::transport::mqtt::MqttDriver;
//! use mqbridge::transport::TransportSession;
//! use mqbridge::config::BridgeConfig;
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::load_from_file(Path::new("mqbridge.toml"))?;
//! let session = TransportSession::new(MqttDriver::new(), config.broker.connection);
//! let connection = session.connect().await?;
//! session.release(connection, None).await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod driver;

pub use connection::{parse_connection_name, Endpoint};
pub use driver::MqttDriver;
