//! Transport session: connect, open, release
//!
//! A session wraps the three-step acquisition shared by consumers and
//! producers (authenticate, connect, open a destination) and the best-effort
//! release that must run on every exit path.

use super::driver::{
    BrokerDriver, ConnectOptions, ConnectionHandle, DestinationHandle, DestinationKind,
    GetOptions, ObjectDescriptor, OpenMode, PutOptions, PutOutcome, RawMessage,
    SubscriptionDescriptor,
};
use crate::config::ConnectionConfig;
use crate::error::{sanitize_error_message, PublishStage, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Resource acquisition and release against one broker
#[derive(Clone)]
pub struct TransportSession {
    driver: Arc<dyn BrokerDriver>,
    config: ConnectionConfig,
}

impl TransportSession {
    pub fn new(driver: Arc<dyn BrokerDriver>, config: ConnectionConfig) -> Self {
        Self { driver, config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn BrokerDriver> {
        &self.driver
    }

    /// Authenticate and connect to the configured queue manager
    pub async fn connect(&self) -> Result<ConnectionHandle, TransportError> {
        let manager = &self.config.manager_name;
        let options = ConnectOptions::from_config(&self.config);

        debug!(
            manager = %manager,
            connection = %options.binding.connection_name,
            channel = %options.binding.channel_name,
            "Connecting to queue manager"
        );

        match self.driver.connect(manager, &options).await {
            Ok(connection) => {
                info!("MQCONN to {} successful", manager);
                Ok(connection)
            }
            Err(e) => {
                error!(
                    "MQCONN ended with reason code {} ({})",
                    e.reason,
                    sanitize_error_message(&e.message)
                );
                Err(TransportError::Connection {
                    manager: manager.clone(),
                    reason: e.reason,
                })
            }
        }
    }

    /// Open a named topic or queue with the requested access
    pub async fn open_destination(
        &self,
        connection: &ConnectionHandle,
        name: &str,
        kind: DestinationKind,
        mode: OpenMode,
    ) -> Result<DestinationHandle, TransportError> {
        let descriptor = ObjectDescriptor {
            name: name.to_string(),
            kind,
        };

        match self.driver.open(connection, &descriptor, mode).await {
            Ok(destination) => {
                info!("MQOPEN of {} successful", name);
                Ok(destination)
            }
            Err(e) => {
                error!(
                    "MQOPEN of {} ended with reason code {} ({})",
                    name,
                    e.reason,
                    sanitize_error_message(&e.message)
                );
                Err(TransportError::Open {
                    destination: name.to_string(),
                    kind,
                    reason: e.reason,
                })
            }
        }
    }

    /// Create a non-durable subscription on a topic string
    ///
    /// A subscription handle the driver allocated before failing is closed
    /// here; the connection stays with the caller.
    pub async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        topic: &str,
    ) -> Result<DestinationHandle, TransportError> {
        let descriptor = SubscriptionDescriptor::non_durable(topic);

        match self.driver.subscribe(connection, &descriptor).await {
            Ok(subscription) => {
                info!("MQSUB to topic {} successful", topic);
                Ok(subscription)
            }
            Err(failure) => {
                error!(
                    "MQSUB ended with reason {} ({})",
                    failure.error.reason,
                    sanitize_error_message(&failure.error.message)
                );
                if let Some(partial) = failure.partial {
                    self.close(partial, "Subscription").await;
                }
                Err(TransportError::Open {
                    destination: topic.to_string(),
                    kind: DestinationKind::Topic,
                    reason: failure.error.reason,
                })
            }
        }
    }

    /// Retrieve one message without waiting
    pub async fn get(&self, destination: &DestinationHandle) -> Result<RawMessage, TransportError> {
        self.driver
            .get(destination, &GetOptions::no_wait())
            .await
            .map_err(|e| {
                if !e.reason.is_no_message() {
                    debug!("MQGET detail: {}", sanitize_error_message(&e.message));
                }
                TransportError::from_get(e.reason)
            })
    }

    /// Put one payload on an output destination
    pub async fn put(
        &self,
        destination: &DestinationHandle,
        name: &str,
        kind: DestinationKind,
        payload: Bytes,
    ) -> Result<PutOutcome, TransportError> {
        match self
            .driver
            .put(destination, payload, &PutOptions::for_kind(kind))
            .await
        {
            Ok(outcome) => {
                info!("MQPUT successful");
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    "MQPUT to {} ended with reason code {} ({})",
                    name,
                    e.reason,
                    sanitize_error_message(&e.message)
                );
                Err(TransportError::Publish {
                    destination: name.to_string(),
                    stage: PublishStage::Put,
                    reason: e.reason,
                })
            }
        }
    }

    /// Close the destination (if any) then disconnect; never fails
    pub async fn release(
        &self,
        connection: ConnectionHandle,
        destination: Option<DestinationHandle>,
    ) {
        if let Some(destination) = destination {
            self.close(destination, "Destination").await;
        }

        match self.driver.disconnect(connection).await {
            Ok(()) => info!("MQDISC successful"),
            Err(e) => error!(
                "MQDISC ended with reason code {} ({})",
                e.reason,
                sanitize_error_message(&e.message)
            ),
        }
    }

    async fn close(&self, destination: DestinationHandle, what: &str) {
        match self.driver.close(destination).await {
            Ok(()) => info!("MQCLOSE ({}) successful", what),
            Err(e) => error!(
                "MQCLOSE ({}) ended with reason {} ({})",
                what,
                e.reason,
                sanitize_error_message(&e.message)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::transport::memory::MemoryBroker;
    use crate::testing::capture_logs;
    use crate::transport::ReasonCode;
    use tracing::Level;

    fn session(broker: &Arc<MemoryBroker>) -> TransportSession {
        let config = BridgeConfig::test_config();
        TransportSession::new(broker.clone(), config.broker.connection)
    }

    #[tokio::test]
    async fn test_connect_open_release_round() {
        let broker = MemoryBroker::with_manager("QM1");
        broker.define_queue("DEV.QUEUE.1").await;
        let session = session(&broker);

        let connection = session.connect().await.unwrap();
        let destination = session
            .open_destination(
                &connection,
                "DEV.QUEUE.1",
                DestinationKind::Queue,
                OpenMode::Output,
            )
            .await
            .unwrap();

        assert_eq!(broker.stats().await.open_connections, 1);
        assert_eq!(broker.stats().await.open_destinations, 1);

        session.release(connection, Some(destination)).await;

        let stats = broker.stats().await;
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.open_destinations, 0);
        assert_eq!(stats.close_calls, 1);
        assert_eq!(stats.disconnect_calls, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_carries_reason() {
        let broker = MemoryBroker::with_manager("QM1");
        broker.fail_connect(ReasonCode::NOT_AUTHORIZED).await;

        let err = session(&broker).connect().await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Connection {
                manager: "QM1".to_string(),
                reason: ReasonCode::NOT_AUTHORIZED
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_manager_is_refused() {
        let broker = MemoryBroker::with_manager("QM2");
        let err = session(&broker).connect().await.unwrap_err();
        assert_eq!(err.reason(), Some(ReasonCode::Q_MGR_NAME_ERROR));
    }

    #[tokio::test]
    async fn test_open_unknown_queue_fails() {
        let broker = MemoryBroker::with_manager("QM1");
        let session = session(&broker);
        let connection = session.connect().await.unwrap();

        let err = session
            .open_destination(&connection, "MISSING", DestinationKind::Queue, OpenMode::Input)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(ReasonCode::UNKNOWN_OBJECT_NAME));

        session.release(connection, None).await;
        assert_eq!(broker.stats().await.open_connections, 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_partial_handle() {
        let broker = MemoryBroker::with_manager("QM1");
        broker
            .fail_subscribe(ReasonCode::NOT_AUTHORIZED, true)
            .await;
        let session = session(&broker);
        let connection = session.connect().await.unwrap();

        let err = session.subscribe(&connection, "dev/").await.unwrap_err();
        assert_eq!(err.reason(), Some(ReasonCode::NOT_AUTHORIZED));
        assert_eq!(broker.stats().await.open_destinations, 0);
        assert_eq!(broker.stats().await.close_calls, 1);

        session.release(connection, None).await;
    }

    #[tokio::test]
    async fn test_failed_close_still_disconnects() {
        let (logs, _guard) = capture_logs();
        let broker = MemoryBroker::with_manager("QM1");
        broker.define_queue("DEV.QUEUE.1").await;
        broker.fail_close(ReasonCode::CONNECTION_BROKEN).await;
        let session = session(&broker);

        let connection = session.connect().await.unwrap();
        let destination = session
            .open_destination(
                &connection,
                "DEV.QUEUE.1",
                DestinationKind::Queue,
                OpenMode::Input,
            )
            .await
            .unwrap();

        session.release(connection, Some(destination)).await;

        let stats = broker.stats().await;
        assert_eq!(stats.close_calls, 1);
        assert_eq!(stats.disconnect_calls, 1);
        assert_eq!(stats.open_connections, 0);
        assert!(logs.contains(Level::ERROR, "MQCLOSE (Destination) ended with reason 2009"));
        assert!(logs.contains(Level::INFO, "MQDISC successful"));
    }
}
