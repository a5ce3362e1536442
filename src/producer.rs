//! One-shot publisher for topics and queues
//!
//! Every publish owns its own connection: serialize, connect, open for
//! output, put, then release both handles whatever the outcome. Nothing is
//! shared between concurrent publishes and nothing is retried.

use crate::config::DestinationConfig;
use crate::error::{PublishStage, TransportError};
use crate::transport::{BrokerDriver, DestinationKind, OpenMode, PutOutcome, TransportSession};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Producer bound to one destination kind
#[derive(Clone)]
pub struct Producer {
    session: TransportSession,
    kind: DestinationKind,
    destination: Option<String>,
}

impl Producer {
    /// Producer whose fixed destination is the configured name of `kind`, if any
    pub fn new(driver: Arc<dyn BrokerDriver>, config: DestinationConfig, kind: DestinationKind) -> Self {
        let destination = config.destination_name(kind).ok().map(str::to_string);
        Self {
            session: TransportSession::new(driver, config.connection),
            kind,
            destination,
        }
    }

    /// Producer publishing to topics
    pub fn topic(driver: Arc<dyn BrokerDriver>, config: DestinationConfig) -> Self {
        Self::new(driver, config, DestinationKind::Topic)
    }

    /// Producer putting to queues
    pub fn queue(driver: Arc<dyn BrokerDriver>, config: DestinationConfig) -> Self {
        Self::new(driver, config, DestinationKind::Queue)
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    /// Fixed destination used by [`Producer::publish`]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Publish to the configured destination
    pub async fn publish<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), TransportError> {
        let destination = self
            .destination
            .as_deref()
            .ok_or(TransportError::MissingDestination(self.kind))?;
        self.publish_to(destination, payload).await
    }

    /// Publish to a named destination of this producer's kind
    pub async fn publish_to<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        // Serialization faults never reach the broker
        let body = serde_json::to_vec(payload)
            .map_err(|e| TransportError::serialization(e.to_string()))?;

        let span = crate::broker_span!(kind = %self.kind, destination = %destination);
        self.send_bytes(destination, Bytes::from(body))
            .instrument(span)
            .await
    }

    async fn send_bytes(&self, destination: &str, body: Bytes) -> Result<(), TransportError> {
        debug!("Publishing {} bytes to {} {}", body.len(), self.kind, destination);

        let connection = self
            .session
            .connect()
            .await
            .map_err(|e| at_stage(e, destination, PublishStage::Connect))?;

        let handle = match self
            .session
            .open_destination(&connection, destination, self.kind, OpenMode::Output)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.session.release(connection, None).await;
                return Err(at_stage(e, destination, PublishStage::Open));
            }
        };

        let outcome = self
            .session
            .put(&handle, destination, self.kind, body)
            .await;
        self.session.release(connection, Some(handle)).await;

        match outcome? {
            PutOutcome::Delivered => {}
            PutOutcome::NoSubscribersMatched => {
                warn!("Published to {} but no subscription matched", destination)
            }
        }
        info!("Published message to {} {}", self.kind, destination);
        Ok(())
    }

    /// Alias of [`Producer::publish`]
    pub async fn put<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), TransportError> {
        self.publish(payload).await
    }

    /// Alias of [`Producer::publish`]
    pub async fn produce<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), TransportError> {
        self.publish(payload).await
    }

    /// Alias of [`Producer::publish`]
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), TransportError> {
        self.publish(payload).await
    }

    /// Alias of [`Producer::publish`]
    pub async fn write<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), TransportError> {
        self.publish(payload).await
    }

    /// Alias of [`Producer::publish_to`]
    pub async fn put_to<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        self.publish_to(destination, payload).await
    }

    /// Alias of [`Producer::publish_to`]
    pub async fn produce_to<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        self.publish_to(destination, payload).await
    }

    /// Alias of [`Producer::publish_to`]
    pub async fn send_to<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        self.publish_to(destination, payload).await
    }

    /// Alias of [`Producer::publish_to`]
    pub async fn write_to<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        self.publish_to(destination, payload).await
    }
}

/// Re-tag a session fault with the publish stage it happened in
fn at_stage(error: TransportError, destination: &str, stage: PublishStage) -> TransportError {
    match error.reason() {
        Some(reason) => TransportError::Publish {
            destination: destination.to_string(),
            stage,
            reason,
        },
        None => error,
    }
}
