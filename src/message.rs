//! Delivered messages and the handler contract

use crate::error::HandlerError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

/// Key/value attributes accompanying a delivery
pub type Attributes = HashMap<String, String>;

/// A delivered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: T,
}

impl<T> Message<T> {
    pub fn new(data: T) -> Self {
        Self { id: None, data }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Message<String> {
    /// Decode the text payload into a typed value
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<Message<T>, serde_json::Error> {
        Ok(Message {
            id: self.id.clone(),
            data: serde_json::from_str(&self.data)?,
        })
    }
}

/// Receives decoded payloads from a consumer
///
/// Invoked at most once per retrieved message. A returned error is logged
/// by the consumer and never stops consumption.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        payload: String,
        attributes: Attributes,
        raw: Message<String>,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String, Attributes, Message<String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        payload: String,
        attributes: Attributes,
        raw: Message<String>,
    ) -> Result<(), HandlerError> {
        (self)(payload, attributes, raw).await
    }
}
