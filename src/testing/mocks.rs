//! Mock message handlers for testing
//!
//! Provides recording and failing [`MessageHandler`] implementations so
//! consumers can be exercised against the in-memory broker without a real
//! processing pipeline.

use crate::error::HandlerError;
use crate::message::{Attributes, Message, MessageHandler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// One handler invocation as seen by a mock
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub payload: String,
    pub attributes: Attributes,
    pub raw: Message<String>,
}

/// Handler that records every delivery and succeeds
#[derive(Debug)]
pub struct RecordingHandler {
    deliveries: Mutex<Vec<Delivery>>,
    completed: watch::Sender<usize>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Handler that takes `delay` to process each message
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(delay)))
    }

    fn build(delay: Option<Duration>) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            deliveries: Mutex::new(Vec::new()),
            completed,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    pub async fn payloads(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .await
            .iter()
            .map(|d| d.payload.clone())
            .collect()
    }

    /// Number of completed invocations
    pub fn count(&self) -> usize {
        *self.completed.borrow()
    }

    /// Highest number of invocations observed running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` invocations have completed
    pub async fn wait_for(&self, n: usize) {
        let mut completed = self.completed.subscribe();
        let _ = completed.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        payload: String,
        attributes: Attributes,
        raw: Message<String>,
    ) -> Result<(), HandlerError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        self.deliveries.lock().await.push(Delivery {
            payload,
            attributes,
            raw,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.send_modify(|count| *count += 1);
        Ok(())
    }
}

/// Handler that records attempts and always fails
#[derive(Debug)]
pub struct FailingHandler {
    message: String,
    attempts: watch::Sender<usize>,
}

impl FailingHandler {
    pub fn new(message: &str) -> Arc<Self> {
        let (attempts, _) = watch::channel(0);
        Arc::new(Self {
            message: message.to_string(),
            attempts,
        })
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.borrow()
    }

    pub async fn wait_for(&self, n: usize) {
        let mut attempts = self.attempts.subscribe();
        let _ = attempts.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(
        &self,
        _payload: String,
        _attributes: Attributes,
        _raw: Message<String>,
    ) -> Result<(), HandlerError> {
        self.attempts.send_modify(|count| *count += 1);
        Err(HandlerError::new(self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_handler_records() {
        let handler = RecordingHandler::new();
        handler
            .handle(
                "hello".to_string(),
                Attributes::new(),
                Message::new("hello".to_string()),
            )
            .await
            .unwrap();

        handler.wait_for(1).await;
        assert_eq!(handler.count(), 1);
        assert_eq!(handler.payloads().await, vec!["hello".to_string()]);
        assert_eq!(handler.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_fails() {
        let handler = FailingHandler::new("store unavailable");
        let result = handler
            .handle(String::new(), Attributes::new(), Message::new(String::new()))
            .await;
        assert_eq!(result.unwrap_err().message, "store unavailable");
        assert_eq!(handler.attempts(), 1);
    }
}
