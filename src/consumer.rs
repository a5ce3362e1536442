//! Polling consumer for topics and queues
//!
//! `Consumer::subscribe` starts a background task and returns a
//! [`ConsumerHandle`] immediately. The task connects, opens a subscription
//! (topic) or the queue for input, then polls:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Subscribing | Opening -> Polling
//!                            \                        \
//!                             +---------> Failed <------+
//! ```
//!
//! Polling is completion-driven: the task waits the poll interval, issues one
//! non-blocking get and awaits the handler before waiting again, so gets never
//! overlap. Consumption faults are logged and absorbed; only setup faults end
//! the task on its own.

use crate::config::{ConfigError, DestinationConfig};
use crate::error::TransportError;
use crate::message::{Attributes, Message, MessageHandler};
use crate::transport::{
    BrokerDriver, ConnectionHandle, DestinationHandle, DestinationKind, OpenMode, RawMessage,
    TransportSession,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Lifecycle of one consumer task
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Connected,
    Subscribing,
    Opening,
    Polling,
    Failed(TransportError),
    Stopped,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Failed(_) | ConsumerState::Stopped)
    }
}

/// How a consumer task ended
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerExit {
    /// Stopped on request after releasing its handles
    Stopped,
    /// Setup failed; no get was ever issued
    Failed(TransportError),
    /// The task panicked or was aborted
    Aborted,
}

/// Consumer bound to one destination kind
pub struct Consumer {
    session: TransportSession,
    kind: DestinationKind,
    destination: String,
    json: bool,
}

impl Consumer {
    /// Build a consumer; fails when no destination of `kind` is configured
    pub fn new(
        driver: Arc<dyn BrokerDriver>,
        config: DestinationConfig,
        kind: DestinationKind,
        json: bool,
    ) -> Result<Self, ConfigError> {
        let destination = config.destination_name(kind)?.to_string();
        Ok(Self {
            session: TransportSession::new(driver, config.connection),
            kind,
            destination,
            json,
        })
    }

    /// Consumer of the configured topic
    pub fn topic(
        driver: Arc<dyn BrokerDriver>,
        config: DestinationConfig,
        json: bool,
    ) -> Result<Self, ConfigError> {
        Self::new(driver, config, DestinationKind::Topic, json)
    }

    /// Consumer of the configured queue
    pub fn queue(
        driver: Arc<dyn BrokerDriver>,
        config: DestinationConfig,
        json: bool,
    ) -> Result<Self, ConfigError> {
        Self::new(driver, config, DestinationKind::Queue, json)
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Start consuming; returns as soon as the task is spawned
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// handle detaches the task; use [`ConsumerHandle::stop`] to end it.
    pub fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> ConsumerHandle {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let span = crate::broker_span!(
            kind = %self.kind,
            destination = %self.destination,
            manager = %self.session.config().manager_name
        );
        let worker = PollWorker {
            session: self.session.clone(),
            kind: self.kind,
            destination: self.destination.clone(),
            json: self.json,
            handler,
            state: state_tx,
        };
        let task = tokio::spawn(worker.run(shutdown_rx).instrument(span));

        ConsumerHandle {
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Alias of [`Consumer::subscribe`]
    pub fn get(&self, handler: Arc<dyn MessageHandler>) -> ConsumerHandle {
        self.subscribe(handler)
    }

    /// Alias of [`Consumer::subscribe`]
    pub fn receive(&self, handler: Arc<dyn MessageHandler>) -> ConsumerHandle {
        self.subscribe(handler)
    }

    /// Alias of [`Consumer::subscribe`]
    pub fn read(&self, handler: Arc<dyn MessageHandler>) -> ConsumerHandle {
        self.subscribe(handler)
    }

    /// Alias of [`Consumer::subscribe`]
    pub fn consume(&self, handler: Arc<dyn MessageHandler>) -> ConsumerHandle {
        self.subscribe(handler)
    }
}

/// Control handle of a running consumer task
pub struct ConsumerHandle {
    state: watch::Receiver<ConsumerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<ConsumerExit>,
}

impl ConsumerHandle {
    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    /// Receiver of lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`; returns the matching state
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConsumerState) -> bool,
    ) -> ConsumerState {
        let mut state = self.state.clone();
        if let Ok(matched) = state.wait_for(predicate).await {
            return matched.clone();
        }
        // Task gone; report whatever it left behind
        let last = state.borrow().clone();
        last
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the task to stop, then wait for it to release its handles
    pub async fn stop(self) -> ConsumerExit {
        let _ = self.shutdown.send(true);
        Self::join(self.task).await
    }

    /// Wait for the task to end without requesting a stop
    pub async fn wait(self) -> ConsumerExit {
        Self::join(self.task).await
    }

    async fn join(task: JoinHandle<ConsumerExit>) -> ConsumerExit {
        match task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("Consumer task ended abnormally: {}", e);
                ConsumerExit::Aborted
            }
        }
    }
}

struct PollWorker {
    session: TransportSession,
    kind: DestinationKind,
    destination: String,
    json: bool,
    handler: Arc<dyn MessageHandler>,
    state: watch::Sender<ConsumerState>,
}

/// Resolves once a stop was requested; never resolves if the handle is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl PollWorker {
    fn set(&self, state: ConsumerState) {
        debug!("Consumer state: {:?}", state);
        let _ = self.state.send(state);
    }

    fn fail(&self, error: TransportError) -> ConsumerExit {
        self.set(ConsumerState::Failed(error.clone()));
        ConsumerExit::Failed(error)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> ConsumerExit {
        self.set(ConsumerState::Connecting);
        let connection = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => {
                self.set(ConsumerState::Stopped);
                return ConsumerExit::Stopped;
            }
            connected = self.session.connect() => connected,
        };
        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => return self.fail(e),
        };
        self.set(ConsumerState::Connected);

        let destination = match self.open(&connection).await {
            Ok(destination) => destination,
            Err(e) => {
                self.session.release(connection, None).await;
                return self.fail(e);
            }
        };
        self.set(ConsumerState::Polling);

        let interval = self.session.config().poll_interval();
        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.poll(&destination).await;
        }

        info!("Stopping consumer of {} {}", self.kind, self.destination);
        self.session.release(connection, Some(destination)).await;
        self.set(ConsumerState::Stopped);
        ConsumerExit::Stopped
    }

    async fn open(&self, connection: &ConnectionHandle) -> Result<DestinationHandle, TransportError> {
        match self.kind {
            DestinationKind::Topic => {
                self.set(ConsumerState::Subscribing);
                self.session.subscribe(connection, &self.destination).await
            }
            DestinationKind::Queue => {
                self.set(ConsumerState::Opening);
                self.session
                    .open_destination(
                        connection,
                        &self.destination,
                        DestinationKind::Queue,
                        OpenMode::Input,
                    )
                    .await
            }
        }
    }

    /// One get, and one handler invocation if a message arrived
    async fn poll(&self, destination: &DestinationHandle) {
        debug!("Retrieving message.");
        match self.session.get(destination).await {
            Ok(raw) => self.deliver(raw).await,
            Err(TransportError::NoMessageAvailable) => info!("No available messages."),
            Err(e) => error!("{}", e),
        }
    }

    async fn deliver(&self, raw: RawMessage) {
        let payload = match decode_payload(&raw, self.json) {
            Ok(payload) => payload,
            Err(reason) => {
                error!(
                    "Discarding message {}: {}",
                    raw.message_id.as_deref().unwrap_or("<none>"),
                    reason
                );
                return;
            }
        };

        let message = Message {
            id: raw.message_id,
            data: payload.clone(),
        };
        match self
            .handler
            .handle(payload, Attributes::new(), message)
            .await
        {
            Ok(()) => info!("Update done."),
            Err(e) => error!("{}", e),
        }
    }
}

/// Decode a payload to text; JSON mode also requires well-formed JSON
pub fn decode_payload(raw: &RawMessage, json: bool) -> Result<String, String> {
    if !json {
        return Ok(String::from_utf8_lossy(&raw.payload).into_owned());
    }

    let text = std::str::from_utf8(&raw.payload)
        .map_err(|e| format!("payload is not valid UTF-8: {e}"))?;
    serde_json::from_str::<serde::de::IgnoredAny>(text)
        .map_err(|e| format!("payload is not valid JSON: {e}"))?;
    Ok(text.to_string())
}
