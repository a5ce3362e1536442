//! In-process broker driver
//!
//! `MemoryBroker` implements [`BrokerDriver`] entirely in memory. It keeps
//! defined queues, non-durable topic subscriptions and the set of open
//! handles, so it doubles as the reference semantics for the transport layer
//! and as the substitute driver in tests.
//!
//! Faults can be injected per primitive (refused connects, failing
//! subscriptions, put and get faults, stalled connects) and every call is
//! counted, which lets tests assert ordering and resource release.

use super::driver::{
    BrokerDriver, ConnectOptions, ConnectionHandle, DestinationHandle, DestinationKind,
    DriverError, GetOptions, ObjectDescriptor, OpenMode, PutOptions, PutOutcome, RawMessage,
    SubscribeFailure, SubscriptionDescriptor,
};
use super::reason::ReasonCode;
use super::topic::topic_matches;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Broker primitive, recorded in call order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerCall {
    Connect,
    Disconnect,
    Open,
    Subscribe,
    Close,
    Get,
    Put,
}

/// Call counters and currently open resources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connect_calls: usize,
    pub disconnect_calls: usize,
    pub open_calls: usize,
    pub subscribe_calls: usize,
    pub close_calls: usize,
    pub get_calls: usize,
    pub put_calls: usize,
    pub open_connections: usize,
    pub open_destinations: usize,
}

#[derive(Debug)]
enum Target {
    QueueInput(String),
    QueueOutput(String),
    TopicOutput(String),
    Subscription {
        filter: String,
        pending: VecDeque<RawMessage>,
    },
}

#[derive(Debug)]
struct OpenDestination {
    connection: u64,
    target: Target,
}

#[derive(Debug, Default)]
struct Faults {
    connect: Option<ReasonCode>,
    connect_stalls: bool,
    connect_delay: Option<Duration>,
    subscribe: Option<(ReasonCode, bool)>,
    put: Option<ReasonCode>,
    /// Reason and remaining number of failing gets
    get: Option<(ReasonCode, usize)>,
    close: Option<ReasonCode>,
    denied: HashSet<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    manager: Option<String>,
    credentials: Option<(String, String)>,
    queues: HashMap<String, VecDeque<RawMessage>>,
    connections: HashSet<u64>,
    destinations: HashMap<u64, OpenDestination>,
    faults: Faults,
    calls: Vec<BrokerCall>,
    published: Vec<(String, Bytes)>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn count(&self, call: BrokerCall) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }

    fn check_connection(&self, connection: &ConnectionHandle) -> Result<(), DriverError> {
        if self.connections.contains(&connection.id()) {
            Ok(())
        } else {
            Err(DriverError::new(
                ReasonCode::HCONN_ERROR,
                format!("connection {} is not open", connection.id()),
            ))
        }
    }
}

/// In-memory queue manager
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    /// Broker accepting connections for any queue manager name
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Broker that refuses connections naming another queue manager
    pub fn with_manager(manager: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                manager: Some(manager.to_string()),
                ..BrokerState::default()
            }),
        })
    }

    /// Only accept connections presenting these credentials
    pub async fn require_credentials(&self, user: &str, password: &str) {
        self.state.lock().await.credentials = Some((user.to_string(), password.to_string()));
    }

    /// Define a local queue
    pub async fn define_queue(&self, name: &str) {
        self.state
            .lock()
            .await
            .queues
            .entry(name.to_string())
            .or_default();
    }

    /// Refuse every connect with `reason`
    pub async fn fail_connect(&self, reason: ReasonCode) {
        self.state.lock().await.faults.connect = Some(reason);
    }

    /// Make connects never complete
    pub async fn stall_connect(&self) {
        self.state.lock().await.faults.connect_stalls = true;
    }

    /// Delay every connect by `delay`
    pub async fn delay_connect(&self, delay: Duration) {
        self.state.lock().await.faults.connect_delay = Some(delay);
    }

    /// Fail subscriptions with `reason`; `leave_partial` hands back a
    /// half-created subscription handle with the failure
    pub async fn fail_subscribe(&self, reason: ReasonCode, leave_partial: bool) {
        self.state.lock().await.faults.subscribe = Some((reason, leave_partial));
    }

    /// Fail every put with `reason`
    pub async fn fail_put(&self, reason: ReasonCode) {
        self.state.lock().await.faults.put = Some(reason);
    }

    /// Fail the next `times` gets with `reason`
    pub async fn fail_gets(&self, reason: ReasonCode, times: usize) {
        self.state.lock().await.faults.get = Some((reason, times));
    }

    /// Fail every close with `reason`
    pub async fn fail_close(&self, reason: ReasonCode) {
        self.state.lock().await.faults.close = Some(reason);
    }

    /// Deny access to a queue or topic
    pub async fn deny(&self, name: &str) {
        self.state.lock().await.faults.denied.insert(name.to_string());
    }

    /// Place a message directly on a queue, defining it if needed
    pub async fn enqueue(&self, queue: &str, payload: impl Into<Bytes>) {
        let message = new_message(payload.into());
        self.state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }

    /// Publish on a topic from outside any connection; returns the number of
    /// subscriptions the message reached
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let mut state = self.state.lock().await;
        fan_out(&mut state, topic, payload.into())
    }

    /// Messages currently held on a queue
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Every successful put as `(destination, payload)`
    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.state.lock().await.published.clone()
    }

    /// Broker primitives in the order they were invoked
    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn stats(&self) -> BrokerStats {
        let state = self.state.lock().await;
        BrokerStats {
            connect_calls: state.count(BrokerCall::Connect),
            disconnect_calls: state.count(BrokerCall::Disconnect),
            open_calls: state.count(BrokerCall::Open),
            subscribe_calls: state.count(BrokerCall::Subscribe),
            close_calls: state.count(BrokerCall::Close),
            get_calls: state.count(BrokerCall::Get),
            put_calls: state.count(BrokerCall::Put),
            open_connections: state.connections.len(),
            open_destinations: state.destinations.len(),
        }
    }
}

fn new_message(payload: Bytes) -> RawMessage {
    RawMessage {
        message_id: Some(Uuid::new_v4().simple().to_string()),
        correlation_id: Some(Uuid::new_v4().simple().to_string()),
        payload,
    }
}

fn fan_out(state: &mut BrokerState, topic: &str, payload: Bytes) -> usize {
    let mut matched = 0;
    for destination in state.destinations.values_mut() {
        if let Target::Subscription { filter, pending } = &mut destination.target {
            if topic_matches(filter, topic) {
                pending.push_back(new_message(payload.clone()));
                matched += 1;
            }
        }
    }
    matched
}

#[async_trait]
impl BrokerDriver for MemoryBroker {
    async fn connect(
        &self,
        manager: &str,
        options: &ConnectOptions,
    ) -> Result<ConnectionHandle, DriverError> {
        let (stalls, delay) = {
            let mut state = self.state.lock().await;
            state.calls.push(BrokerCall::Connect);
            (state.faults.connect_stalls, state.faults.connect_delay)
        };

        if stalls {
            return std::future::pending::<Result<ConnectionHandle, DriverError>>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(reason) = state.faults.connect {
            return Err(DriverError::new(reason, "connection refused"));
        }
        if let Some(expected) = &state.manager {
            if expected != manager {
                return Err(DriverError::new(
                    ReasonCode::Q_MGR_NAME_ERROR,
                    format!("unknown queue manager {manager}"),
                ));
            }
        }
        if let Some((user, password)) = &state.credentials {
            if *user != options.credentials.user || *password != options.credentials.password {
                return Err(DriverError::new(
                    ReasonCode::NOT_AUTHORIZED,
                    format!("user {} not authorized", options.credentials.user),
                ));
            }
        }

        let id = state.next_id();
        state.connections.insert(id);
        debug!(connection = id, application = %options.application_name, "memory broker connected");
        Ok(ConnectionHandle::new(id))
    }

    async fn disconnect(&self, connection: ConnectionHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Disconnect);
        state.check_connection(&connection)?;

        // Non-durable subscriptions and open objects go with the connection
        state.connections.remove(&connection.id());
        state
            .destinations
            .retain(|_, d| d.connection != connection.id());
        Ok(())
    }

    async fn open(
        &self,
        connection: &ConnectionHandle,
        descriptor: &ObjectDescriptor,
        mode: OpenMode,
    ) -> Result<DestinationHandle, DriverError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Open);
        state.check_connection(connection)?;

        let name = descriptor.name.clone();
        if state.faults.denied.contains(&name) {
            return Err(DriverError::new(
                ReasonCode::NOT_AUTHORIZED,
                format!("access to {name} denied"),
            ));
        }

        let target = match (descriptor.kind, mode) {
            (DestinationKind::Queue, mode) => {
                if !state.queues.contains_key(&name) {
                    return Err(DriverError::new(
                        ReasonCode::UNKNOWN_OBJECT_NAME,
                        format!("queue {name} does not exist"),
                    ));
                }
                match mode {
                    OpenMode::Input => Target::QueueInput(name),
                    OpenMode::Output => Target::QueueOutput(name),
                }
            }
            (DestinationKind::Topic, OpenMode::Output) => Target::TopicOutput(name),
            (DestinationKind::Topic, OpenMode::Input) => Target::Subscription {
                filter: name,
                pending: VecDeque::new(),
            },
        };

        let id = state.next_id();
        state.destinations.insert(
            id,
            OpenDestination {
                connection: connection.id(),
                target,
            },
        );
        Ok(DestinationHandle::new(id))
    }

    async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        descriptor: &SubscriptionDescriptor,
    ) -> Result<DestinationHandle, SubscribeFailure> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Subscribe);
        state.check_connection(connection)?;

        let denied = state.faults.denied.contains(&descriptor.topic_string);
        let injected = state.faults.subscribe;
        let failure = match (injected, denied) {
            (Some((reason, partial)), _) => Some((reason, partial)),
            (None, true) => Some((ReasonCode::NOT_AUTHORIZED, false)),
            (None, false) => None,
        };

        let id = state.next_id();
        state.destinations.insert(
            id,
            OpenDestination {
                connection: connection.id(),
                target: Target::Subscription {
                    filter: descriptor.topic_string.clone(),
                    pending: VecDeque::new(),
                },
            },
        );

        match failure {
            None => Ok(DestinationHandle::new(id)),
            Some((reason, leave_partial)) => {
                let error = DriverError::new(
                    reason,
                    format!("subscription to {} failed", descriptor.topic_string),
                );
                if leave_partial {
                    Err(SubscribeFailure {
                        error,
                        partial: Some(DestinationHandle::new(id)),
                    })
                } else {
                    state.destinations.remove(&id);
                    Err(error.into())
                }
            }
        }
    }

    async fn close(&self, destination: DestinationHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Close);

        if state.destinations.remove(&destination.id()).is_none() {
            return Err(DriverError::new(
                ReasonCode::HOBJ_ERROR,
                format!("object handle {} is not open", destination.id()),
            ));
        }
        if let Some(reason) = state.faults.close {
            return Err(DriverError::new(reason, "close failed"));
        }
        Ok(())
    }

    async fn get(
        &self,
        destination: &DestinationHandle,
        _options: &GetOptions,
    ) -> Result<RawMessage, DriverError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Get);

        if let Some((reason, remaining)) = state.faults.get {
            if remaining > 0 {
                state.faults.get = Some((reason, remaining - 1));
                return Err(DriverError::new(reason, "get failed"));
            }
        }

        let BrokerState {
            destinations,
            queues,
            ..
        } = &mut *state;

        let open = destinations.get_mut(&destination.id()).ok_or_else(|| {
            DriverError::new(
                ReasonCode::HOBJ_ERROR,
                format!("object handle {} is not open", destination.id()),
            )
        })?;

        let next = match &mut open.target {
            Target::QueueInput(name) => queues.get_mut(name.as_str()).and_then(VecDeque::pop_front),
            Target::Subscription { pending, .. } => pending.pop_front(),
            Target::QueueOutput(_) | Target::TopicOutput(_) => {
                return Err(DriverError::new(
                    ReasonCode::NOT_OPEN_FOR_INPUT,
                    "object not opened for input",
                ));
            }
        };

        next.ok_or_else(DriverError::no_message)
    }

    async fn put(
        &self,
        destination: &DestinationHandle,
        payload: Bytes,
        options: &PutOptions,
    ) -> Result<PutOutcome, DriverError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Put);

        if let Some(reason) = state.faults.put {
            return Err(DriverError::new(reason, "put failed"));
        }

        let target = match state.destinations.get(&destination.id()) {
            Some(OpenDestination {
                target: Target::QueueOutput(name),
                ..
            }) => (DestinationKind::Queue, name.clone()),
            Some(OpenDestination {
                target: Target::TopicOutput(name),
                ..
            }) => (DestinationKind::Topic, name.clone()),
            Some(_) => {
                return Err(DriverError::new(
                    ReasonCode::NOT_OPEN_FOR_OUTPUT,
                    "object not opened for output",
                ));
            }
            None => {
                return Err(DriverError::new(
                    ReasonCode::HOBJ_ERROR,
                    format!("object handle {} is not open", destination.id()),
                ));
            }
        };

        state.published.push((target.1.clone(), payload.clone()));
        match target {
            (DestinationKind::Queue, name) => {
                let message = new_message(payload);
                state.queues.entry(name).or_default().push_back(message);
                Ok(PutOutcome::Delivered)
            }
            (DestinationKind::Topic, name) => {
                let matched = fan_out(&mut state, &name, payload);
                if matched == 0 && options.warn_if_no_subscribers {
                    Ok(PutOutcome::NoSubscribersMatched)
                } else {
                    Ok(PutOutcome::Delivered)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::driver::{ClientBinding, Credentials};

    fn options(user: &str, password: &str) -> ConnectOptions {
        ConnectOptions {
            binding: ClientBinding {
                connection_name: "localhost(1414)".to_string(),
                channel_name: "DEV.APP.SVRCONN".to_string(),
            },
            credentials: Credentials {
                user: user.to_string(),
                password: password.to_string(),
            },
            application_name: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_credentials_checked() {
        let broker = MemoryBroker::new();
        broker.require_credentials("app", "passw0rd").await;

        let err = broker.connect("QM1", &options("app", "wrong")).await.unwrap_err();
        assert_eq!(err.reason, ReasonCode::NOT_AUTHORIZED);

        let conn = broker.connect("QM1", &options("app", "passw0rd")).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_queue_put_then_get() {
        let broker = MemoryBroker::new();
        broker.define_queue("Q1").await;
        let conn = broker.connect("QM1", &options("app", "")).await.unwrap();
        let descriptor = ObjectDescriptor {
            name: "Q1".to_string(),
            kind: DestinationKind::Queue,
        };

        let output = broker.open(&conn, &descriptor, OpenMode::Output).await.unwrap();
        let outcome = broker
            .put(
                &output,
                Bytes::from_static(b"hello"),
                &PutOptions::for_kind(DestinationKind::Queue),
            )
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Delivered);

        let input = broker.open(&conn, &descriptor, OpenMode::Input).await.unwrap();
        let message = broker.get(&input, &GetOptions::no_wait()).await.unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"hello"));
        assert!(message.message_id.is_some());

        let empty = broker.get(&input, &GetOptions::no_wait()).await.unwrap_err();
        assert!(empty.reason.is_no_message());
    }

    #[tokio::test]
    async fn test_topic_put_without_subscribers_warns() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("QM1", &options("app", "")).await.unwrap();
        let descriptor = ObjectDescriptor {
            name: "dev/orders".to_string(),
            kind: DestinationKind::Topic,
        };
        let output = broker.open(&conn, &descriptor, OpenMode::Output).await.unwrap();

        let outcome = broker
            .put(
                &output,
                Bytes::from_static(b"{}"),
                &PutOptions::for_kind(DestinationKind::Topic),
            )
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::NoSubscribersMatched);
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_publications() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("QM1", &options("app", "")).await.unwrap();
        let sub = broker
            .subscribe(&conn, &SubscriptionDescriptor::non_durable("dev/#"))
            .await
            .unwrap();

        assert_eq!(broker.publish("dev/orders", "a").await, 1);
        assert_eq!(broker.publish("prod/orders", "b").await, 0);

        let message = broker.get(&sub, &GetOptions::no_wait()).await.unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"a"));
        assert!(broker.get(&sub, &GetOptions::no_wait()).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_discards_non_durable_subscriptions() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("QM1", &options("app", "")).await.unwrap();
        let _sub = broker
            .subscribe(&conn, &SubscriptionDescriptor::non_durable("dev/"))
            .await
            .unwrap();
        assert_eq!(broker.stats().await.open_destinations, 1);

        broker.disconnect(conn).await.unwrap();
        let stats = broker.stats().await;
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.open_destinations, 0);
    }

    #[tokio::test]
    async fn test_injected_get_faults_run_out() {
        let broker = MemoryBroker::new();
        broker.define_queue("Q1").await;
        broker.fail_gets(ReasonCode::CONNECTION_BROKEN, 1).await;
        let conn = broker.connect("QM1", &options("app", "")).await.unwrap();
        let input = broker
            .open(
                &conn,
                &ObjectDescriptor {
                    name: "Q1".to_string(),
                    kind: DestinationKind::Queue,
                },
                OpenMode::Input,
            )
            .await
            .unwrap();

        let first = broker.get(&input, &GetOptions::no_wait()).await.unwrap_err();
        assert_eq!(first.reason, ReasonCode::CONNECTION_BROKEN);
        let second = broker.get(&input, &GetOptions::no_wait()).await.unwrap_err();
        assert_eq!(second.reason, ReasonCode::NO_MSG_AVAILABLE);
    }
}
