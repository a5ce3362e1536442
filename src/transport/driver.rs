//! Broker driver seam
//!
//! The native broker interface is modelled as an injected capability so that
//! sessions, consumers and producers never reach for a global client. Every
//! primitive is asynchronous and reports faults as a [`DriverError`] carrying
//! a [`ReasonCode`].
//!
//! Handles are opaque and deliberately not `Clone`: `close` and `disconnect`
//! take them by value, so a released handle cannot be used again.

use super::reason::ReasonCode;
use crate::config::ConnectionConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Kind of destination a call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Publish/subscribe topic
    Topic,
    /// Point-to-point queue
    Queue,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Topic => write!(f, "topic"),
            DestinationKind::Queue => write!(f, "queue"),
        }
    }
}

/// Access requested when opening a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Shared input access, as defined on the queue
    Input,
    /// Output access for puts
    Output,
}

/// Opaque connection resource obtained from [`BrokerDriver::connect`]
///
/// Handles are minted by the crate's drivers only:
///
/// ```compile_fail
/// let forged = mqbridge::transport::driver::ConnectionHandle::new(1);
/// ```
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: u64,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Opaque destination resource obtained from open or subscribe
///
/// ```compile_fail
/// let forged = mqbridge::transport::driver::DestinationHandle::new(1);
/// ```
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DestinationHandle {
    id: u64,
}

impl DestinationHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Client-binding descriptor: where and through which channel to connect
#[derive(Debug, Clone, PartialEq)]
pub struct ClientBinding {
    pub connection_name: String,
    pub channel_name: String,
}

/// User credentials presented on connect
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Everything a driver needs to authenticate and bind a client connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub binding: ClientBinding,
    pub credentials: Credentials,
    pub application_name: String,
}

impl ConnectOptions {
    /// Build credentials and the client binding from connection parameters
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            binding: ClientBinding {
                connection_name: config.connection_name.clone(),
                channel_name: config.channel_name.clone(),
            },
            credentials: Credentials {
                user: config.user.clone(),
                password: config.password.clone(),
            },
            application_name: config.service_name.clone(),
        }
    }
}

/// Object descriptor for a direct open
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescriptor {
    pub name: String,
    pub kind: DestinationKind,
}

/// Subscription descriptor against a topic string
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDescriptor {
    pub topic_string: String,
    pub create: bool,
    pub durable: bool,
    pub managed: bool,
    pub fail_if_quiescing: bool,
}

impl SubscriptionDescriptor {
    /// Non-durable, auto-create, managed, fail-if-quiescing subscription
    pub fn non_durable(topic_string: impl Into<String>) -> Self {
        Self {
            topic_string: topic_string.into(),
            create: true,
            durable: false,
            managed: true,
            fail_if_quiescing: true,
        }
    }
}

/// Options applied to a get
#[derive(Debug, Clone, PartialEq)]
pub struct GetOptions {
    pub sync_point: bool,
    /// Zero means the get never blocks
    pub wait: Duration,
    pub convert: bool,
    pub fail_if_quiescing: bool,
}

impl GetOptions {
    pub fn no_wait() -> Self {
        Self {
            sync_point: false,
            wait: Duration::ZERO,
            convert: true,
            fail_if_quiescing: true,
        }
    }
}

impl Default for GetOptions {
    fn default() -> Self {
        Self::no_wait()
    }
}

/// Options applied to a put
#[derive(Debug, Clone, PartialEq)]
pub struct PutOptions {
    pub sync_point: bool,
    pub new_message_id: bool,
    pub new_correlation_id: bool,
    pub warn_if_no_subscribers: bool,
}

impl PutOptions {
    /// Put options for a destination kind; topics warn rather than fail
    /// when nobody is subscribed
    pub fn for_kind(kind: DestinationKind) -> Self {
        Self {
            sync_point: false,
            new_message_id: true,
            new_correlation_id: true,
            warn_if_no_subscribers: kind == DestinationKind::Topic,
        }
    }
}

/// Message as returned by a get
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            payload: payload.into(),
        }
    }
}

/// Result of a successful put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Delivered,
    /// Topic put succeeded but no subscription matched
    NoSubscribersMatched,
}

/// Fault reported by a driver primitive
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("reason {reason}: {message}")]
pub struct DriverError {
    pub reason: ReasonCode,
    pub message: String,
}

impl DriverError {
    pub fn new(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn no_message() -> Self {
        Self::new(ReasonCode::NO_MSG_AVAILABLE, "no message available")
    }
}

/// Subscribe failure, possibly after the driver already allocated a handle
#[derive(Debug)]
pub struct SubscribeFailure {
    pub error: DriverError,
    pub partial: Option<DestinationHandle>,
}

impl From<DriverError> for SubscribeFailure {
    fn from(error: DriverError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// Native broker capability injected into sessions
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    /// Connect and authenticate against a queue manager
    async fn connect(
        &self,
        manager: &str,
        options: &ConnectOptions,
    ) -> Result<ConnectionHandle, DriverError>;

    /// Disconnect; consumes the handle
    async fn disconnect(&self, connection: ConnectionHandle) -> Result<(), DriverError>;

    /// Open a queue or topic object directly
    async fn open(
        &self,
        connection: &ConnectionHandle,
        descriptor: &ObjectDescriptor,
        mode: OpenMode,
    ) -> Result<DestinationHandle, DriverError>;

    /// Create a subscription; the returned handle is read with `get`
    async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        descriptor: &SubscriptionDescriptor,
    ) -> Result<DestinationHandle, SubscribeFailure>;

    /// Close an opened destination or subscription; consumes the handle
    async fn close(&self, destination: DestinationHandle) -> Result<(), DriverError>;

    /// Retrieve one message; an empty destination yields `NO_MSG_AVAILABLE`
    async fn get(
        &self,
        destination: &DestinationHandle,
        options: &GetOptions,
    ) -> Result<RawMessage, DriverError>;

    /// Put one message
    async fn put(
        &self,
        destination: &DestinationHandle,
        payload: Bytes,
        options: &PutOptions,
    ) -> Result<PutOutcome, DriverError>;
}
