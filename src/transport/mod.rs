//! Transport layer for broker communication
//!
//! This module provides the broker driver abstraction, the session that
//! acquires and releases broker resources, and two drivers: an in-process
//! broker and an MQTT v5 bridge.

pub mod driver;
pub mod memory;
pub mod mqtt;
pub mod reason;
pub mod session;
pub mod topic;

pub use driver::{
    BrokerDriver, ConnectOptions, ConnectionHandle, DestinationHandle, DestinationKind,
    DriverError, GetOptions, OpenMode, PutOptions, PutOutcome, RawMessage,
};
pub use memory::{BrokerCall, BrokerStats, MemoryBroker};
pub use reason::ReasonCode;
pub use session::TransportSession;
