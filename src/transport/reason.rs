//! Native reason codes carried by broker faults
//!
//! Reason codes are the primary diagnostic of every broker call. The numeric
//! values follow the queue-manager conventions so log lines stay comparable
//! with broker-side error logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer fault code returned by a broker driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReasonCode(pub i32);

impl ReasonCode {
    pub const NONE: ReasonCode = ReasonCode(0);
    pub const CONNECTION_BROKEN: ReasonCode = ReasonCode(2009);
    pub const GET_INHIBITED: ReasonCode = ReasonCode(2016);
    pub const HCONN_ERROR: ReasonCode = ReasonCode(2018);
    pub const HOBJ_ERROR: ReasonCode = ReasonCode(2019);
    pub const NO_MSG_AVAILABLE: ReasonCode = ReasonCode(2033);
    pub const NOT_AUTHORIZED: ReasonCode = ReasonCode(2035);
    pub const NOT_OPEN_FOR_INPUT: ReasonCode = ReasonCode(2037);
    pub const NOT_OPEN_FOR_OUTPUT: ReasonCode = ReasonCode(2039);
    pub const PUT_INHIBITED: ReasonCode = ReasonCode(2051);
    pub const Q_FULL: ReasonCode = ReasonCode(2053);
    pub const Q_MGR_NAME_ERROR: ReasonCode = ReasonCode(2058);
    pub const Q_MGR_NOT_AVAILABLE: ReasonCode = ReasonCode(2059);
    pub const UNKNOWN_OBJECT_NAME: ReasonCode = ReasonCode(2085);
    pub const HOST_NOT_AVAILABLE: ReasonCode = ReasonCode(2538);
    pub const UNKNOWN_CHANNEL_NAME: ReasonCode = ReasonCode(2540);
    pub const NO_SUBS_MATCHED: ReasonCode = ReasonCode(2550);

    /// Numeric value of the code
    pub fn value(self) -> i32 {
        self.0
    }

    /// Symbolic name, if the code is one the bridge knows about
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "MQRC_NONE",
            2009 => "MQRC_CONNECTION_BROKEN",
            2016 => "MQRC_GET_INHIBITED",
            2018 => "MQRC_HCONN_ERROR",
            2019 => "MQRC_HOBJ_ERROR",
            2033 => "MQRC_NO_MSG_AVAILABLE",
            2035 => "MQRC_NOT_AUTHORIZED",
            2037 => "MQRC_NOT_OPEN_FOR_INPUT",
            2039 => "MQRC_NOT_OPEN_FOR_OUTPUT",
            2051 => "MQRC_PUT_INHIBITED",
            2053 => "MQRC_Q_FULL",
            2058 => "MQRC_Q_MGR_NAME_ERROR",
            2059 => "MQRC_Q_MGR_NOT_AVAILABLE",
            2085 => "MQRC_UNKNOWN_OBJECT_NAME",
            2538 => "MQRC_HOST_NOT_AVAILABLE",
            2540 => "MQRC_UNKNOWN_CHANNEL_NAME",
            2550 => "MQRC_NO_SUBS_MATCHED",
            _ => return None,
        };
        Some(name)
    }

    /// "No message currently available" is not a fault
    pub fn is_no_message(self) -> bool {
        self == Self::NO_MSG_AVAILABLE
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<i32> for ReasonCode {
    fn from(value: i32) -> Self {
        ReasonCode(value)
    }
}
