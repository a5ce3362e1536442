//! Error types for broker transport operations
//!
//! `TransportError` is the fault taxonomy of the transport client. Publish and
//! health faults are returned to callers; consumption faults are logged and
//! absorbed by the poll loop.

use crate::transport::{DestinationKind, ReasonCode};
use std::fmt;
use thiserror::Error;

/// Stage of a publish at which a fault occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    Connect,
    Open,
    Put,
}

impl fmt::Display for PublishStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStage::Connect => write!(f, "MQCONN"),
            PublishStage::Open => write!(f, "MQOPEN"),
            PublishStage::Put => write!(f, "MQPUT"),
        }
    }
}

/// Transport fault taxonomy
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("MQCONN to {manager} ended with reason code {reason}")]
    Connection { manager: String, reason: ReasonCode },

    #[error("MQOPEN of {kind} {destination} ended with reason code {reason}")]
    Open {
        destination: String,
        kind: DestinationKind,
        reason: ReasonCode,
    },

    #[error("No message available")]
    NoMessageAvailable,

    #[error("MQGET ended with reason code {reason}")]
    Get { reason: ReasonCode },

    #[error("Publish to {destination} failed in {stage} with reason code {reason}")]
    Publish {
        destination: String,
        stage: PublishStage,
        reason: ReasonCode,
    },

    #[error("Payload serialization failed: {message}")]
    Serialization { message: String },

    #[error("Timed out in: {timeout_ms} milliseconds")]
    Timeout { timeout_ms: u64 },

    #[error("No {0} name configured for publishing")]
    MissingDestination(DestinationKind),
}

impl TransportError {
    /// Reason code carried by the fault, if any
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            TransportError::Connection { reason, .. }
            | TransportError::Open { reason, .. }
            | TransportError::Get { reason }
            | TransportError::Publish { reason, .. } => Some(*reason),
            TransportError::NoMessageAvailable => Some(ReasonCode::NO_MSG_AVAILABLE),
            _ => None,
        }
    }

    /// Map a get fault, keeping "no message" distinct from real faults
    pub fn from_get(reason: ReasonCode) -> Self {
        if reason.is_no_message() {
            TransportError::NoMessageAvailable
        } else {
            TransportError::Get { reason }
        }
    }

    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

/// Failure reported by a message handler
#[derive(Debug, Error)]
#[error("Handler failed: {message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Crate-level error type
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Log level error: {0}")]
    LogLevel(#[from] crate::observability::logging::LogLevelError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Sanitize driver messages before they reach logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Ok(secrets) = regex::Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+") {
        sanitized = secrets.replace_all(&sanitized, "${1}=***").to_string();
    }

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
