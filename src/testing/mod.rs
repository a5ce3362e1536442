//! Testing utilities and mock implementations
//!
//! This module provides mock handlers and log capture for exercising
//! consumers and producers against the in-memory broker.

pub mod logs;
pub mod mocks;

pub use logs::{capture_logs, CapturedEvent, LogCapture};
pub use mocks::*;
