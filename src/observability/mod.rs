//! Observability: structured logging and the health HTTP surface

pub mod health;
pub mod logging;

// Re-export for convenience
pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogController, LogFormat, LogLevelError};

// Span macro for structured logging
pub use logging::broker_span;
