//! Structured logging system using tracing crate
//!
//! Provides contextual, machine-readable logging with a span macro for broker
//! operations and a runtime-adjustable level filter.
//!
//! ## Log Format Options
//!
//! The logging system supports three output formats controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Runtime level changes
//!
//! The level filter sits behind a reload layer. [`LogController::set_level`]
//! swaps it while the process runs; this is what `PATCH /log` calls.
//!
//! ```bash
//! # Production JSON logging
//! LOG_FORMAT=json LOG_LEVEL=INFO ./mqbridge run
//!
//! # Development with colors
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./mqbridge run
//! ```

use once_cell::sync::OnceCell;
use std::env;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

const NOISY_DEPENDENCIES: [&str; 4] = ["rumqttc=warn", "hyper=warn", "warp=warn", "tokio=warn"];

static FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Log output format options
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json, // Default to JSON for production
        }
    }
}

/// Runtime log level faults
#[derive(Debug, Error, PartialEq)]
pub enum LogLevelError {
    #[error("Unknown log level: {0}")]
    UnknownLevel(String),

    #[error("Failed to reload log filter: {0}")]
    Reload(String),
}

/// Parse a level name, case-insensitively
pub fn parse_level(level: &str) -> Result<Level, LogLevelError> {
    match level.trim().to_uppercase().as_str() {
        "ERROR" => Ok(Level::ERROR),
        "WARN" | "WARNING" => Ok(Level::WARN),
        "INFO" => Ok(Level::INFO),
        "DEBUG" => Ok(Level::DEBUG),
        "TRACE" => Ok(Level::TRACE),
        _ => Err(LogLevelError::UnknownLevel(level.to_string())),
    }
}

fn level_filter(level: Level) -> EnvFilter {
    NOISY_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration
///
/// A second call, or a call after another global subscriber was installed,
/// leaves the existing subscriber in place.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => level_filter(level),
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry().with(filter_layer);

    let installed = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events(include_spans)))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if installed.is_ok() {
        let _ = FILTER_HANDLE.set(handle);
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
    let level = parse_level(&log_level).unwrap_or(Level::INFO);

    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let log_format = LogFormat::parse(&format);

    let include_spans = env::var("LOG_SPANS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    init_logging(level, log_format, include_spans);
}

/// Adjusts the log level at runtime
#[derive(Debug, Clone)]
pub struct LogController {
    current: Arc<RwLock<Level>>,
}

impl LogController {
    pub fn new(initial: Level) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
        }
    }

    /// Level most recently applied through this controller
    pub fn level(&self) -> Level {
        self.current
            .read()
            .map(|level| *level)
            .unwrap_or(Level::INFO)
    }

    /// Parse `level` and swap the active filter when logging is installed
    pub fn set_level(&self, level: &str) -> Result<Level, LogLevelError> {
        let parsed = parse_level(level)?;

        if let Some(handle) = FILTER_HANDLE.get() {
            handle
                .reload(level_filter(parsed))
                .map_err(|e| LogLevelError::Reload(e.to_string()))?;
        }

        if let Ok(mut current) = self.current.write() {
            *current = parsed;
        }
        tracing::info!("Log level changed to {}", parsed);
        Ok(parsed)
    }
}

impl Default for LogController {
    fn default() -> Self {
        let level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|l| parse_level(&l).ok())
            .unwrap_or(Level::INFO);
        Self::new(level)
    }
}

/// Create a broker operation span
#[macro_export]
macro_rules! broker_span {
    ($($field:tt)*) => {
        tracing::info_span!("broker_operation", $($field)*)
    };
}

pub use broker_span;
