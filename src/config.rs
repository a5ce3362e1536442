//! Configuration system for the broker bridge
//!
//! Connection and destination parameters are loaded once from TOML and stay
//! immutable for the lifetime of the sessions built from them. Credentials may
//! be supplied indirectly through environment variables.

use crate::transport::DestinationKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Service name reported by the health probe when none is configured
pub const DEFAULT_SERVICE_NAME: &str = "ibmmq";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub broker: DestinationConfig,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// Connection parameters shared by every session
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Broker address, `host(port)` or a `mqtt://` URL
    pub connection_name: String,
    /// Application name presented to the broker and used by the health probe
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Queue manager to connect to
    pub manager_name: String,
    /// Server-connection channel
    pub channel_name: String,
    #[serde(default)]
    pub user: String,
    /// May be empty for unauthenticated brokers
    #[serde(default)]
    pub password: String,
    /// Environment variable overriding `user`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_env: Option<String>,
    /// Environment variable overriding `password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Wait between successive gets (default: 10000)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connection_name", &self.connection_name)
            .field("service_name", &self.service_name)
            .field("manager_name", &self.manager_name)
            .field("channel_name", &self.channel_name)
            .field("user", &self.user)
            .field("password", &"***")
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

/// Connection parameters plus the topic and/or queue to use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Topic string for publish/subscribe mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
    /// Queue name for point-to-point mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
}

/// Consumer section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerSection {
    /// Delivery mode the `run` command consumes from
    #[serde(default = "default_consumer_kind")]
    pub kind: DestinationKind,
    /// Validate payloads as JSON before delivering them
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            kind: default_consumer_kind(),
            json: default_json(),
        }
    }
}

/// Health probe section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    /// Probe deadline in milliseconds; 0 disables the deadline
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_timeout(),
        }
    }
}

/// HTTP server section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

fn default_poll_interval() -> u64 {
    10_000
}

fn default_consumer_kind() -> DestinationKind {
    DestinationKind::Topic
}

fn default_json() -> bool {
    true
}

fn default_health_timeout() -> u64 {
    4200
}

fn default_port() -> u16 {
    8089
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No {0} name configured")]
    MissingDestination(DestinationKind),
}

impl ConnectionConfig {
    /// Check field invariants: everything but the password must be present
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("connection_name", &self.connection_name),
            ("service_name", &self.service_name),
            ("manager_name", &self.manager_name),
            ("channel_name", &self.channel_name),
            ("user", &self.user),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "{field} must not be empty"
                )));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve credentials named by `user_env` / `password_env`
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(name) = &self.user_env {
            self.user = get_env_var_required(name)?;
        }
        if let Some(name) = &self.password_env {
            self.password = get_env_var_required(name)?;
        }
        Ok(())
    }
}

impl DestinationConfig {
    /// Destination name configured for a kind
    pub fn destination_name(&self, kind: DestinationKind) -> Result<&str, ConfigError> {
        let name = match kind {
            DestinationKind::Topic => self.topic_name.as_deref(),
            DestinationKind::Queue => self.queue_name.as_deref(),
        };
        name.filter(|n| !n.trim().is_empty())
            .ok_or(ConfigError::MissingDestination(kind))
    }
}

impl BridgeConfig {
    /// Load configuration from TOML file with environment variable resolution
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse, resolve and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = toml::from_str(content)?;
        config.broker.connection.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.connection.validate()?;
        self.broker.destination_name(self.consumer.kind)?;
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
connection_name = "localhost(1414)"
manager_name = "QM1"
channel_name = "DEV.APP.SVRCONN"
user = "app"
password = "passw0rd"
poll_interval_ms = 100
topic_name = "dev/"
queue_name = "DEV.QUEUE.1"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}
