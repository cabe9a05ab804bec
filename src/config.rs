//! Gateway configuration.
//!
//! All durations are stored in milliseconds so the structs round-trip through
//! YAML without custom serializers; use the `Duration` accessors in code.
//!
//! ```rust,ignore
//! use graphql_stream_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_yaml_str(r#"
//! listen_addr: "127.0.0.1:3002"
//! subscriptions:
//!   heartbeat_interval_ms: 300
//! batching:
//!   enabled: true
//!   max_entries_per_batch: 5
//! "#)?;
//! ```

use crate::error::{Error, Result};
use crate::operation::OperationKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Header carrying the version of the generation that served a request.
pub const CONFIG_VERSION_HEADER: &str = "x-router-config-version";

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address the binary listens on (default: `0.0.0.0:3002`)
    pub listen_addr: String,
    /// Path serving GraphQL over HTTP and WebSocket (default: `/graphql`)
    pub graphql_path: String,
    /// Whether responses carry `X-Router-Config-Version` (default: `true`)
    pub set_config_version_header: bool,
    pub subscriptions: SubscriptionConfig,
    pub shutdown: ShutdownConfig,
    pub batching: BatchingConfig,
    pub security: SecurityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3002".to_string(),
            graphql_path: "/graphql".to_string(),
            set_config_version_header: true,
            subscriptions: SubscriptionConfig::default(),
            shutdown: ShutdownConfig::default(),
            batching: BatchingConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.graphql_path.starts_with('/') {
            return Err(Error::Config(format!(
                "graphql_path must start with '/': {}",
                self.graphql_path
            )));
        }
        if self.subscriptions.heartbeat_interval_ms == 0 {
            return Err(Error::Config(
                "subscriptions.heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        if self.subscriptions.channel_capacity == 0 {
            return Err(Error::Config(
                "subscriptions.channel_capacity must be greater than 0".into(),
            ));
        }
        if self.batching.enabled && self.batching.max_concurrency == 0 {
            return Err(Error::Config(
                "batching.max_concurrency must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.subscriptions.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.shutdown.grace_period_ms = grace_period.as_millis() as u64;
        self
    }

    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }
}

/// Streaming subscription settings shared by every transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Heartbeat interval for SSE and multipart streams (default: 5 seconds)
    pub heartbeat_interval_ms: u64,
    /// WebSocket `connection_init` timeout (default: 10 seconds)
    pub connection_init_timeout_ms: u64,
    /// Legacy `graphql-ws` keep-alive interval (default: 15 seconds)
    pub keep_alive_interval_ms: u64,
    /// Maximum number of concurrent subscriptions per WebSocket (default: 100)
    pub max_subscriptions_per_connection: usize,
    /// Whether WebSocket clients must send `connection_init` (default: true)
    pub require_connection_init: bool,
    /// Capacity of the per-session outbound frame queue (default: 32)
    pub channel_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            connection_init_timeout_ms: 10_000,
            keep_alive_interval_ms: 15_000,
            max_subscriptions_per_connection: 100,
            require_connection_init: true,
            channel_capacity: 32,
        }
    }
}

impl SubscriptionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_init_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_init_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

/// Shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Maximum time to wait for in-flight requests (default: 30 seconds)
    pub grace_period_ms: u64,
    /// Whether to handle OS signals (SIGTERM, SIGINT) automatically (default: true)
    pub handle_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 30_000,
            handle_signals: true,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Request batching: a JSON array body fans out over the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub enabled: bool,
    /// Maximum entries in one batch, `0` means unlimited (default: 100)
    pub max_entries_per_batch: usize,
    /// Entries executed concurrently (default: 10)
    pub max_concurrency: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries_per_batch: 100,
            max_concurrency: 10,
        }
    }
}

/// Operation type blocking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub block_subscriptions: bool,
    pub block_mutations: bool,
}

impl SecurityConfig {
    /// The rejection for `kind`, if that operation type is blocked.
    pub fn blocked(&self, kind: OperationKind) -> Option<Error> {
        match kind {
            OperationKind::Subscription if self.block_subscriptions => Some(Error::Blocked(kind.as_str())),
            OperationKind::Mutation if self.block_mutations => Some(Error::Blocked(kind.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.graphql_path, "/graphql");
        assert!(config.set_config_version_header);
        assert_eq!(config.subscriptions.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.shutdown.grace_period(), Duration::from_secs(30));
        assert!(!config.batching.enabled);
        assert!(!config.security.block_subscriptions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = GatewayConfig::from_yaml_str(
            r#"
subscriptions:
  heartbeat_interval_ms: 300
shutdown:
  grace_period_ms: 1500
batching:
  enabled: true
  max_entries_per_batch: 5
security:
  block_subscriptions: true
"#,
        )
        .unwrap();

        assert_eq!(
            config.subscriptions.heartbeat_interval(),
            Duration::from_millis(300)
        );
        assert_eq!(config.subscriptions.max_subscriptions_per_connection, 100);
        assert_eq!(config.shutdown.grace_period(), Duration::from_millis(1500));
        assert!(config.shutdown.handle_signals);
        assert_eq!(config.batching.max_entries_per_batch, 5);
        assert_eq!(config.batching.max_concurrency, 10);
        assert!(config.security.block_subscriptions);
    }

    #[test]
    fn test_invalid_max_concurrency_rejected() {
        let err = GatewayConfig::from_yaml_str(
            r#"
batching:
  enabled: true
  max_concurrency: 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let err = GatewayConfig::from_yaml_str("subscriptions: [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_helpers() {
        let config = GatewayConfig::default()
            .with_heartbeat_interval(Duration::from_millis(250))
            .with_grace_period(Duration::from_millis(100));
        assert_eq!(config.subscriptions.heartbeat_interval_ms, 250);
        assert_eq!(config.shutdown.grace_period_ms, 100);
    }
}
