//! Configuration management for the Turnstile service.
//!
//! Process configuration only. Throttle limits live in
//! [`ThrottleSettings`](crate::settings::ThrottleSettings) and change at runtime.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::users::UserEntry;

/// Prefix of environment variables read by [`TurnstileConfig::load`],
/// e.g. `TURNSTILE__SERVER__LISTEN_ADDR`.
pub const CONFIG_ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Initial throttle settings
    #[serde(default)]
    pub settings: SettingsConfig,

    /// Audit queue configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Known users and their credentials
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Token required on `/admin` routes; open when unset
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Take the client address from `X-Forwarded-For`
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_token: None,
            trust_forwarded_for: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8081)
}

/// Which counter store backs the throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Per-process counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix of every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for one store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the memory store drops expired counters, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl StoreConfig {
    /// Store call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_purge_interval() -> u64 {
    60
}

/// Where the initial throttle settings come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// YAML file with [`ThrottleSettings`](crate::settings::ThrottleSettings)
    pub path: Option<String>,
}

/// Audit queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Events held before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    crate::audit::DEFAULT_QUEUE_CAPACITY
}

impl TurnstileConfig {
    /// Load configuration from an optional file, then `TURNSTILE__*`
    /// environment variables, over the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| TurnstileError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();

        assert_eq!(config.server.listen_addr.port(), 8081);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_millis(100));
        assert_eq!(config.audit.queue_capacity, 4096);
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: TurnstileConfig = serde_yaml::from_str(
            r#"
store:
  backend: redis
  redis_url: redis://cache:6379
users:
  - id: 1
    username: root
    api_tokens: [glpat-root]
"#,
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379");
        assert_eq!(config.store.key_prefix, "turnstile");
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.users[0].api_tokens, vec!["glpat-root".to_string()]);
    }

    #[test]
    fn test_load_without_file() {
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.store.key_prefix, "turnstile");
    }
}
