use crate::lock::RedlockSettings;
use crate::types::{InstanceId, InstanceIdError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Generated per process when absent
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            identifier: None,
            prefix: default_prefix(),
        }
    }
}

impl InstanceConfig {
    /// Configured identifier, or a fresh one
    pub fn instance_id(&self) -> Result<InstanceId, InstanceIdError> {
        match &self.identifier {
            Some(identifier) => identifier.parse(),
            None => Ok(InstanceId::generate()),
        }
    }
}

/// Redis endpoints as `host:port`; empty means the in-process broker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubSubConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock nodes; empty means the pub/sub endpoints
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_drift_factor")]
    pub drift_factor: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_ms: default_lock_timeout_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            drift_factor: default_drift_factor(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn redlock_settings(&self) -> RedlockSettings {
        RedlockSettings {
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            drift_factor: self.drift_factor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_disconnect_delay_ms")]
    pub disconnect_delay_ms: u64,
    /// Awareness states not renewed for this long are dropped
    #[serde(default = "default_awareness_timeout_ms")]
    pub awareness_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            disconnect_delay_ms: default_disconnect_delay_ms(),
            awareness_timeout_ms: default_awareness_timeout_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_delay_ms)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_millis(self.awareness_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_debounce_ms")]
    pub max_debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_debounce_ms: default_max_debounce_ms(),
        }
    }
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_debounce(&self) -> Duration {
        Duration::from_millis(self.max_debounce_ms.max(self.debounce_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_client_addr")]
    pub client_addr: String,
    /// Outgoing frames queued per client socket before it is dropped
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_addr: default_client_addr(),
            client_queue_capacity: default_client_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file; in-memory storage when absent
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_sqlite_cache_size")]
    pub sqlite_cache_size: i32,
    #[serde(default = "default_sqlite_busy_timeout")]
    pub sqlite_busy_timeout: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            sqlite_cache_size: default_sqlite_cache_size(),
            sqlite_busy_timeout: default_sqlite_busy_timeout(),
        }
    }
}

fn default_prefix() -> String {
    "docsync".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_retry_count() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_drift_factor() -> f64 {
    0.01
}

fn default_disconnect_delay_ms() -> u64 {
    1000
}

fn default_awareness_timeout_ms() -> u64 {
    crate::awareness::DEFAULT_OUTDATED_TIMEOUT.as_millis() as u64
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_max_debounce_ms() -> u64 {
    10000
}

fn default_client_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_client_queue_capacity() -> usize {
    crate::api::DEFAULT_QUEUE_CAPACITY
}

fn default_sqlite_cache_size() -> i32 {
    10000
}

fn default_sqlite_busy_timeout() -> i32 {
    5000
}

impl Config {
    /// Read `path` (any format the config crate knows), then apply
    /// `DOCSYNC__SECTION__KEY` environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("DOCSYNC")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pubsub.endpoints")
                    .with_list_parse_key("lock.endpoints")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
