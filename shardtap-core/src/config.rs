use crate::transport::RetryPolicy;
use crate::{Result, TapError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://sdb.amazonaws.com";
pub const DEFAULT_MAX_THREADS: usize = 100;
/// The store's own per-request limit for batch puts.
pub const MAX_BATCH_SIZE: usize = 25;

/// How to reach and authenticate against the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    /// Connection pool capacity; keep it at least as large as the number of
    /// concurrent callers sharing the transport.
    #[serde(default = "default_max_threads")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl StoreConfig {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            endpoint: default_endpoint(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            max_connections: default_max_threads(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
            retry: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_key_id.trim().is_empty() {
            return Err(TapError::Config("access_key_id cannot be empty".to_string()));
        }
        if self.secret_access_key.is_empty() {
            return Err(TapError::Config(
                "secret_access_key cannot be empty".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(TapError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_connection_retries: default_max_connection_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_connection_retries: self.max_connection_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(TapError::Config(format!(
                "retry.jitter must be a non-negative number, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// Describes one logical table and how jobs read from and write to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub domain: String,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Record field that carries the item name.
    pub item_field: String,
    /// Record fields stored as attributes, in schema order.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Optional select predicate applied when reading.
    #[serde(default)]
    pub query: Option<String>,
    /// Optional cap on the number of rows read across all shards.
    #[serde(default)]
    pub row_limit: Option<u64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_threads")]
    pub max_workers: usize,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl TableConfig {
    pub fn new(domain: impl Into<String>, shard_count: u32, item_field: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            shard_count,
            item_field: item_field.into(),
            fields: Vec::new(),
            query: None,
            row_limit: None,
            batch_size: default_batch_size(),
            max_workers: default_max_threads(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// The select predicate, ignoring blank strings.
    pub fn query(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(TapError::Config("domain cannot be empty".to_string()));
        }
        if self.shard_count == 0 {
            return Err(TapError::Config(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.item_field.trim().is_empty() {
            return Err(TapError::Config("item_field cannot be empty".to_string()));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(TapError::Config(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.max_workers == 0 {
            return Err(TapError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_max_threads() -> usize {
    DEFAULT_MAX_THREADS
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    format!("shardtap/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_retries() -> u32 {
    10
}

fn default_max_connection_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    100_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_shard_count() -> u32 {
    1
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

// Must stay below whatever deadline the host job enforces on a task.
fn default_close_timeout_ms() -> u64 {
    300_000
}
