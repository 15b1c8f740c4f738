//! Client configuration.
//!
//! Loaded from TOML with every key optional; durations are written in
//! milliseconds under `*_ms` keys.
//!
//! ```toml
//! servers = ["10.0.0.1:9090", "10.0.0.2:9090"]
//! min_connections = 4
//! max_connections = 16
//! acquire_timeout_ms = 500
//! table_prefix = "staging_"
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{ClientError, ClientResult};
use crate::pool::PoolConfig;
use crate::transport::Endpoint;

/// Batch size used for every scanner fetch.
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 5000;

/// Rows sent per multi-row write.
pub const DEFAULT_PUT_CHUNK_SIZE: usize = 100;

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Configuration for `RowClient` and its pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Backend addresses as `host:port`.
    pub servers: Vec<String>,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Concurrent requests allowed per connection.
    pub max_in_flight: usize,
    #[serde(rename = "acquire_timeout_ms", deserialize_with = "millis")]
    pub acquire_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_timeout_ms", deserialize_with = "millis")]
    pub request_timeout: Duration,
    #[serde(rename = "maintenance_interval_ms", deserialize_with = "millis")]
    pub maintenance_interval: Duration,
    #[serde(rename = "poll_interval_ms", deserialize_with = "millis")]
    pub poll_interval: Duration,
    /// Prepended to every table name unless a request carries its own prefix.
    pub table_prefix: String,
    pub scan_batch_size: usize,
    pub put_chunk_size: usize,
    /// Extra attempts for retryable failures of point operations.
    pub max_retries: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        ClientConfig {
            servers: vec!["127.0.0.1:9090".to_string()],
            min_connections: pool.min_connections,
            max_connections: pool.max_connections,
            max_in_flight: pool.max_in_flight,
            acquire_timeout: pool.acquire_timeout,
            connect_timeout: pool.connect_timeout,
            request_timeout: pool.request_timeout,
            maintenance_interval: pool.maintenance_interval,
            poll_interval: pool.poll_interval,
            table_prefix: String::new(),
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            put_chunk_size: DEFAULT_PUT_CHUNK_SIZE,
            max_retries: 0,
        }
    }
}

impl ClientConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            toml::from_str(raw).map_err(|err| ClientError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.scan_batch_size == 0 || self.put_chunk_size == 0 {
            return Err(ClientError::config("scan_batch_size and put_chunk_size must be positive"));
        }
        self.pool_config()?.validate()
    }

    /// Derives the pool configuration, parsing server addresses.
    pub fn pool_config(&self) -> ClientResult<PoolConfig> {
        let endpoints = self
            .servers
            .iter()
            .map(|raw| Endpoint::parse(raw))
            .collect::<ClientResult<Vec<_>>>()?;
        Ok(PoolConfig {
            endpoints,
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            max_in_flight: self.max_in_flight,
            acquire_timeout: self.acquire_timeout,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            maintenance_interval: self.maintenance_interval,
            poll_interval: self.poll_interval,
        })
    }
}
