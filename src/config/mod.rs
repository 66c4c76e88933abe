// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RateLimiterError, Result};

/// Common configuration for all rate limiting engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Key prefix to use for all keys in storage
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single round trip to the store
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            timeout: default_timeout(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Tunables shared by the token and leaky bucket engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Added on top of the computed bucket lifetime before it is handed to EXPIRE
    #[serde(default = "default_ttl_buffer", with = "duration_serde")]
    pub ttl_buffer: Duration,

    /// Retry hint returned with every bucket deny.
    ///
    /// This is a constant rather than the time until enough capacity frees up.
    #[serde(default = "default_deny_retry_after", with = "duration_serde")]
    pub deny_retry_after: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            ttl_buffer: default_ttl_buffer(),
            deny_retry_after: default_deny_retry_after(),
        }
    }
}

fn default_ttl_buffer() -> Duration {
    Duration::from_secs(10)
}

fn default_deny_retry_after() -> Duration {
    Duration::from_millis(1000)
}

/// Configuration for Redis storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection timeout
    #[serde(default = "default_conn_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Configuration for in-memory storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Maximum number of entries to store
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Whether to use a background task for expiration
    #[serde(default = "default_use_background_task")]
    pub use_background_task: bool,

    /// How often to run the background expiration task
    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            use_background_task: default_use_background_task(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_max_entries() -> usize {
    10_000
}

fn default_use_background_task() -> bool {
    true
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for the legacy per-bucket backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyConfig {
    /// Prefix prepended to every record and index key
    #[serde(default = "default_legacy_prefix")]
    pub key_prefix: String,

    /// Lifetime of bucket records. Required; there is no safe default.
    #[serde(default, with = "option_duration_serde")]
    pub expiry: Option<Duration>,

    /// Seed nodes of a multi-node deployment. Empty means a single node.
    #[serde(default)]
    pub cluster_nodes: Vec<String>,

    /// COUNT hint passed to each SCAN step
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,

    /// Deadline for a single request to the backend
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl LegacyConfig {
    pub fn new(expiry: Duration) -> Self {
        Self {
            key_prefix: default_legacy_prefix(),
            expiry: Some(expiry),
            cluster_nodes: Vec::new(),
            scan_count: default_scan_count(),
            timeout: default_timeout(),
        }
    }

    /// Reject configurations the backend cannot run with.
    pub fn validate(&self) -> Result<Duration> {
        let expiry = self.expiry.ok_or_else(|| {
            RateLimiterError::Config("legacy backend requires an expiry".to_string())
        })?;
        if expiry.is_zero() {
            return Err(RateLimiterError::Config(
                "legacy backend expiry must be positive".to_string(),
            ));
        }
        if self.scan_count == 0 {
            return Err(RateLimiterError::Config(
                "scan_count must be at least 1".to_string(),
            ));
        }
        Ok(expiry)
    }
}

fn default_legacy_prefix() -> String {
    "ratelimit:legacy:".to_string()
}

fn default_scan_count() -> usize {
    100
}

// Helper module to serialize/deserialize Duration with serde
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
