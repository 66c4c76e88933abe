// src/algorithms/mod.rs

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

#[cfg(test)]
mod tests;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use super::clock::{Clock, SystemClock};
use super::config::RateLimiterConfig;
use super::error::{RateLimiterError, Result};
use super::storage::{with_timeout, StorageBackend};
use async_trait::async_trait;
use redis::Value;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a hit. A deny is a normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Admitted; `count` is the hit count (windows, leaky level) or the
    /// remaining level (token bucket) after this hit
    Allow { count: u64 },

    /// Refused; try again after `retry_after`
    Deny { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            Decision::Allow { count } => Some(*count),
            Decision::Deny { .. } => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Allow { .. } => None,
            Decision::Deny { retry_after } => Some(*retry_after),
        }
    }
}

/// Call surface shared by every engine
///
/// `Scale` is the window length for the window engines and the per-second
/// rate for the bucket engines. Every operation is one atomic round trip
/// bounded by the engine's timeout; nothing is retried.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync + Debug {
    type Scale: Copy + Send + Sync + Debug + 'static;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Count `increment` against `key` and decide
    async fn hit(
        &self,
        key: &str,
        scale: Self::Scale,
        limit: u64,
        increment: u64,
    ) -> Result<Decision>;

    /// Current count or level, 0 when nothing is stored
    async fn get(&self, key: &str, scale: Self::Scale) -> Result<u64>;
}

/// Extra operations of the window engines
#[async_trait]
pub trait WindowAlgorithm: RateLimitAlgorithm<Scale = Duration> {
    /// Add `increment` without deciding, returning the new count
    async fn inc(&self, key: &str, scale: Duration, increment: u64) -> Result<u64>;

    /// Overwrite the count of the current window
    async fn set(&self, key: &str, scale: Duration, count: u64) -> Result<u64>;
}

/// State every engine carries: the store handle, key namespace, deadline and clock
#[derive(Debug, Clone)]
pub(crate) struct EngineCore<S> {
    pub(crate) storage: S,
    pub(crate) prefix: String,
    pub(crate) timeout: Duration,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<S: StorageBackend> EngineCore<S> {
    pub(crate) fn new(storage: S, config: &RateLimiterConfig) -> Self {
        Self {
            storage,
            prefix: config.key_prefix.clone(),
            timeout: config.timeout,
            clock: Arc::new(SystemClock),
        }
    }

    pub(crate) async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_timeout(operation, self.timeout, fut).await
    }
}

/// Builder methods shared by every engine
macro_rules! engine_builders {
    ($engine:ident) => {
        impl<S: $crate::storage::StorageBackend> $engine<S> {
            /// Bound every store round trip by `timeout` instead of the configured one
            pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
                self.core.timeout = timeout;
                self
            }

            /// Namespace keys under `prefix` instead of the configured one
            pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
                self.core.prefix = prefix.into();
                self
            }

            /// Read time from `clock` instead of the system clock
            pub fn with_clock(mut self, clock: std::sync::Arc<dyn $crate::clock::Clock>) -> Self {
                self.core.clock = clock;
                self
            }
        }
    };
}
pub(crate) use engine_builders;

pub(crate) fn check_window(scale: Duration) -> Result<u64> {
    let scale_ms = u64::try_from(scale.as_millis()).map_err(|_| {
        RateLimiterError::Config(format!("window scale {:?} is too large", scale))
    })?;
    if scale_ms == 0 {
        return Err(RateLimiterError::Config(
            "window scale must be at least 1ms".to_string(),
        ));
    }
    Ok(scale_ms)
}

pub(crate) fn check_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(RateLimiterError::Config(format!(
            "bucket rate must be a positive number, got {}",
            rate
        )));
    }
    Ok(())
}

fn reply_int_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    }
}

/// Single integer reply
pub(crate) fn reply_int(value: &Value, script: &str) -> Result<i64> {
    reply_int_of(value).ok_or_else(|| {
        RateLimiterError::Protocol(format!("{} replied {:?}, expected an integer", script, value))
    })
}

/// `{flag, number}` reply
pub(crate) fn reply_pair(value: &Value, script: &str) -> Result<(i64, i64)> {
    match value {
        Value::Array(items) if items.len() == 2 => {
            match (reply_int_of(&items[0]), reply_int_of(&items[1])) {
                (Some(a), Some(b)) => Ok((a, b)),
                _ => Err(RateLimiterError::Protocol(format!(
                    "{} replied {:?}, expected two integers",
                    script, value
                ))),
            }
        }
        other => Err(RateLimiterError::Protocol(format!(
            "{} replied {:?}, expected a two-element array",
            script, other
        ))),
    }
}

/// Decode a stored counter or level, flooring fractional levels
pub(crate) fn stored_count(raw: Option<String>, key: &str) -> Result<u64> {
    match raw {
        None => Ok(0),
        Some(raw) => match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value.max(0.0).floor() as u64),
            _ => Err(RateLimiterError::Protocol(format!(
                "{} holds {:?}, expected a number",
                key, raw
            ))),
        },
    }
}

/// Arguments both bucket scripts take, in ARGV order
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketArgs {
    pub(crate) capacity: f64,
    pub(crate) rate: f64,
    pub(crate) cost: f64,
    pub(crate) now: f64,
    pub(crate) buffer: f64,
}

impl BucketArgs {
    pub(crate) fn encode(
        capacity: u64,
        rate: f64,
        cost: u64,
        now_secs: u64,
        buffer: Duration,
    ) -> [String; 5] {
        [
            capacity.to_string(),
            lua_number(rate),
            cost.to_string(),
            now_secs.to_string(),
            buffer.as_secs().to_string(),
        ]
    }

    pub(crate) fn decode(args: &[String], script: &str) -> Result<Self> {
        use crate::storage::arg_f64;
        Ok(Self {
            capacity: arg_f64(args, 0, script)?,
            rate: arg_f64(args, 1, script)?,
            cost: arg_f64(args, 2, script)?,
            now: arg_f64(args, 3, script)?,
            buffer: arg_f64(args, 4, script)?,
        })
    }
}

/// HMGET key level last_update, as numbers
pub(crate) fn read_bucket_state(
    ks: &mut crate::storage::Keyspace,
    key: &str,
) -> Result<(Option<f64>, Option<f64>)> {
    let level = ks.hget(key, "level")?.and_then(|raw| raw.parse::<f64>().ok());
    let last_update = ks
        .hget(key, "last_update")?
        .and_then(|raw| raw.parse::<f64>().ok());
    Ok((level, last_update))
}

/// HSET level/last_update and EXPIRE, as the bucket scripts do
pub(crate) fn write_bucket_state(
    ks: &mut crate::storage::Keyspace,
    key: &str,
    level: f64,
    now: f64,
    ttl_secs: f64,
) -> Result<()> {
    ks.hset(
        key,
        &[("level", lua_number(level)), ("last_update", lua_number(now))],
    )?;
    ks.pexpire(key, (ttl_secs.max(0.0) * 1000.0) as u64);
    Ok(())
}

/// Lua number formatting: integral values print without a fraction
pub(crate) fn lua_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod reply_tests {
    use super::*;

    #[test]
    fn test_reply_shapes() {
        let pair = Value::Array(vec![Value::Int(1), Value::Int(7)]);
        assert_eq!(reply_pair(&pair, "t").unwrap(), (1, 7));

        let bulk = Value::Array(vec![Value::Int(0), Value::BulkString(b"42".to_vec())]);
        assert_eq!(reply_pair(&bulk, "t").unwrap(), (0, 42));

        assert!(matches!(
            reply_pair(&Value::Int(1), "t"),
            Err(RateLimiterError::Protocol(_))
        ));
        assert!(matches!(
            reply_pair(&Value::Array(vec![Value::Nil, Value::Int(1)]), "t"),
            Err(RateLimiterError::Protocol(_))
        ));
        assert!(matches!(
            reply_int(&Value::Nil, "t"),
            Err(RateLimiterError::Protocol(_))
        ));
    }

    #[test]
    fn test_stored_count_decoding() {
        assert_eq!(stored_count(None, "k").unwrap(), 0);
        assert_eq!(stored_count(Some("5".into()), "k").unwrap(), 5);
        assert_eq!(stored_count(Some("2.75".into()), "k").unwrap(), 2);
        assert!(stored_count(Some("abc".into()), "k").is_err());
    }

    #[test]
    fn test_lua_number_formatting() {
        assert_eq!(lua_number(3.0), "3");
        assert_eq!(lua_number(2.5), "2.5");
    }

    #[test]
    fn test_decision_accessors() {
        let allow = Decision::Allow { count: 3 };
        assert!(allow.is_allowed());
        assert_eq!(allow.count(), Some(3));
        assert_eq!(allow.retry_after(), None);

        let deny = Decision::Deny {
            retry_after: Duration::from_millis(250),
        };
        assert!(!deny.is_allowed());
        assert_eq!(deny.retry_after(), Some(Duration::from_millis(250)));
    }
}
