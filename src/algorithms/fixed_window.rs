// src/algorithms/fixed_window.rs

use crate::algorithms::{
    check_window, engine_builders, reply_int, Decision, EngineCore, RateLimitAlgorithm,
    WindowAlgorithm,
};
use crate::config::RateLimiterConfig;
use crate::error::Result;
use crate::keys::window_key;
use crate::storage::{arg_i64, key_at, AtomicScript, Keyspace, StorageBackend};
use async_trait::async_trait;
use redis::Value;
use std::time::Duration;

/// KEYS[1] = window counter
/// ARGV[1] = increment
/// ARGV[2] = milliseconds until the window ends
///
/// Returns the counter after the increment. The expiry is only set while the
/// key has none, so later hits never stretch the window.
const WINDOW_INCR_LUA: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

pub(crate) static WINDOW_INCR: AtomicScript = AtomicScript {
    name: "fixed_window_incr",
    lua: WINDOW_INCR_LUA,
    native: window_incr_native,
};

fn window_incr_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> Result<Value> {
    let name = WINDOW_INCR.name;
    let key = key_at(keys, 0, name)?;
    let increment = arg_i64(args, 0, name)?;
    let ttl_ms = arg_i64(args, 1, name)?;

    let count = ks.incr_by(key, increment)?;
    if ks.pttl(key) == -1 {
        ks.pexpire(key, ttl_ms.max(1) as u64);
    }
    Ok(Value::Int(count))
}

/// Fixed Window rate limiting algorithm
///
/// The fixed window algorithm divides time into fixed windows (e.g., 1 minute)
/// and limits the number of requests in each window. Each window has its own
/// counter key which the store expires when the window ends.
///
/// A burst straddling a window boundary can be admitted up to twice the limit
/// across the two windows.
#[derive(Debug, Clone)]
pub struct FixedWindow<S>
where
    S: StorageBackend,
{
    core: EngineCore<S>,
}

engine_builders!(FixedWindow);

/// Where the current window lives and how long it has left
struct WindowPosition {
    key: String,
    remaining_ms: u64,
}

impl<S> FixedWindow<S>
where
    S: StorageBackend,
{
    /// Creates a new fixed window with the given storage and configuration
    pub fn new(storage: S, config: RateLimiterConfig) -> Self {
        Self {
            core: EngineCore::new(storage, &config),
        }
    }

    /// Calculate the current window and the counter key that belongs to it
    fn current_window(&self, key: &str, scale: Duration) -> Result<WindowPosition> {
        let scale_ms = check_window(scale)?;
        let now = self.core.clock.now_ms();
        let index = now / scale_ms;
        let window_end = (index + 1) * scale_ms;

        Ok(WindowPosition {
            key: window_key(&self.core.prefix, key, index),
            remaining_ms: window_end - now,
        })
    }

    /// Increment the counter for the current window
    async fn increment_window_counter(&self, position: &WindowPosition, increment: u64) -> Result<u64> {
        let keys = [position.key.clone()];
        let args = [increment.to_string(), position.remaining_ms.to_string()];
        let reply = self
            .core
            .bounded(
                WINDOW_INCR.name,
                self.core.storage.eval(&WINDOW_INCR, &keys, &args),
            )
            .await?;

        Ok(reply_int(&reply, WINDOW_INCR.name)?.max(0) as u64)
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for FixedWindow<S>
where
    S: StorageBackend,
{
    type Scale = Duration;

    fn name(&self) -> &'static str {
        "fixed_window"
    }

    async fn hit(&self, key: &str, scale: Duration, limit: u64, increment: u64) -> Result<Decision> {
        let position = self.current_window(key, scale)?;
        let count = self.increment_window_counter(&position, increment).await?;

        let decision = if count <= limit {
            Decision::Allow { count }
        } else {
            Decision::Deny {
                retry_after: Duration::from_millis(position.remaining_ms),
            }
        };
        crate::rate_limit_event!(self.name(), key, &decision);
        Ok(decision)
    }

    async fn get(&self, key: &str, scale: Duration) -> Result<u64> {
        let position = self.current_window(key, scale)?;
        let raw = self
            .core
            .bounded("fixed_window_get", self.core.storage.get(&position.key))
            .await?;
        super::stored_count(raw, &position.key)
    }
}

#[async_trait]
impl<S> WindowAlgorithm for FixedWindow<S>
where
    S: StorageBackend,
{
    async fn inc(&self, key: &str, scale: Duration, increment: u64) -> Result<u64> {
        let position = self.current_window(key, scale)?;
        self.increment_window_counter(&position, increment).await
    }

    async fn set(&self, key: &str, scale: Duration, count: u64) -> Result<u64> {
        let position = self.current_window(key, scale)?;
        let ttl = Duration::from_millis(position.remaining_ms);
        self.core
            .bounded(
                "fixed_window_set",
                self.core
                    .storage
                    .set(&position.key, &count.to_string(), Some(ttl)),
            )
            .await?;
        Ok(count)
    }
}
