// src/algorithms/sliding_window.rs

use crate::algorithms::{
    check_window, engine_builders, reply_int, reply_pair, Decision, EngineCore,
    RateLimitAlgorithm, WindowAlgorithm,
};
use crate::config::RateLimiterConfig;
use crate::error::Result;
use crate::keys::window_key;
use crate::storage::{arg_i64, arg_str, key_at, AtomicScript, Keyspace, StorageBackend};
use async_trait::async_trait;
use redis::Value;
use std::time::Duration;
use uuid::Uuid;

/// KEYS[1] = sliding log
/// ARGV[1] = window length (ms)
/// ARGV[2] = limit
/// ARGV[3] = entries to add when admitted
/// ARGV[4] = unique member tag
///
/// Returns {1, count} when admitted, {0, ms until the log expires} otherwise.
const SLIDING_HIT_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local increment = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', KEYS[1])

if count < limit then
    for i = 1, increment do
        redis.call('ZADD', KEYS[1], now, ARGV[4] .. ':' .. i)
    end
    redis.call('PEXPIRE', KEYS[1], window)
    return {1, count + increment}
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then
    ttl = window
end
return {0, ttl}
"#;

/// KEYS[1] = sliding log
/// ARGV[1] = window length (ms)
/// ARGV[2] = entries to add
/// ARGV[3] = unique member tag
/// ARGV[4] = "1" to replace the log instead of appending
///
/// Returns the log's cardinality afterwards.
const SLIDING_ADD_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

if ARGV[4] == '1' then
    redis.call('DEL', KEYS[1])
end
for i = 1, tonumber(ARGV[2]) do
    redis.call('ZADD', KEYS[1], now, ARGV[3] .. ':' .. i)
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return redis.call('ZCARD', KEYS[1])
"#;

pub(crate) static SLIDING_HIT: AtomicScript = AtomicScript {
    name: "sliding_window_hit",
    lua: SLIDING_HIT_LUA,
    native: sliding_hit_native,
};

pub(crate) static SLIDING_ADD: AtomicScript = AtomicScript {
    name: "sliding_window_add",
    lua: SLIDING_ADD_LUA,
    native: sliding_add_native,
};

fn sliding_hit_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> Result<Value> {
    let name = SLIDING_HIT.name;
    let key = key_at(keys, 0, name)?;
    let window = arg_i64(args, 0, name)?;
    let limit = arg_i64(args, 1, name)?;
    let increment = arg_i64(args, 2, name)?;
    let tag = arg_str(args, 3, name)?;

    let now = ks.now_ms() as i64;
    ks.zrem_scored_before(key, (now - window) as f64)?;
    let count = ks.zcard(key)? as i64;

    if count < limit {
        for i in 1..=increment {
            ks.zadd(key, now as f64, &format!("{}:{}", tag, i))?;
        }
        ks.pexpire(key, window.max(1) as u64);
        return Ok(Value::Array(vec![Value::Int(1), Value::Int(count + increment)]));
    }

    let mut ttl = ks.pttl(key);
    if ttl <= 0 {
        ttl = window;
    }
    Ok(Value::Array(vec![Value::Int(0), Value::Int(ttl)]))
}

fn sliding_add_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> Result<Value> {
    let name = SLIDING_ADD.name;
    let key = key_at(keys, 0, name)?;
    let window = arg_i64(args, 0, name)?;
    let entries = arg_i64(args, 1, name)?;
    let tag = arg_str(args, 2, name)?;
    let replace = arg_str(args, 3, name)? == "1";

    let now = ks.now_ms() as f64;
    if replace {
        ks.del(key);
    }
    for i in 1..=entries {
        ks.zadd(key, now, &format!("{}:{}", tag, i))?;
    }
    ks.pexpire(key, window.max(1) as u64);
    Ok(Value::Int(ks.zcard(key)? as i64))
}

/// Sliding Window rate limiting algorithm
///
/// Keeps one sorted-set entry per admitted hit, scored by the store's own
/// clock. Entries older than the window are pruned inside the same script
/// that counts and admits, so the count a caller sees is exact.
///
/// `get` reads the cardinality without pruning and may overcount until the
/// next write.
#[derive(Debug, Clone)]
pub struct SlidingWindow<S>
where
    S: StorageBackend,
{
    core: EngineCore<S>,
}

engine_builders!(SlidingWindow);

impl<S> SlidingWindow<S>
where
    S: StorageBackend,
{
    /// Creates a new sliding window with the given storage and configuration
    pub fn new(storage: S, config: RateLimiterConfig) -> Self {
        Self {
            core: EngineCore::new(storage, &config),
        }
    }

    /// The log key; windows of different lengths on the same caller key
    /// keep separate logs
    fn log_key(&self, key: &str, scale_ms: u64) -> String {
        window_key(&self.core.prefix, key, scale_ms)
    }

    /// Tag that keeps this call's members distinct from every other call's
    fn member_tag() -> String {
        Uuid::new_v4().simple().to_string()
    }

    async fn add_entries(&self, key: &str, scale: Duration, entries: u64, replace: bool) -> Result<u64> {
        let scale_ms = check_window(scale)?;
        let keys = [self.log_key(key, scale_ms)];
        let args = [
            scale_ms.to_string(),
            entries.to_string(),
            Self::member_tag(),
            if replace { "1" } else { "0" }.to_string(),
        ];

        let reply = self
            .core
            .bounded(
                SLIDING_ADD.name,
                self.core.storage.eval(&SLIDING_ADD, &keys, &args),
            )
            .await?;
        Ok(reply_int(&reply, SLIDING_ADD.name)?.max(0) as u64)
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for SlidingWindow<S>
where
    S: StorageBackend,
{
    type Scale = Duration;

    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn hit(&self, key: &str, scale: Duration, limit: u64, increment: u64) -> Result<Decision> {
        let scale_ms = check_window(scale)?;
        let keys = [self.log_key(key, scale_ms)];
        let args = [
            scale_ms.to_string(),
            limit.to_string(),
            increment.to_string(),
            Self::member_tag(),
        ];

        let reply = self
            .core
            .bounded(
                SLIDING_HIT.name,
                self.core.storage.eval(&SLIDING_HIT, &keys, &args),
            )
            .await?;

        let decision = match reply_pair(&reply, SLIDING_HIT.name)? {
            (1, count) => Decision::Allow {
                count: count.max(0) as u64,
            },
            (_, ttl_ms) => Decision::Deny {
                retry_after: Duration::from_millis(ttl_ms.max(1) as u64),
            },
        };
        crate::rate_limit_event!(self.name(), key, &decision);
        Ok(decision)
    }

    async fn get(&self, key: &str, scale: Duration) -> Result<u64> {
        let scale_ms = check_window(scale)?;
        let log_key = self.log_key(key, scale_ms);
        self.core
            .bounded("sliding_window_get", self.core.storage.zcard(&log_key))
            .await
    }
}

#[async_trait]
impl<S> WindowAlgorithm for SlidingWindow<S>
where
    S: StorageBackend,
{
    async fn inc(&self, key: &str, scale: Duration, increment: u64) -> Result<u64> {
        self.add_entries(key, scale, increment, false).await
    }

    async fn set(&self, key: &str, scale: Duration, count: u64) -> Result<u64> {
        self.add_entries(key, scale, count, true).await
    }
}
