// src/algorithms/token_bucket.rs

use crate::algorithms::{
    check_rate, engine_builders, read_bucket_state, reply_pair, stored_count, write_bucket_state,
    BucketArgs, Decision, EngineCore, RateLimitAlgorithm,
};
use crate::config::{BucketConfig, RateLimiterConfig};
use crate::error::Result;
use crate::keys::bucket_key;
use crate::storage::{key_at, AtomicScript, Keyspace, StorageBackend};
use async_trait::async_trait;
use redis::Value;
use tracing::debug;

/// KEYS[1] = bucket hash {level, last_update}
/// ARGV = capacity, rate (tokens/s), cost, now (unix s), ttl buffer (s)
///
/// Returns {1, level after paying} or {0, level available}.
const TOKEN_BUCKET_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local buffer = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'level', 'last_update')
local level = tonumber(state[1])
local last_update = tonumber(state[2])
if level == nil then
    level = capacity
end
if last_update == nil then
    last_update = now
end

local refill = math.floor(math.max(0, now - last_update) * rate)
local new_level = math.min(capacity, level + refill)

if new_level >= cost then
    local final_level = new_level - cost
    redis.call('HSET', KEYS[1], 'level', final_level, 'last_update', now)
    redis.call('EXPIRE', KEYS[1], math.ceil((capacity - final_level) / rate) + buffer)
    return {1, final_level}
end
return {0, new_level}
"#;

pub(crate) static TOKEN_BUCKET_HIT: AtomicScript = AtomicScript {
    name: "token_bucket_hit",
    lua: TOKEN_BUCKET_LUA,
    native: token_bucket_native,
};

fn token_bucket_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> Result<Value> {
    let name = TOKEN_BUCKET_HIT.name;
    let key = key_at(keys, 0, name)?;
    let BucketArgs {
        capacity,
        rate,
        cost,
        now,
        buffer,
    } = BucketArgs::decode(args, name)?;

    // a fresh bucket starts full
    let (level, last_update) = read_bucket_state(ks, key)?;
    let level = level.unwrap_or(capacity);
    let last_update = last_update.unwrap_or(now);

    let refill = ((now - last_update).max(0.0) * rate).floor();
    let new_level = capacity.min(level + refill);

    if new_level >= cost {
        let final_level = new_level - cost;
        let ttl = ((capacity - final_level) / rate).ceil() + buffer;
        write_bucket_state(ks, key, final_level, now, ttl)?;
        return Ok(Value::Array(vec![
            Value::Int(1),
            Value::Int(final_level as i64),
        ]));
    }
    Ok(Value::Array(vec![Value::Int(0), Value::Int(new_level as i64)]))
}

/// Token Bucket rate limiting algorithm
///
/// The token bucket algorithm works by maintaining a "bucket" of tokens that are
/// replenished at a constant rate. Each request consumes tokens, and if there
/// are not enough tokens available, the request is rejected.
///
/// Refill is computed lazily inside the script from the time elapsed since the
/// last admitted hit; nothing runs between hits.
#[derive(Debug, Clone)]
pub struct TokenBucket<S>
where
    S: StorageBackend,
{
    core: EngineCore<S>,

    /// TTL buffer and deny hint
    bucket: BucketConfig,
}

engine_builders!(TokenBucket);

impl<S> TokenBucket<S>
where
    S: StorageBackend,
{
    /// Creates a new token bucket with the given storage and configuration
    pub fn new(storage: S, config: RateLimiterConfig) -> Self {
        Self {
            core: EngineCore::new(storage, &config),
            bucket: BucketConfig::default(),
        }
    }

    pub fn with_bucket_config(mut self, bucket: BucketConfig) -> Self {
        self.bucket = bucket;
        self
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for TokenBucket<S>
where
    S: StorageBackend,
{
    /// Tokens refilled per second
    type Scale = f64;

    fn name(&self) -> &'static str {
        "token_bucket"
    }

    async fn hit(&self, key: &str, rate: f64, capacity: u64, cost: u64) -> Result<Decision> {
        check_rate(rate)?;
        let keys = [bucket_key(&self.core.prefix, key)];
        let args = BucketArgs::encode(
            capacity,
            rate,
            cost,
            self.core.clock.now_secs(),
            self.bucket.ttl_buffer,
        );

        let reply = self
            .core
            .bounded(
                TOKEN_BUCKET_HIT.name,
                self.core.storage.eval(&TOKEN_BUCKET_HIT, &keys, &args),
            )
            .await?;

        let decision = match reply_pair(&reply, TOKEN_BUCKET_HIT.name)? {
            (1, level) => Decision::Allow {
                count: level.max(0) as u64,
            },
            (_, available) => {
                // Fixed hint, not the time until `cost` tokens are back
                debug!(key, available, cost, "Token bucket short of tokens");
                Decision::Deny {
                    retry_after: self.bucket.deny_retry_after,
                }
            }
        };
        crate::rate_limit_event!(self.name(), key, &decision);
        Ok(decision)
    }

    async fn get(&self, key: &str, _rate: f64) -> Result<u64> {
        let bucket = bucket_key(&self.core.prefix, key);
        let raw = self
            .core
            .bounded("token_bucket_get", self.core.storage.hget(&bucket, "level"))
            .await?;
        stored_count(raw, &bucket)
    }
}
