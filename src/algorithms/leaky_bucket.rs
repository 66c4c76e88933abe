// src/algorithms/leaky_bucket.rs

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

/// KEYS[1] = bucket hash {level, last_update}
/// ARGV = capacity, rate (drained/s), cost, now (unix s), ttl buffer (s)
///
/// Returns {1, level after pouring} or {0, level}, both floored.
const LEAKY_BUCKET_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local buffer = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'level', 'last_update')
local level = tonumber(state[1])
local last_update = tonumber(state[2])
if level == nil then
    level = 0
end
if last_update == nil then
    last_update = now
end

local leaked = math.max(0, now - last_update) * rate
local new_level = math.max(0, level - leaked)

if new_level < capacity then
    new_level = new_level + cost
    redis.call('HSET', KEYS[1], 'level', new_level, 'last_update', now)
    redis.call('EXPIRE', KEYS[1], math.ceil(new_level / rate) + buffer)
    return {1, math.floor(new_level)}
end
return {0, math.floor(new_level)}
"#;

pub(crate) static LEAKY_BUCKET_HIT: AtomicScript = AtomicScript {
    name: "leaky_bucket_hit",
    lua: LEAKY_BUCKET_LUA,
    native: leaky_bucket_native,
};

fn leaky_bucket_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> Result<Value> {
    let name = LEAKY_BUCKET_HIT.name;
    let key = key_at(keys, 0, name)?;
    let BucketArgs {
        capacity,
        rate,
        cost,
        now,
        buffer,
    } = BucketArgs::decode(args, name)?;

    // a fresh bucket starts empty
    let (level, last_update) = read_bucket_state(ks, key)?;
    let level = level.unwrap_or(0.0);
    let last_update = last_update.unwrap_or(now);

    let leaked = (now - last_update).max(0.0) * rate;
    let new_level = (level - leaked).max(0.0);

    if new_level < capacity {
        let poured = new_level + cost;
        let ttl = (poured / rate).ceil() + buffer;
        write_bucket_state(ks, key, poured, now, ttl)?;
        return Ok(Value::Array(vec![
            Value::Int(1),
            Value::Int(poured.floor() as i64),
        ]));
    }
    Ok(Value::Array(vec![
        Value::Int(0),
        Value::Int(new_level.floor() as i64),
    ]))
}

/// Leaky Bucket rate limiting algorithm
///
/// Each admitted hit pours `cost` into the bucket, which drains at `rate` per
/// second. A hit is refused while the drained level is still at capacity.
/// Admission only checks the level before pouring, so one hit may overfill
/// the bucket by up to `cost - 1`.
#[derive(Debug, Clone)]
pub struct LeakyBucket<S>
where
    S: StorageBackend,
{
    core: EngineCore<S>,
    bucket: BucketConfig,
}

engine_builders!(LeakyBucket);

impl<S> LeakyBucket<S>
where
    S: StorageBackend,
{
    /// Creates a new leaky bucket with the given storage and configuration
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
impl<S> RateLimitAlgorithm for LeakyBucket<S>
where
    S: StorageBackend,
{
    /// Units drained per second
    type Scale = f64;

    fn name(&self) -> &'static str {
        "leaky_bucket"
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
                LEAKY_BUCKET_HIT.name,
                self.core.storage.eval(&LEAKY_BUCKET_HIT, &keys, &args),
            )
            .await?;

        let decision = match reply_pair(&reply, LEAKY_BUCKET_HIT.name)? {
            (1, level) => Decision::Allow {
                count: level.max(0) as u64,
            },
            _ => Decision::Deny {
                retry_after: self.bucket.deny_retry_after,
            },
        };
        crate::rate_limit_event!(self.name(), key, &decision);
        Ok(decision)
    }

    async fn get(&self, key: &str, _rate: f64) -> Result<u64> {
        let bucket = bucket_key(&self.core.prefix, key);
        let raw = self
            .core
            .bounded("leaky_bucket_get", self.core.storage.hget(&bucket, "level"))
            .await?;
        stored_count(raw, &bucket)
    }
}
