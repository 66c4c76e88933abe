// src/legacy/mod.rs
//! Per-bucket counters keyed by (bucket index, identifier), with a bulk
//! delete that works on a single node or across a multi-node deployment.

mod server;

#[cfg(test)]
mod tests;

pub use server::LegacyHandle;

use redis::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use crate::algorithms::reply_int;
use crate::config::LegacyConfig;
use crate::error::{RateLimiterError, Result};
use crate::keys::{
    legacy_index_key, legacy_record_bucket, legacy_record_key, legacy_scan_pattern,
};
use crate::storage::{
    arg_i64, arg_str, key_at, with_timeout, AtomicScript, KeyScan, Keyspace, NodeConnector,
    NodeRouter, ScanProgress, StorageBackend, StoragePipeline,
};

/// KEYS[1] = bucket record, KEYS[2] = the identifier's index set
/// ARGV = bucket, id, increment, now, expiry (ms)
///
/// Creation writes every field, registers the record and sets both expiries
/// in one step, so no reader ever sees `count` without `created`/`updated`.
const COUNT_HIT_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('HSET', KEYS[1],
        'bucket', ARGV[1], 'id', ARGV[2], 'count', ARGV[3],
        'created', ARGV[4], 'updated', ARGV[4])
    redis.call('SADD', KEYS[2], KEYS[1])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
    redis.call('PEXPIRE', KEYS[2], ARGV[5])
    return tonumber(ARGV[3])
end
local count = redis.call('HINCRBY', KEYS[1], 'count', ARGV[3])
redis.call('HSET', KEYS[1], 'updated', ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
redis.call('PEXPIRE', KEYS[2], ARGV[5])
return count
"#;

pub(crate) static COUNT_HIT: AtomicScript = AtomicScript {
    name: "legacy_count_hit",
    lua: COUNT_HIT_LUA,
    native: count_hit_native,
};

fn count_hit_native(ks: &mut Keyspace, keys: &[String], args: &[String]) -> Result<Value> {
    let name = COUNT_HIT.name;
    let record = key_at(keys, 0, name)?;
    let index = key_at(keys, 1, name)?;
    let bucket = arg_str(args, 0, name)?;
    let id = arg_str(args, 1, name)?;
    let increment = arg_i64(args, 2, name)?;
    let now = arg_str(args, 3, name)?;
    let expiry_ms = arg_i64(args, 4, name)?.max(1) as u64;

    if !ks.exists(record) {
        ks.hset(
            record,
            &[
                ("bucket", bucket.to_string()),
                ("id", id.to_string()),
                ("count", increment.to_string()),
                ("created", now.to_string()),
                ("updated", now.to_string()),
            ],
        )?;
        ks.sadd(index, record)?;
        ks.pexpire(record, expiry_ms);
        ks.pexpire(index, expiry_ms);
        return Ok(Value::Int(increment));
    }

    let count = ks.hincr_by(record, "count", increment)?;
    ks.hset(record, &[("updated", now.to_string())])?;
    ks.pexpire(record, expiry_ms);
    ks.pexpire(index, expiry_ms);
    Ok(Value::Int(count))
}

/// One stored bucket counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub bucket: u64,
    pub id: String,
    pub count: u64,
    pub created: u64,
    pub updated: u64,
}

impl BucketRecord {
    /// Decode a record from its hash fields; `None` when any field is absent
    fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Option<Self>> {
        let (Some(bucket), Some(id), Some(count), Some(created), Some(updated)) = (
            fields.get("bucket"),
            fields.get("id"),
            fields.get("count"),
            fields.get("created"),
            fields.get("updated"),
        ) else {
            return Ok(None);
        };

        let number = |field: &str, raw: &str| {
            raw.parse::<u64>().map_err(|_| {
                RateLimiterError::Protocol(format!("{} field {} holds {:?}", key, field, raw))
            })
        };
        Ok(Some(Self {
            bucket: number("bucket", bucket)?,
            id: id.clone(),
            count: number("count", count)?,
            created: number("created", created)?,
            updated: number("updated", updated)?,
        }))
    }
}

/// Lifecycle of a [`LegacyBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    Idle,
    Connected,
    Serving,
    Stopped,
}

/// Bucket counter store.
///
/// Single-key operations go through a [`NodeRouter`], so on a multi-node
/// deployment they follow redirects to whichever node serves the key.
#[derive(Debug)]
pub struct LegacyBackend<S, C> {
    config: LegacyConfig,
    expiry: Duration,
    router: NodeRouter<S, C>,
    state: BackendState,
}

impl<S, C> LegacyBackend<S, C>
where
    S: StorageBackend,
    C: NodeConnector<S>,
{
    /// Validate `config` and wrap the primary connection. Fails when the
    /// mandatory expiry is missing.
    pub fn new(config: LegacyConfig, primary: S, connector: C) -> Result<Self> {
        let expiry = config.validate()?;
        Ok(Self {
            config,
            expiry,
            router: NodeRouter::new(primary, connector),
            state: BackendState::Idle,
        })
    }

    /// Validate, then check the store answers
    pub async fn connect(config: LegacyConfig, primary: S, connector: C) -> Result<Self> {
        let mut backend = Self::new(config, primary, connector)?;
        backend.open().await?;
        Ok(backend)
    }

    /// Idle -> Connected
    pub async fn open(&mut self) -> Result<()> {
        if self.state != BackendState::Idle {
            return Ok(());
        }
        with_timeout("legacy_ping", self.config.timeout, self.router.primary().ping()).await?;
        self.state = BackendState::Connected;
        info!(
            prefix = %self.config.key_prefix,
            multi_node = self.is_multi_node(),
            "Legacy backend connected"
        );
        Ok(())
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn config(&self) -> &LegacyConfig {
        &self.config
    }

    fn is_multi_node(&self) -> bool {
        !self.config.cluster_nodes.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            BackendState::Idle => Err(RateLimiterError::Config(
                "legacy backend is not connected".to_string(),
            )),
            BackendState::Stopped => Err(RateLimiterError::Stopped),
            BackendState::Connected | BackendState::Serving => Ok(()),
        }
    }

    /// Count `increment` hits against bucket `bucket` of `id` at time `now`,
    /// creating the record on first use. Returns the count afterwards.
    pub async fn count_hit(&self, bucket: u64, id: &str, now: u64, increment: u64) -> Result<u64> {
        self.ensure_open()?;
        let record = legacy_record_key(&self.config.key_prefix, id, bucket);
        let keys = [record.clone(), legacy_index_key(&self.config.key_prefix, id)];
        let args = [
            bucket.to_string(),
            id.to_string(),
            increment.to_string(),
            now.to_string(),
            (self.expiry.as_millis() as u64).to_string(),
        ];
        let (keys, args) = (&keys, &args);

        let reply = with_timeout(
            COUNT_HIT.name,
            self.config.timeout,
            self.router.route(&record, |conn: S| async move {
                conn.eval(&COUNT_HIT, keys, args).await
            }),
        )
        .await?;
        let count = reply_int(&reply, COUNT_HIT.name)?.max(0) as u64;
        debug!(key = %record, count, "Counted bucket hit");
        Ok(count)
    }

    /// Point read of one bucket record
    pub async fn get_bucket(&self, bucket: u64, id: &str) -> Result<Option<BucketRecord>> {
        self.ensure_open()?;
        let record = legacy_record_key(&self.config.key_prefix, id, bucket);
        let key = record.as_str();
        let fields = with_timeout(
            "legacy_get_bucket",
            self.config.timeout,
            self.router
                .route(key, |conn: S| async move { conn.hgetall(key).await }),
        )
        .await?;
        BucketRecord::from_fields(key, &fields)
    }

    /// Remove every live record of `id`, returning how many were deleted.
    /// The index set is removed too but not counted.
    pub async fn delete_buckets(&self, id: &str) -> Result<u64> {
        self.ensure_open()?;
        let deleted = if self.is_multi_node() {
            self.delete_across_nodes(id).await?
        } else {
            self.delete_on_primary(id).await?
        };
        info!(id, deleted, "Deleted buckets");
        Ok(deleted)
    }

    async fn delete_on_primary(&self, id: &str) -> Result<u64> {
        let primary = self.router.primary();
        let index = legacy_index_key(&self.config.key_prefix, id);
        let pattern = legacy_scan_pattern(&self.config.key_prefix, id);
        let mut scan = KeyScan::new(primary, pattern, self.config.scan_count);
        let mut deleted = 0;

        loop {
            let step = with_timeout("legacy_scan", self.config.timeout, scan.next_step()).await?;
            let batch = match step {
                ScanProgress::Matches(keys) => self.own_records(id, keys),
                ScanProgress::NoMatches => continue,
                ScanProgress::Exhausted => break,
            };
            if batch.is_empty() {
                continue;
            }

            let mut pipeline = primary.pipeline();
            pipeline
                .atomic()
                .delete(&batch)
                .remove_members(&index, &batch);
            let replies = with_timeout(
                "legacy_delete_batch",
                self.config.timeout,
                primary.execute_pipeline(pipeline),
            )
            .await?;
            let removed = match replies.first() {
                Some(reply) => reply_int(reply, "legacy_delete_batch")?.max(0) as u64,
                None => 0,
            };
            debug!(id, batch = batch.len(), removed, "Deleted bucket batch");
            deleted += removed;
        }

        with_timeout(
            "legacy_delete_index",
            self.config.timeout,
            primary.delete(std::slice::from_ref(&index)),
        )
        .await?;
        debug!(id, steps = scan.steps(), "Scan finished");
        Ok(deleted)
    }

    async fn delete_across_nodes(&self, id: &str) -> Result<u64> {
        let pattern = legacy_scan_pattern(&self.config.key_prefix, id);
        let found = self.collect_across_nodes(&pattern).await?;
        let found = self.own_records(id, found);
        debug!(id, keys = found.len(), "Collected bucket keys across nodes");

        let mut deleted = 0;
        for key in &found {
            let keys = std::slice::from_ref(key);
            deleted += with_timeout(
                "legacy_delete",
                self.config.timeout,
                self.router
                    .route(key, |conn: S| async move { conn.delete(keys).await }),
            )
            .await?;
        }

        let index = legacy_index_key(&self.config.key_prefix, id);
        let keys = std::slice::from_ref(&index);
        with_timeout(
            "legacy_delete_index",
            self.config.timeout,
            self.router
                .route(&index, |conn: S| async move { conn.delete(keys).await }),
        )
        .await?;
        Ok(deleted)
    }

    /// Matching keys on the primary, every seed node and every node a
    /// redirect has taught us about
    async fn collect_across_nodes(&self, pattern: &str) -> Result<BTreeSet<String>> {
        let mut found = BTreeSet::new();
        found.extend(self.scan_node(self.router.primary(), pattern).await?);

        let mut addrs: BTreeSet<String> = self.config.cluster_nodes.iter().cloned().collect();
        addrs.extend(self.router.cached_nodes().await);
        for addr in &addrs {
            let node = self.router.node(addr).await?;
            found.extend(self.scan_node(&node, pattern).await?);
        }
        Ok(found)
    }

    /// Drop scanned keys that belong to a different identifier sharing the
    /// pattern, e.g. `a}:x` when deleting `a`
    fn own_records(&self, id: &str, keys: impl IntoIterator<Item = String>) -> Vec<String> {
        keys.into_iter()
            .filter(|key| legacy_record_bucket(&self.config.key_prefix, id, key).is_some())
            .collect()
    }

    async fn scan_node(&self, node: &S, pattern: &str) -> Result<Vec<String>> {
        let scan = KeyScan::new(node, pattern, self.config.scan_count);
        with_timeout("legacy_scan", self.config.timeout, scan.collect_all()).await
    }

    pub(crate) fn mark(&mut self, state: BackendState) {
        self.state = state;
    }
}
