// src/storage/mod.rs

pub mod cluster;
mod keyspace;
pub mod memory;
pub mod redis;
pub mod scan;

#[cfg(test)]
mod tests;

pub use cluster::{key_slot, MemoryCluster, NodeConnector, NodeRouter, RedisConnector};
pub use memory::{MemoryPipeline, MemoryStorage};
pub use redis::{RedisPipeline, RedisStorage};
pub use scan::{KeyScan, ScanProgress};

pub(crate) use keyspace::Keyspace;

use super::error::{RateLimiterError, Result, StorageError};
use ::redis::Value;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Native evaluation of a script against the in-memory keyspace
pub(crate) type NativeScript = fn(&mut Keyspace, &[String], &[String]) -> Result<Value>;

/// A read-modify-write sequence the store evaluates as one atomic unit.
///
/// Redis runs `lua` through EVALSHA/EVAL; [`MemoryStorage`] runs `native`
/// while holding its keyspace lock. Both must have the same semantics.
pub struct AtomicScript {
    pub name: &'static str,
    pub lua: &'static str,
    pub(crate) native: NativeScript,
}

impl Debug for AtomicScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicScript")
            .field("name", &self.name)
            .finish()
    }
}

// Represents a pipeline of operations, optionally wrapped in MULTI/EXEC
pub trait StoragePipeline: Send + Sync {
    // Execute the queued commands as one transaction
    fn atomic(&mut self) -> &mut Self;

    // Add a multi-key delete to the pipeline
    fn delete(&mut self, keys: &[String]) -> &mut Self;

    // Add a set-member removal to the pipeline
    fn remove_members(&mut self, key: &str, members: &[String]) -> &mut Self;
}

/// Core trait that all storage backends must implement
///
/// Implementations are cheap handles: cloning shares the underlying
/// connection or keyspace.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug + Clone + 'static {
    // The type of pipeline this storage backend uses
    type Pipeline: StoragePipeline;

    // Checks that the store answers
    async fn ping(&self) -> Result<()>;

    // Retrieves a string value by key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    // Stores a string value with an optional TTL (millisecond precision)
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    // Checks if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    // Deletes keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    // Reads one hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    // Reads every field of a hash; empty when absent
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    // Cardinality of a sorted set
    async fn zcard(&self, key: &str) -> Result<u64>;

    // One SCAN step: next cursor (0 when exhausted) and the keys it matched
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    // Evaluates an atomic script
    async fn eval(&self, script: &AtomicScript, keys: &[String], args: &[String])
        -> Result<Value>;

    // Creates a new pipeline for executing multiple operations
    fn pipeline(&self) -> Self::Pipeline;

    // Executes a pipeline of operations
    async fn execute_pipeline(&self, pipeline: Self::Pipeline) -> Result<Vec<Value>>;

    // A handle on the same connection that sends ASKING ahead of every
    // request, for following an ASK redirect to a node importing the slot
    fn asking(&self) -> Self;
}

/// Bound a store round trip by `limit`.
///
/// Expiry surfaces as [`StorageError::Timeout`]; the caller decides what to
/// do, since the remote side may or may not have applied the request.
pub async fn with_timeout<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                "Storage operation timed out"
            );
            Err(RateLimiterError::Storage(StorageError::Timeout {
                operation,
                after: limit,
            }))
        }
    }
}

// Script argument helpers shared by the native script implementations

pub(crate) fn arg_str<'a>(args: &'a [String], index: usize, script: &str) -> Result<&'a str> {
    args.get(index).map(String::as_str).ok_or_else(|| {
        RateLimiterError::Protocol(format!("{} is missing argument {}", script, index + 1))
    })
}

pub(crate) fn arg_f64(args: &[String], index: usize, script: &str) -> Result<f64> {
    let raw = arg_str(args, index, script)?;
    raw.parse::<f64>().map_err(|_| {
        RateLimiterError::Protocol(format!(
            "{} argument {} is not a number: {:?}",
            script,
            index + 1,
            raw
        ))
    })
}

pub(crate) fn arg_i64(args: &[String], index: usize, script: &str) -> Result<i64> {
    let raw = arg_str(args, index, script)?;
    raw.parse::<i64>().map_err(|_| {
        RateLimiterError::Protocol(format!(
            "{} argument {} is not an integer: {:?}",
            script,
            index + 1,
            raw
        ))
    })
}

pub(crate) fn key_at<'a>(keys: &'a [String], index: usize, script: &str) -> Result<&'a str> {
    keys.get(index).map(String::as_str).ok_or_else(|| {
        RateLimiterError::Protocol(format!("{} is missing key {}", script, index + 1))
    })
}
