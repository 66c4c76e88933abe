// src/storage/memory.rs

// In-memory storage (for testing and single-process usage)
// Scripts run natively while the keyspace lock is held, which gives them the
// same all-or-nothing behaviour a Redis server gives Lua.
use ::redis::Value;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::InMemoryConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::cluster::{key_slot, SlotMap};
use crate::storage::{AtomicScript, Keyspace, StorageBackend, StoragePipeline};

/// A simple pipeline implementation for in-memory storage
#[derive(Debug, Default)]
pub struct MemoryPipeline {
    operations: Vec<MemoryOperation>,
    atomic: bool,
}

/// Represents an operation in the memory pipeline
#[derive(Debug)]
enum MemoryOperation {
    Delete(Vec<String>),
    RemoveMembers(String, Vec<String>),
}

impl MemoryOperation {
    fn keys(&self) -> Vec<&str> {
        match self {
            MemoryOperation::Delete(keys) => keys.iter().map(String::as_str).collect(),
            MemoryOperation::RemoveMembers(key, _) => vec![key.as_str()],
        }
    }
}

impl StoragePipeline for MemoryPipeline {
    fn atomic(&mut self) -> &mut Self {
        self.atomic = true;
        self
    }

    fn delete(&mut self, keys: &[String]) -> &mut Self {
        self.operations.push(MemoryOperation::Delete(keys.to_vec()));
        self
    }

    fn remove_members(&mut self, key: &str, members: &[String]) -> &mut Self {
        self.operations.push(MemoryOperation::RemoveMembers(
            key.to_string(),
            members.to_vec(),
        ));
        self
    }
}

/// Identity of a simulated cluster node
#[derive(Debug)]
pub(crate) struct NodeRole {
    pub(crate) addr: String,
    pub(crate) slots: Arc<SlotMap>,
    /// slot -> node importing it, shared by every node of the cluster
    pub(crate) migrations: Arc<Mutex<HashMap<u16, String>>>,
}

impl NodeRole {
    fn importer(&self, slot: u16) -> Result<Option<String>> {
        let migrations = self
            .migrations
            .lock()
            .map_err(|_| RateLimiterError::Internal("slot migration table poisoned".to_string()))?;
        Ok(migrations.get(&slot).cloned())
    }
}

/// Aborts the purge task once the last storage handle is gone
#[derive(Debug)]
struct CleanupTask(JoinHandle<()>);

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// In-memory storage backend implementation
#[derive(Clone)]
pub struct MemoryStorage {
    keyspace: Arc<Mutex<Keyspace>>,
    latency: Option<Duration>,
    role: Option<Arc<NodeRole>>,
    asking: bool,
    _cleanup_task: Option<Arc<CleanupTask>>,
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("node", &self.role.as_ref().map(|role| role.addr.as_str()))
            .field("latency", &self.latency)
            .field("asking", &self.asking)
            .finish()
    }
}

impl MemoryStorage {
    /// Creates a new in-memory storage reading time from the system clock
    pub fn new(config: InMemoryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a new in-memory storage whose TTLs and TIME follow `clock`
    pub fn with_clock(config: InMemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let keyspace = Arc::new(Mutex::new(Keyspace::new(clock, config.max_entries)));

        // Expired keys are also dropped lazily on access; the task only
        // bounds memory for keys nobody touches again
        let cleanup_task = match tokio::runtime::Handle::try_current() {
            Ok(handle) if config.use_background_task => {
                let weak = Arc::downgrade(&keyspace);
                let interval = config.cleanup_interval;
                Some(Arc::new(CleanupTask(
                    handle.spawn(Self::cleanup_loop(weak, interval)),
                )))
            }
            _ => None,
        };

        Self {
            keyspace,
            latency: None,
            role: None,
            asking: false,
            _cleanup_task: cleanup_task,
        }
    }

    /// Delay every operation by `latency`, to exercise caller timeouts
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn with_role(mut self, role: NodeRole) -> Self {
        self.role = Some(Arc::new(role));
        self
    }

    async fn cleanup_loop(keyspace: Weak<Mutex<Keyspace>>, interval: Duration) {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(shared) = keyspace.upgrade() else {
                break;
            };
            if let Ok(mut guard) = shared.lock() {
                let purged = guard.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired in-memory keys");
                }
            };
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Keyspace>> {
        self.keyspace
            .lock()
            .map_err(|_| RateLimiterError::Internal("in-memory keyspace lock poisoned".to_string()))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            time::sleep(latency).await;
        }
    }

    /// Lock the keyspace for a request on `keys`, first answering like a
    /// cluster node would for keys it does not serve
    fn owned<'a, I>(&self, keys: I) -> Result<MutexGuard<'_, Keyspace>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keys: Vec<&str> = keys.into_iter().collect();
        let mut keyspace = self.lock()?;
        self.check_ownership(&mut keyspace, &keys)?;
        Ok(keyspace)
    }

    fn check_ownership(&self, keyspace: &mut Keyspace, keys: &[&str]) -> Result<()> {
        let Some(role) = &self.role else {
            return Ok(());
        };
        let mut first_slot = None;
        for key in keys {
            let slot = key_slot(key);
            match first_slot {
                None => first_slot = Some(slot),
                Some(first) if first != slot => {
                    return Err(RateLimiterError::Storage(StorageError::RedisCommand(
                        "CROSSSLOT Keys in request don't hash to the same slot".to_string(),
                    )));
                }
                Some(_) => {}
            }
        }
        let Some(slot) = first_slot else {
            return Ok(());
        };
        let Some(owner) = role.slots.owner(slot) else {
            return Ok(());
        };
        let importer = role.importer(slot)?;

        if owner == role.addr {
            // a migrating slot is still served here for keys that have not moved
            if let Some(target) = importer {
                let present = keys.iter().filter(|key| keyspace.exists(key)).count();
                if present == 0 {
                    return Err(RateLimiterError::Storage(StorageError::Ask {
                        slot,
                        node: target,
                    }));
                }
                if present < keys.len() {
                    return Err(RateLimiterError::Storage(StorageError::RedisCommand(
                        "TRYAGAIN Multiple keys request during rehashing of slot".to_string(),
                    )));
                }
            }
            return Ok(());
        }

        if self.asking && importer.as_deref() == Some(role.addr.as_str()) {
            return Ok(());
        }
        Err(RateLimiterError::Storage(StorageError::Redirect {
            slot,
            node: owner.to_string(),
        }))
    }

    /// Number of live keys, for tests and diagnostics
    pub fn len(&self) -> Result<usize> {
        let mut keyspace = self.lock()?;
        keyspace.purge_expired();
        let (mut cursor, mut total) = (0, 0);
        loop {
            let (next, keys) = keyspace.scan(cursor, "*", 1024);
            total += keys.len();
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    type Pipeline = MemoryPipeline;

    async fn ping(&self) -> Result<()> {
        self.simulate_latency().await;
        self.lock().map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.simulate_latency().await;
        self.owned([key])?.get(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.simulate_latency().await;
        let ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64);
        self.owned([key])?.set(key, value, ttl_ms)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.simulate_latency().await;
        Ok(self.owned([key])?.exists(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.simulate_latency().await;
        let mut keyspace = self.owned(keys.iter().map(String::as_str))?;
        Ok(keys.iter().filter(|key| keyspace.del(key)).count() as u64)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.simulate_latency().await;
        self.owned([key])?.hget(key, field)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.simulate_latency().await;
        self.owned([key])?.hgetall(key)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.simulate_latency().await;
        self.owned([key])?.zcard(key)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.simulate_latency().await;
        Ok(self.lock()?.scan(cursor, pattern, count))
    }

    async fn eval(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Value> {
        self.simulate_latency().await;
        let mut keyspace = self.owned(keys.iter().map(String::as_str))?;
        (script.native)(&mut keyspace, keys, args)
    }

    fn pipeline(&self) -> Self::Pipeline {
        MemoryPipeline::default()
    }

    fn asking(&self) -> Self {
        let mut handle = self.clone();
        handle.asking = true;
        handle
    }

    async fn execute_pipeline(&self, pipeline: Self::Pipeline) -> Result<Vec<Value>> {
        self.simulate_latency().await;
        let mut keyspace = self.lock()?;
        if pipeline.atomic {
            // a transaction is refused as a whole, like EXEC after a MOVED
            let keys: Vec<&str> = pipeline
                .operations
                .iter()
                .flat_map(MemoryOperation::keys)
                .collect();
            self.check_ownership(&mut keyspace, &keys)?;
        } else {
            for op in &pipeline.operations {
                self.check_ownership(&mut keyspace, &op.keys())?;
            }
        }

        let mut results = Vec::with_capacity(pipeline.operations.len());
        for op in pipeline.operations {
            match op {
                MemoryOperation::Delete(keys) => {
                    let removed = keys.iter().filter(|key| keyspace.del(key)).count();
                    results.push(Value::Int(removed as i64));
                }
                MemoryOperation::RemoveMembers(key, members) => {
                    let mut removed = 0;
                    for member in &members {
                        if keyspace.srem(&key, member)? {
                            removed += 1;
                        }
                    }
                    results.push(Value::Int(removed));
                }
            }
        }

        Ok(results)
    }
}
