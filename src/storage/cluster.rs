// src/storage/cluster.rs
//! Multi-node topology support: hash slots, node connectors and the
//! redirect-following router used by the legacy backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{InMemoryConfig, RedisConfig};
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::memory::NodeRole;
use crate::storage::{MemoryStorage, RedisStorage, StorageBackend};

pub const SLOT_COUNT: u16 = 16384;

const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Cluster hash slot of `key`, honouring `{hash tags}`
pub fn key_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = match bytes.iter().position(|&b| b == b'{') {
        Some(open) => match bytes[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &bytes[open + 1..open + 1 + len],
            _ => bytes,
        },
        None => bytes,
    };
    crc16(hashed) % SLOT_COUNT
}

// CRC16/XMODEM
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Static slot ownership for a simulated cluster
#[derive(Debug)]
pub(crate) struct SlotMap {
    ranges: Vec<(u16, u16, String)>,
}

impl SlotMap {
    /// Split the slot space into contiguous, near-equal ranges
    pub(crate) fn even(addrs: &[String]) -> Self {
        let n = addrs.len().max(1) as u32;
        let ranges = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                let start = (i as u32 * SLOT_COUNT as u32 / n) as u16;
                let end = ((i as u32 + 1) * SLOT_COUNT as u32 / n - 1) as u16;
                (start, end, addr.clone())
            })
            .collect();
        Self { ranges }
    }

    pub(crate) fn owner(&self, slot: u16) -> Option<&str> {
        self.ranges
            .iter()
            .find(|(start, end, _)| (*start..=*end).contains(&slot))
            .map(|(_, _, addr)| addr.as_str())
    }
}

/// Opens connections to nodes discovered through redirects
#[async_trait]
pub trait NodeConnector<S: StorageBackend>: Send + Sync + Debug + 'static {
    async fn connect(&self, node: &str) -> Result<S>;
}

/// Connects to Redis nodes reusing the scheme, credentials and timeout of a template config
#[derive(Debug, Clone)]
pub struct RedisConnector {
    template: RedisConfig,
}

impl RedisConnector {
    pub fn new(template: RedisConfig) -> Self {
        Self { template }
    }

    fn node_url(&self, node: &str) -> String {
        if node.contains("://") {
            return node.to_string();
        }
        let (scheme, rest) = self
            .template
            .url
            .split_once("://")
            .unwrap_or(("redis", self.template.url.as_str()));
        match rest.rsplit_once('@') {
            Some((credentials, _)) => format!("{}://{}@{}", scheme, credentials, node),
            None => format!("{}://{}", scheme, node),
        }
    }
}

#[async_trait]
impl NodeConnector<RedisStorage> for RedisConnector {
    async fn connect(&self, node: &str) -> Result<RedisStorage> {
        let config = RedisConfig {
            url: self.node_url(node),
            connection_timeout: self.template.connection_timeout,
        };
        RedisStorage::new(config).await
    }
}

/// A set of in-memory nodes that split the slot space between them and
/// answer with redirects for keys they do not own.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    nodes: Arc<HashMap<String, MemoryStorage>>,
    addrs: Vec<String>,
    slots: Arc<SlotMap>,
    migrations: Arc<Mutex<HashMap<u16, String>>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryCluster {
    pub fn new(addrs: &[&str], config: InMemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let addrs: Vec<String> = addrs.iter().map(|addr| addr.to_string()).collect();
        let slots = Arc::new(SlotMap::even(&addrs));
        let migrations = Arc::new(Mutex::new(HashMap::new()));
        let nodes = addrs
            .iter()
            .map(|addr| {
                let storage = MemoryStorage::with_clock(config.clone(), Arc::clone(&clock))
                    .with_role(NodeRole {
                        addr: addr.clone(),
                        slots: Arc::clone(&slots),
                        migrations: Arc::clone(&migrations),
                    });
                (addr.clone(), storage)
            })
            .collect();

        Self {
            nodes: Arc::new(nodes),
            addrs,
            slots,
            migrations,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn node(&self, addr: &str) -> Option<MemoryStorage> {
        self.nodes.get(addr).cloned()
    }

    /// Address of the node serving `key`
    pub fn owner_of(&self, key: &str) -> Option<&str> {
        self.slots.owner(key_slot(key))
    }

    /// Start moving `slot` to `target`. The owner keeps serving keys it still
    /// holds and answers ASK for the rest; `target` accepts those only after
    /// ASKING.
    pub fn migrate_slot(&self, slot: u16, target: &str) -> Result<()> {
        if !self.nodes.contains_key(target) {
            return Err(RateLimiterError::Config(format!("no such node: {}", target)));
        }
        self.migrations
            .lock()
            .map_err(|_| RateLimiterError::Internal("slot migration table poisoned".to_string()))?
            .insert(slot, target.to_string());
        Ok(())
    }

    /// How many connections were opened through [`NodeConnector::connect`]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeConnector<MemoryStorage> for MemoryCluster {
    async fn connect(&self, node: &str) -> Result<MemoryStorage> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.node(node).ok_or_else(|| {
            RateLimiterError::Storage(StorageError::RedisConnection(format!(
                "no such node: {}",
                node
            )))
        })
    }
}

/// Routes single-key operations to the node serving their slot.
///
/// Starts out knowing only the primary connection. A redirect reply teaches it
/// which node serves the slot; the connection to that node is opened once and
/// reused afterwards.
#[derive(Debug)]
pub struct NodeRouter<S, C> {
    primary: S,
    connector: C,
    nodes: RwLock<HashMap<String, S>>,
    slots: RwLock<HashMap<u16, String>>,
    max_redirects: usize,
}

impl<S, C> NodeRouter<S, C>
where
    S: StorageBackend,
    C: NodeConnector<S>,
{
    pub fn new(primary: S, connector: C) -> Self {
        Self {
            primary,
            connector,
            nodes: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    pub fn primary(&self) -> &S {
        &self.primary
    }

    /// Connection to `addr`, opened on first use
    pub async fn node(&self, addr: &str) -> Result<S> {
        if let Some(conn) = self.nodes.read().await.get(addr) {
            return Ok(conn.clone());
        }

        let mut nodes = self.nodes.write().await;
        if let Some(conn) = nodes.get(addr) {
            return Ok(conn.clone());
        }
        info!(node = addr, "Opening connection to cluster node");
        let conn = self.connector.connect(addr).await?;
        nodes.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    /// Addresses with an open cached connection
    pub async fn cached_nodes(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Run `op` against the node serving `key`, reissuing it on redirects.
    ///
    /// MOVED updates the slot cache. ASK only sends this one request to the
    /// importing node, preceded by ASKING; the slot stays with its owner.
    pub async fn route<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: Fn(S) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let slot = key_slot(key);
        let cached = self.slots.read().await.get(&slot).cloned();
        let mut conn = match cached {
            Some(addr) => self.node(&addr).await?,
            None => self.primary.clone(),
        };

        let mut hops = 0;
        loop {
            match op(conn.clone()).await {
                Err(RateLimiterError::Storage(StorageError::Redirect { slot, node }))
                    if hops < self.max_redirects =>
                {
                    hops += 1;
                    warn!(key, slot, node = %node, hops, "Following cluster redirect");
                    self.slots.write().await.insert(slot, node.clone());
                    conn = self.node(&node).await?;
                }
                Err(RateLimiterError::Storage(StorageError::Ask { slot, node }))
                    if hops < self.max_redirects =>
                {
                    hops += 1;
                    warn!(key, slot, node = %node, hops, "Following ASK redirect");
                    conn = self.node(&node).await?.asking();
                }
                other => {
                    if hops > 0 {
                        debug!(key, hops, "Redirected operation completed");
                    }
                    return other;
                }
            }
        }
    }
}
