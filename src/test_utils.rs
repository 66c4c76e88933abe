// src/test_utils.rs

use super::algorithms::{
    Decision, FixedWindow, LeakyBucket, RateLimitAlgorithm, SlidingWindow, TokenBucket,
};
use super::clock::{Clock, ManualClock};
use super::config::{InMemoryConfig, RateLimiterConfig};
use super::storage::{MemoryCluster, MemoryStorage};
use std::sync::Arc;
use std::time::Duration;

/// Start of the simulated timeline; a multiple of every window length used in tests
pub const TEST_START_MS: u64 = 1_700_000_000_000;

/// In-memory config without the purge task, so expiry is driven only by the clock
pub fn memory_config() -> InMemoryConfig {
    InMemoryConfig {
        max_entries: 100_000,
        use_background_task: false,
        cleanup_interval: Duration::from_secs(60),
    }
}

pub fn test_config() -> RateLimiterConfig {
    RateLimiterConfig {
        key_prefix: "test".to_string(),
        timeout: Duration::from_secs(1),
    }
}

/// A memory store and the engines over it, all reading one manual clock
#[derive(Debug, Clone)]
pub struct TestEnv {
    pub clock: Arc<ManualClock>,
    pub storage: MemoryStorage,
}

impl TestEnv {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(TEST_START_MS));
        let storage = MemoryStorage::with_clock(memory_config(), clock.clone());
        Self { clock, storage }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    pub fn fixed_window(&self) -> FixedWindow<MemoryStorage> {
        FixedWindow::new(self.storage.clone(), test_config()).with_clock(self.clock())
    }

    pub fn sliding_window(&self) -> SlidingWindow<MemoryStorage> {
        SlidingWindow::new(self.storage.clone(), test_config()).with_clock(self.clock())
    }

    pub fn token_bucket(&self) -> TokenBucket<MemoryStorage> {
        TokenBucket::new(self.storage.clone(), test_config()).with_clock(self.clock())
    }

    pub fn leaky_bucket(&self) -> LeakyBucket<MemoryStorage> {
        LeakyBucket::new(self.storage.clone(), test_config()).with_clock(self.clock())
    }

    /// Three in-memory nodes sharing this environment's clock
    pub fn cluster(&self) -> MemoryCluster {
        MemoryCluster::new(
            &["10.0.0.1:7000", "10.0.0.2:7001", "10.0.0.3:7002"],
            memory_config(),
            self.clock(),
        )
    }
}

/// Issue `count` sequential hits of one unit each and collect the decisions
pub async fn hit_times<A>(
    algorithm: &A,
    key: &str,
    scale: A::Scale,
    limit: u64,
    count: usize,
) -> Vec<Decision>
where
    A: RateLimitAlgorithm,
{
    let mut decisions = Vec::with_capacity(count);
    for _ in 0..count {
        decisions.push(algorithm.hit(key, scale, limit, 1).await.unwrap());
    }
    decisions
}

/// Counts carried by the allowed decisions, in order
pub fn allowed_counts(decisions: &[Decision]) -> Vec<u64> {
    decisions.iter().filter_map(Decision::count).collect()
}
