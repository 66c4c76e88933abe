// src/clock.rs

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Wall-clock source used for window indexing and elapsed-time computation
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the unix epoch
    fn now_ms(&self) -> u64;

    /// Whole seconds since the unix epoch
    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// Reads the system clock through chrono
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // Clocks set before 1970 read as the epoch
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to.
///
/// Shared between the engines and a [`MemoryStorage`](crate::storage::MemoryStorage)
/// so that TTLs and refill/leak arithmetic can be driven deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
