// library entry
pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod legacy;
pub mod logging;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export key components for convenience
pub use algorithms::{
    Decision, FixedWindow, LeakyBucket, RateLimitAlgorithm, SlidingWindow, TokenBucket,
    WindowAlgorithm,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RateLimiterError, Result, StorageError};
pub use legacy::{BackendState, BucketRecord, LegacyBackend, LegacyHandle};
pub use logging::init as init_logging;
pub use storage::{MemoryStorage, RedisStorage, StorageBackend};
