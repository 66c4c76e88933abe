// for error definitions
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Errors related to the storage backend
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A script or command answered with a reply of the wrong shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The legacy backend request loop is no longer running
    #[error("Backend stopped")]
    Stopped,

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RateLimiterError {
    /// True when the operation was abandoned because its deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RateLimiterError::Storage(StorageError::Timeout { .. }))
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Redis connection errors
    #[error("Redis connection error: {0}")]
    RedisConnection(String),

    // Redis authentication errors
    #[error("Redis authentication error: {0}")]
    RedisAuth(String),

    /// Redis command errors
    #[error("Redis command error: {0}")]
    RedisCommand(String),

    /// The store did not answer before the caller's deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The key lives on another cluster node (MOVED)
    #[error("Slot {slot} is served by {node}")]
    Redirect { slot: u16, node: String },

    /// The slot is migrating and this one request must be retried on `node`
    /// after ASKING (ASK)
    #[error("Slot {slot} is being imported by {node}")]
    Ask { slot: u16, node: String },

    /// Data serialization/deserialization errors
    #[error("Data serialization error: {0}")]
    Serialization(String),
}

impl From<StorageError> for RateLimiterError {
    fn from(err: StorageError) -> Self {
        RateLimiterError::Storage(err)
    }
}

// Implement conversions from redis::RedisError to StorageError
impl From<redis::RedisError> for RateLimiterError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => {
                // authentication errors
                RateLimiterError::Storage(StorageError::RedisAuth(err.to_string()))
            }
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                // Connection-related errors
                RateLimiterError::Storage(StorageError::RedisConnection(err.to_string()))
            }
            redis::ErrorKind::Moved => match parse_redirect(&err) {
                Some((slot, node)) => RateLimiterError::Storage(StorageError::Redirect { slot, node }),
                None => RateLimiterError::Storage(StorageError::RedisCommand(err.to_string())),
            },
            redis::ErrorKind::Ask => match parse_redirect(&err) {
                Some((slot, node)) => RateLimiterError::Storage(StorageError::Ask { slot, node }),
                None => RateLimiterError::Storage(StorageError::RedisCommand(err.to_string())),
            },
            _ => {
                // Command/operation related errors
                RateLimiterError::Storage(StorageError::RedisCommand(err.to_string()))
            }
        }
    }
}

// "MOVED 3999 127.0.0.1:6381" (or ASK) arrives with detail "3999 127.0.0.1:6381"
fn parse_redirect(err: &redis::RedisError) -> Option<(u16, String)> {
    let mut parts = err.detail()?.split_whitespace();
    let slot = parts.next()?.parse().ok()?;
    let node = parts.next()?.to_string();
    Some((slot, node))
}

// implement conversions from serde_json::Error to RateLimiterError
impl From<serde_json::Error> for RateLimiterError {
    fn from(err: serde_json::Error) -> Self {
        RateLimiterError::Storage(StorageError::Serialization(err.to_string()))
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, RateLimiterError>;
