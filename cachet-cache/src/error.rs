//! Cache adapter error types.
//!
//! These never reach repository callers: the cache tier logs them and falls
//! back to the database per the cache-aside contract.

use std::time::Duration;
use thiserror::Error;

/// Cache adapter errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The server rejected or dropped a command.
    #[error("Cache command error: {0}")]
    Command(#[from] redis::RedisError),

    /// No cache connection could be checked out in time.
    #[error("Cache connection unavailable: {0}")]
    Unavailable(String),

    /// The command outlived its configured timeout.
    #[error("Cache command timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
