//! Core types for the cachet repository.
//!
//! This crate holds everything the two lookup tiers share:
//!
//! - **Configuration**: the resolved, immutable record consumed by the pool,
//!   the database tier, and the cache adapter
//! - **Errors**: the failure taxonomy surfaced by query operations
//! - **QueryOps**: the trait listing every typed query operation; the cache
//!   tier, the database tier, and the repository facade all implement it

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod config;
pub mod error;
pub mod query;

pub use config::{
    CacheConfig, CachePoolConfig, DatabaseBackend, DatabaseConfig, KeepaliveConfig, PoolConfig,
    RepositoryConfig,
};
pub use error::{ConfigError, QueryError, QueryResult};
pub use query::QueryOps;
