//! Database layer for the cachet repository.
//!
//! # Architecture
//!
//! Three pieces, stacked:
//!
//! - **Driver adapter** ([`backend`]): one connection-handle variant per
//!   backend (PostgreSQL, MySQL, MariaDB) over raw sqlx connections, plus
//!   the authoritative classification of backend errors
//! - **Pool** ([`pool`]): bounded, health-checked connection set handing out
//!   RAII guards
//! - **Database tier** ([`tier`]): per-query methods over the pool,
//!   implementing the shared [`QueryOps`](cachet_core::QueryOps) contract

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod backend;
pub mod connector;
pub mod pool;
pub mod tier;

pub use backend::DbHandle;
pub use connector::{Connector, QueryHandle, SqlConnector};
pub use pool::{
    ConnectionId, ConnectionMetrics, MIN_HEALTH_TICK, Pool, PoolGuard, PoolStats,
};
pub use tier::DatabaseTier;
