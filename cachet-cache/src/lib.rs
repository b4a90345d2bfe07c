//! Cache layer for the cachet repository.
//!
//! # Architecture
//!
//! - **Cache adapter** ([`client`]): pooled key-value client with
//!   per-command timeouts; the pool knobs come from configuration
//! - **Key derivation** ([`key`]): deterministic, collision-free cache keys
//!   per query invocation
//! - **Cache tier** ([`tier`]): the cache-aside protocol over a generic
//!   upstream data source, implementing the shared
//!   [`QueryOps`](cachet_core::QueryOps) contract

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod client;
pub mod error;
pub mod key;
pub mod tier;

pub use client::{CacheClient, KvStore, RedisManager};
pub use error::{CacheError, CacheResult};
pub use key::query_key;
pub use tier::{CacheTier, TtlPolicy};
