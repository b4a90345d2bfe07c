//! Cache-aside lookup tier.
//!
//! Every query first consults the key-value store; a hit returns without
//! touching the database. A miss delegates to the upstream data source and,
//! when a value comes back, stores it under the query's TTL. The cache is an
//! optimization only: any cache failure degrades the call to a plain
//! database lookup, never into a user-visible error. Database failures pass
//! through unchanged.

use std::collections::HashMap;
use std::time::Duration;

use cachet_core::config::CacheConfig;
use cachet_core::error::QueryResult;
use cachet_core::query::{self, QueryOps};

use crate::client::KvStore;
use crate::key::query_key;

/// Per-query TTLs with a default fallback.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default: Duration,
    per_query: HashMap<String, Duration>,
}

impl TtlPolicy {
    /// Extract the TTL policy from the cache configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            default: Duration::from_secs(config.default_ttl_secs),
            per_query: config
                .ttl_secs
                .iter()
                .map(|(query, secs)| (query.clone(), Duration::from_secs(*secs)))
                .collect(),
        }
    }

    /// TTL for one query.
    pub fn ttl_for(&self, query: &str) -> Duration {
        self.per_query.get(query).copied().unwrap_or(self.default)
    }
}

/// The cache-aside tier in front of an upstream data source.
///
/// `S` is the data source consulted on a miss (the database tier in
/// production) and `K` the key-value store; both are seams so tests can run
/// the full protocol in memory.
#[derive(Debug)]
pub struct CacheTier<S, K> {
    source: S,
    store: K,
    ttl: TtlPolicy,
}

impl<S, K> CacheTier<S, K>
where
    S: QueryOps,
    K: KvStore,
{
    /// Wire the tier over its store and upstream source.
    pub fn new(store: K, source: S, ttl: TtlPolicy) -> Self {
        Self { source, store, ttl }
    }

    /// The upstream data source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The cache-aside protocol shared by every query.
    async fn cache_aside<F, Fut>(
        &self,
        query: &'static str,
        key: String,
        fetch: F,
    ) -> QueryResult<Option<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueryResult<Option<String>>>,
    {
        match self.store.get(&key).await {
            Ok(Some(value)) => {
                tracing::debug!(key = %key, "Cache hit");
                return Ok(Some(value));
            }
            Ok(None) => {
                tracing::debug!(key = %key, "Cache miss");
            }
            Err(err) => {
                // Faulty cache: degrade to a database-only lookup, with a
                // second-chance store of whatever comes back.
                tracing::error!(key = %key, "Cache lookup failed: {}", err);
                let fresh = fetch().await?;
                if let Some(value) = &fresh {
                    if let Err(err) = self.store.setex(&key, self.ttl.ttl_for(query), value).await {
                        tracing::warn!(key = %key, "Failed to store cache entry: {}", err);
                    }
                }
                return Ok(fresh);
            }
        }

        let fresh = fetch().await?;
        if let Some(value) = &fresh {
            match self.store.setex(&key, self.ttl.ttl_for(query), value).await {
                Ok(()) => tracing::debug!(key = %key, "Stored cache entry"),
                Err(err) => tracing::warn!(key = %key, "Failed to store cache entry: {}", err),
            }
        }
        Ok(fresh)
    }
}

impl<S, K> QueryOps for CacheTier<S, K>
where
    S: QueryOps,
    K: KvStore,
{
    async fn echo_string(&self, input: &str) -> QueryResult<Option<String>> {
        let key = query_key(query::ECHO_STRING, &[input]);
        self.cache_aside(query::ECHO_STRING, key, || self.source.echo_string(input))
            .await
    }

    async fn sum_int(&self, a: i32, b: i32) -> QueryResult<Option<String>> {
        let (a_arg, b_arg) = (a.to_string(), b.to_string());
        let key = query_key(query::SUM_INT, &[&a_arg, &b_arg]);
        self.cache_aside(query::SUM_INT, key, || self.source.sum_int(a, b))
            .await
    }
}
