//! Repository facade.
//!
//! The single entry point applications hold: it owns the cache tier, which
//! owns the database tier, which owns the connection pool. Query calls run
//! cache-first with transparent database fallback; shutdown propagates in
//! reverse construction order. No process-wide state is involved, so any
//! number of repositories can coexist (tests do exactly that).

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use thiserror::Error;

use cachet_cache::{CacheClient, CacheError, CacheTier, TtlPolicy};
use cachet_core::config::RepositoryConfig;
use cachet_core::error::{ConfigError, QueryResult};
use cachet_core::query::QueryOps;
use cachet_db::{DatabaseTier, PoolStats};

pub use cachet_core::config;
pub use cachet_core::error::QueryError;
pub use cachet_core::query;

/// Failures while constructing a repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The resolved configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The cache client could not be built.
    #[error("Cache setup error: {0}")]
    Cache(#[from] CacheError),
}

/// The repository: a read-through caching front over a relational database.
///
/// Constructing it materializes the database tier (pool fill plus
/// health-check worker) and then the cache tier; [`shutdown`](Self::shutdown)
/// unwinds in the opposite order.
#[derive(Debug)]
pub struct Repository {
    cache: CacheTier<DatabaseTier, CacheClient>,
}

impl Repository {
    /// Validate the configuration and bring both tiers up.
    ///
    /// A database that is down at startup is not fatal: the pool starts
    /// empty and the health worker keeps refilling once the server returns.
    pub async fn connect(config: RepositoryConfig) -> Result<Self, RepositoryError> {
        config.validate()?;

        let database = DatabaseTier::connect(&config.database).await;
        let client = CacheClient::connect(&config.cache).await?;
        let cache = CacheTier::new(client, database, TtlPolicy::from_config(&config.cache));

        tracing::info!(backend = %config.database.backend, "Repository ready");
        Ok(Self { cache })
    }

    /// Point-in-time connection pool counters.
    pub fn database_stats(&self) -> PoolStats {
        self.cache.source().stats()
    }

    /// Tear the repository down: the cache tier simply stops being used,
    /// then the database tier cancels its running flag, joins the
    /// health-check worker, and closes every pooled connection.
    /// Idempotent; a second call is a no-op.
    pub async fn shutdown(&self) {
        self.cache.source().close().await;
        tracing::info!("Repository shut down");
    }
}

impl QueryOps for Repository {
    async fn echo_string(&self, input: &str) -> QueryResult<Option<String>> {
        self.cache.echo_string(input).await
    }

    async fn sum_int(&self, a: i32, b: i32) -> QueryResult<Option<String>> {
        self.cache.sum_int(a, b).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Configuration pointing both backends at a port nothing listens on,
    /// with short timeouts so tests stay fast.
    fn unreachable_config() -> RepositoryConfig {
        RepositoryConfig::from_toml_str(
            r#"
            [database]
            backend = "mariadb"
            host = "127.0.0.1"
            port = 1
            user = "app"
            password = "secret"
            connect_timeout_secs = 1

            [database.pool]
            min_size = 1
            max_size = 2
            acquire_wait_ms = 50
            max_wait_ms = 200
            health_check_interval_ms = 200
            log_saturation_threshold = 3

            [cache]
            host = "127.0.0.1"
            port = 1
            command_timeout_ms = 200

            [cache.pool]
            size = 1
            wait_ms = 200
            "#,
        )
        .unwrap()
    }

    /// Out-of-range configuration aborts construction.
    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = unreachable_config();
        config.database.pool.min_size = 8;
        config.database.pool.max_size = 2;

        let err = Repository::connect(config).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Config(_)));
    }

    /// With both backends down the facade still constructs, queries fail
    /// with the retryable kind instead of deadlocking, and shutdown is
    /// idempotent.
    #[tokio::test]
    async fn test_unreachable_backends_degrade_to_broken() {
        let repository = Repository::connect(unreachable_config()).await.unwrap();
        assert_eq!(repository.database_stats().total, 0);

        let err = repository.echo_string("hello").await.unwrap_err();
        assert!(err.is_broken(), "expected broken, got: {err}");

        repository.shutdown().await;
        repository.shutdown().await;
    }

    /// Two repositories coexist in one process; no hidden global state.
    #[tokio::test]
    async fn test_facades_are_independent() {
        let first = Repository::connect(unreachable_config()).await.unwrap();
        let second = Repository::connect(unreachable_config()).await.unwrap();

        first.shutdown().await;
        // The second facade still answers after the first shut down.
        let err = second.echo_string("hello").await.unwrap_err();
        assert!(err.is_broken());
        second.shutdown().await;
    }
}
