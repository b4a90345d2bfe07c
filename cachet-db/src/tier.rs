//! Database lookup tier.
//!
//! One method per query operation: borrow a pooled connection, run the
//! statement, classify failures. A single pool acquire waits at most
//! `acquire_wait`; the tier keeps issuing fresh acquires until the overall
//! `max_wait` deadline passes. Saturation and shutdown both surface as the
//! broken kind so the caller layer can answer 503.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cachet_core::config::{DatabaseConfig, PoolConfig};
use cachet_core::error::{QueryError, QueryResult};
use cachet_core::query::QueryOps;

use crate::connector::{Connector, QueryHandle, SqlConnector};
use crate::pool::{Pool, PoolGuard, PoolStats};

/// Message surfaced when the pool has nothing to hand out.
const UNAVAILABLE: &str = "database connection unavailable";

/// The database-backed data source.
///
/// Owns the connection pool; the cache tier borrows this as its upstream
/// source for cache misses.
#[derive(Debug)]
pub struct DatabaseTier<C: Connector = SqlConnector> {
    pool: Pool<C>,
    running: CancellationToken,
    max_wait: Duration,
}

impl DatabaseTier<SqlConnector> {
    /// Build the tier for the configured backend. Constructing the pool
    /// performs the initial fill and starts the health-check worker.
    pub async fn connect(config: &DatabaseConfig) -> Self {
        let pool_config = config.pool.clone();
        Self::with_connector(SqlConnector::new(config.clone()), pool_config).await
    }
}

impl<C> DatabaseTier<C>
where
    C: Connector,
    C::Handle: QueryHandle,
{
    /// Build the tier over any connector; tests inject fakes here.
    pub async fn with_connector(connector: C, pool_config: PoolConfig) -> Self {
        let max_wait = pool_config.max_wait();
        Self {
            pool: Pool::new(connector, pool_config).await,
            running: CancellationToken::new(),
            max_wait,
        }
    }

    /// Point-in-time pool counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop serving queries and dismantle the pool: the health worker is
    /// joined and every connection closed. Idempotent.
    pub async fn close(&self) {
        self.running.cancel();
        self.pool.close().await;
    }

    /// Borrow a connection, issuing fresh acquires until the overall
    /// `max_wait` deadline passes, then fail with the retryable kind.
    async fn checkout(&self) -> QueryResult<PoolGuard<C>> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            match self.pool.acquire().await? {
                Some(guard) => return Ok(guard),
                None => {
                    if !self.pool.is_running() || Instant::now() >= deadline {
                        return Err(QueryError::broken(UNAVAILABLE));
                    }
                }
            }
        }
    }

    /// Flag the borrowed connection for disposal when the statement died
    /// with the link.
    fn settle<T>(guard: &mut PoolGuard<C>, result: QueryResult<T>) -> QueryResult<T> {
        if let Err(err) = &result {
            if err.is_broken() {
                tracing::error!(connection = %guard.id(), "Broken database connection: {}", err);
                guard.flag_broken();
            }
        }
        result
    }
}

impl<C> QueryOps for DatabaseTier<C>
where
    C: Connector,
    C::Handle: QueryHandle,
{
    async fn echo_string(&self, input: &str) -> QueryResult<Option<String>> {
        if self.running.is_cancelled() {
            return Ok(None);
        }
        let mut guard = self.checkout().await?;
        let result = guard.connection().echo_string(input).await;
        Self::settle(&mut guard, result)
    }

    async fn sum_int(&self, a: i32, b: i32) -> QueryResult<Option<String>> {
        if self.running.is_cancelled() {
            return Ok(None);
        }
        let mut guard = self.checkout().await?;
        let result = guard.connection().sum_int(a, b).await;
        Self::settle(&mut guard, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Connector whose handles replay scripted results.
    #[derive(Default)]
    #[derive(Debug)]
    struct ScriptedConnector {
        refuse_open: AtomicBool,
        fail_queries_broken: AtomicBool,
        fail_queries_sql: AtomicBool,
        queries_run: AtomicUsize,
        closed: AtomicUsize,
    }

    #[derive(Debug)]
    struct ScriptedHandle {
        connector: Arc<ScriptedConnector>,
    }

    impl Connector for Arc<ScriptedConnector> {
        type Handle = ScriptedHandle;

        async fn open(&self) -> QueryResult<ScriptedHandle> {
            if self.refuse_open.load(Ordering::Relaxed) {
                return Err(QueryError::broken("connection refused"));
            }
            Ok(ScriptedHandle {
                connector: Arc::clone(self),
            })
        }

        async fn validate(&self, _: &mut ScriptedHandle, _: bool) -> QueryResult<()> {
            Ok(())
        }

        async fn ping(&self, _: &mut ScriptedHandle) -> QueryResult<()> {
            Ok(())
        }

        async fn close(&self, _: ScriptedHandle) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl QueryHandle for ScriptedHandle {
        async fn echo_string(&mut self, input: &str) -> QueryResult<Option<String>> {
            self.connector.queries_run.fetch_add(1, Ordering::Relaxed);
            if self.connector.fail_queries_broken.load(Ordering::Relaxed) {
                return Err(QueryError::broken("server has gone away"));
            }
            if self.connector.fail_queries_sql.load(Ordering::Relaxed) {
                return Err(QueryError::sql("syntax error"));
            }
            Ok(Some(input.to_owned()))
        }

        async fn sum_int(&mut self, a: i32, b: i32) -> QueryResult<Option<String>> {
            self.connector.queries_run.fetch_add(1, Ordering::Relaxed);
            Ok(Some((a + b).to_string()))
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig {
            min_size: 1,
            max_size: 2,
            acquire_wait_ms: 50,
            max_wait_ms: 150,
            health_check_interval_ms: 1_000,
            log_saturation_threshold: 3,
            ..PoolConfig::default()
        }
    }

    /// Happy path: the tier returns the row and the connection goes back
    /// into the pool.
    #[tokio::test(start_paused = true)]
    async fn test_query_round_trip() {
        let connector = Arc::new(ScriptedConnector::default());
        let tier = DatabaseTier::with_connector(Arc::clone(&connector), pool_config()).await;

        let echoed = tier.echo_string("hello").await.unwrap();
        assert_eq!(echoed.as_deref(), Some("hello"));

        let total = tier.sum_int(2, 3).await.unwrap();
        assert_eq!(total.as_deref(), Some("5"));

        assert_eq!(tier.stats().available, 1);
        tier.close().await;
    }

    /// With the database down and the pool empty, queries fail broken.
    #[tokio::test(start_paused = true)]
    async fn test_unreachable_database_is_broken() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.refuse_open.store(true, Ordering::Relaxed);
        let tier = DatabaseTier::with_connector(Arc::clone(&connector), pool_config()).await;

        let err = tier.echo_string("hello").await.unwrap_err();
        assert!(err.is_broken());

        tier.close().await;
    }

    /// A broken statement evicts its connection; a plain SQL error leaves
    /// it pooled.
    #[tokio::test(start_paused = true)]
    async fn test_broken_query_evicts_connection() {
        let connector = Arc::new(ScriptedConnector::default());
        let tier = DatabaseTier::with_connector(Arc::clone(&connector), pool_config()).await;

        connector.fail_queries_sql.store(true, Ordering::Relaxed);
        let err = tier.echo_string("x").await.unwrap_err();
        assert!(matches!(err, QueryError::Sql(_)));
        assert_eq!(tier.stats().total, 1);

        connector.fail_queries_sql.store(false, Ordering::Relaxed);
        connector.fail_queries_broken.store(true, Ordering::Relaxed);
        let err = tier.echo_string("x").await.unwrap_err();
        assert!(err.is_broken());
        let stats = tier.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.pending_removal, 1);

        tier.close().await;
    }

    /// With every connection held, the tier keeps retrying fresh acquires
    /// until `max_wait` passes, then fails broken.
    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_fails_broken_after_max_wait() {
        let connector = Arc::new(ScriptedConnector::default());
        let config = PoolConfig {
            max_size: 1,
            ..pool_config()
        };
        let tier = DatabaseTier::with_connector(Arc::clone(&connector), config).await;

        let guard = tier.pool.acquire().await.unwrap().unwrap();

        let started = Instant::now();
        let err = tier.echo_string("hello").await.unwrap_err();
        assert!(err.is_broken());
        assert!(started.elapsed() >= Duration::from_millis(150));

        drop(guard);
        tier.close().await;
    }

    /// After close the tier answers absent without touching the pool.
    #[tokio::test(start_paused = true)]
    async fn test_closed_tier_returns_absent() {
        let connector = Arc::new(ScriptedConnector::default());
        let tier = DatabaseTier::with_connector(Arc::clone(&connector), pool_config()).await;

        tier.close().await;

        let before = connector.queries_run.load(Ordering::Relaxed);
        assert_eq!(tier.echo_string("hello").await.unwrap(), None);
        assert_eq!(connector.queries_run.load(Ordering::Relaxed), before);

        // A second close is a no-op.
        tier.close().await;
    }
}
