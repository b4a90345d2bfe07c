//! Cache driver adapter.
//!
//! A thin key-value client over redis with its own mini connection pool.
//! The pool knobs (size, wait, lifetime, idle time) come straight from the
//! cache section of the resolved configuration; every command is bounded by
//! the configured command timeout.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

use cachet_core::config::CacheConfig;

use crate::error::{CacheError, CacheResult};

/// Key-value operations the cache tier runs against the adapter.
///
/// [`CacheClient`] is the production implementation; tests substitute an
/// in-memory map.
pub trait KvStore: Send + Sync {
    /// Fetch a value.
    fn get(&self, key: &str) -> impl Future<Output = CacheResult<Option<String>>> + Send;

    /// Store a value with a TTL; the server expires it on its own.
    fn setex(
        &self,
        key: &str,
        ttl: Duration,
        value: &str,
    ) -> impl Future<Output = CacheResult<()>> + Send;
}

/// bb8 connection manager for the cache server.
///
/// Fresh connections announce the configured client label so they are easy
/// to spot in `CLIENT LIST` output.
#[derive(Debug)]
pub struct RedisManager {
    client: redis::Client,
    client_name: String,
}

impl RedisManager {
    fn new(config: &CacheConfig) -> CacheResult<Self> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.index,
                username: config.username.clone(),
                password: config.password.clone(),
                ..RedisConnectionInfo::default()
            },
        };

        Ok(Self {
            client: redis::Client::open(info)?,
            client_name: config.client_name.clone(),
        })
    }
}

impl bb8::ManageConnection for RedisManager {
    type Connection = MultiplexedConnection;
    type Error = redis::RedisError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        if !self.client_name.is_empty() {
            redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(&self.client_name)
                .query_async::<()>(&mut conn)
                .await?;
        }
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query_async::<()>(conn).await
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pooled cache client.
#[derive(Clone, Debug)]
pub struct CacheClient {
    pool: bb8::Pool<RedisManager>,
    command_timeout: Duration,
}

impl CacheClient {
    /// Build the client and its mini-pool. Connections are established
    /// lazily, so a cache server that is down at startup only surfaces once
    /// commands run.
    pub async fn connect(config: &CacheConfig) -> CacheResult<Self> {
        let manager = RedisManager::new(config)?;
        let pool = bb8::Pool::builder()
            .max_size(config.pool.size)
            .connection_timeout(config.pool.wait())
            .max_lifetime(Some(config.pool.connection_lifetime()))
            .idle_timeout(Some(config.pool.connection_idle()))
            .build(manager)
            .await?;

        tracing::debug!(
            host = %config.host,
            port = config.port,
            pool_size = config.pool.size,
            "Cache client created"
        );

        Ok(Self {
            pool,
            command_timeout: config.command_timeout(),
        })
    }

    async fn checkout(&self) -> CacheResult<bb8::PooledConnection<'_, RedisManager>> {
        self.pool.get().await.map_err(|err| match err {
            bb8::RunError::User(err) => CacheError::Command(err),
            bb8::RunError::TimedOut => {
                CacheError::Unavailable("no cache connection available".to_owned())
            }
        })
    }
}

impl KvStore for CacheClient {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let lookup = async {
            let mut conn = self.checkout().await?;
            let value: Option<String> = conn.get(key).await?;
            Ok(value)
        };
        match tokio::time::timeout(self.command_timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.command_timeout)),
        }
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> CacheResult<()> {
        // SETEX rejects a zero expiry.
        let seconds = ttl.as_secs().max(1);
        let store = async {
            let mut conn = self.checkout().await?;
            conn.set_ex::<_, _, ()>(key, value, seconds).await?;
            Ok(())
        };
        match tokio::time::timeout(self.command_timeout, store).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.command_timeout)),
        }
    }
}
