//! Connection lifecycle and statement seams.
//!
//! The pool is generic over [`Connector`] so its lifecycle logic can be
//! exercised without a live database, and the database tier is generic over
//! handles implementing [`QueryHandle`] for the same reason. The production
//! pair is [`SqlConnector`] / [`DbHandle`].

use cachet_core::config::DatabaseConfig;
use cachet_core::error::QueryResult;

use crate::backend::DbHandle;

/// Opens, probes, and closes backend connections on behalf of the pool.
pub trait Connector: Send + Sync + 'static {
    /// The backend-specific connection handle.
    type Handle: Send + std::fmt::Debug + 'static;

    /// Open a fresh connection.
    fn open(&self) -> impl Future<Output = QueryResult<Self::Handle>> + Send;

    /// Full validation probe: a trivial round-trip, optionally inside an
    /// explicit committed transaction.
    fn validate(
        &self,
        handle: &mut Self::Handle,
        use_transaction: bool,
    ) -> impl Future<Output = QueryResult<()>> + Send;

    /// Cheap liveness test.
    fn ping(&self, handle: &mut Self::Handle) -> impl Future<Output = QueryResult<()>> + Send;

    /// Close a connection, tolerating an already-broken link.
    fn close(&self, handle: Self::Handle) -> impl Future<Output = ()> + Send;
}

/// Statement execution exposed by a pooled connection handle.
///
/// One method per typed query; implementations run the statement inside a
/// short explicit transaction and classify failures into the repository
/// taxonomy.
pub trait QueryHandle: Send {
    /// `SELECT` the input string back from the server.
    fn echo_string(&mut self, input: &str)
    -> impl Future<Output = QueryResult<Option<String>>> + Send;

    /// Sum two integers server-side and return the total as text.
    fn sum_int(&mut self, a: i32, b: i32)
    -> impl Future<Output = QueryResult<Option<String>>> + Send;
}

/// Production connector over the sqlx-backed driver adapter.
#[derive(Debug, Clone)]
pub struct SqlConnector {
    config: DatabaseConfig,
}

impl SqlConnector {
    /// Build a connector for the configured backend and endpoint.
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

impl Connector for SqlConnector {
    type Handle = DbHandle;

    async fn open(&self) -> QueryResult<DbHandle> {
        DbHandle::open(&self.config).await
    }

    async fn validate(&self, handle: &mut DbHandle, use_transaction: bool) -> QueryResult<()> {
        handle.validate(use_transaction).await
    }

    async fn ping(&self, handle: &mut DbHandle) -> QueryResult<()> {
        handle.ping().await
    }

    async fn close(&self, handle: DbHandle) {
        handle.close().await;
    }
}
