//! Query operation contract.
//!
//! Every typed query the repository exposes is declared here once; the cache
//! tier, the database tier, and the facade all implement [`QueryOps`]. The
//! trait is the seam that lets the cache tier delegate to *any* upstream data
//! source — in production the database tier, in tests an in-memory fake.

use crate::error::QueryResult;

/// Query name used for cache keys and TTL lookup of [`QueryOps::echo_string`].
pub const ECHO_STRING: &str = "echo_string";

/// Query name used for cache keys and TTL lookup of [`QueryOps::sum_int`].
pub const SUM_INT: &str = "sum_int";

/// The fixed set of typed query operations.
///
/// Implementations return `Ok(None)` when the query produced no row (or the
/// component is shutting down), `Err` only for the failure kinds in
/// [`QueryError`](crate::error::QueryError).
pub trait QueryOps: Send + Sync {
    /// Round-trip a string through the active backend.
    fn echo_string(&self, input: &str) -> impl Future<Output = QueryResult<Option<String>>> + Send;

    /// Sum two integers in SQL and return the total rendered as text.
    fn sum_int(&self, a: i32, b: i32) -> impl Future<Output = QueryResult<Option<String>>> + Send;
}
