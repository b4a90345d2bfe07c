//! Database driver adapter.
//!
//! One connection handle variant per backend, over raw sqlx connections.
//! All three variants are compiled in; the configured backend decides which
//! one a deployment opens. The adapter owns the open/validate/close
//! lifecycle and the authoritative classification of backend failures into
//! the broken-connection kind.

use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError};
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, MySqlConnection, PgConnection};

use cachet_core::config::{DatabaseBackend, DatabaseConfig};
use cachet_core::error::{QueryError, QueryResult};

use crate::connector::QueryHandle;

/// MySQL / MariaDB error numbers that mean the link (or the session) is
/// gone rather than the statement being wrong.
///
/// 2002 CR_CONNECTION_ERROR, 2003 CR_CONN_HOST_ERROR,
/// 2006 CR_SERVER_GONE_ERROR, 2013 CR_SERVER_LOST,
/// 1040 ER_CON_COUNT_ERROR, 1044 ER_DBACCESS_DENIED_ERROR,
/// 1045 ER_ACCESS_DENIED_ERROR, 1049 ER_BAD_DB_ERROR,
/// 1927 ER_CONNECTION_KILLED.
const MYSQL_BROKEN_CODES: &[u32] = &[2002, 2003, 2006, 2013, 1040, 1044, 1045, 1049, 1927];

/// PostgreSQL SQLSTATEs treated the same way: invalid authorization (28xxx),
/// missing database (3D000), too many connections (53300), and server
/// shutdown/crash (57P01..57P03). Class 08 (connection exceptions) is matched
/// by prefix.
const PG_BROKEN_STATES: &[&str] = &["28000", "28P01", "3D000", "53300", "57P01", "57P02", "57P03"];

fn mysql_code_is_broken(code: u32) -> bool {
    MYSQL_BROKEN_CODES.contains(&code)
}

fn pg_state_is_broken(state: &str) -> bool {
    state.starts_with("08") || PG_BROKEN_STATES.contains(&state)
}

/// Map a sqlx failure during statement execution into the repository
/// taxonomy.
///
/// Transport-level failures are always `Broken`. Server-reported errors are
/// `Broken` only for the per-backend code tables above; everything else the
/// server says about a statement is a plain `Sql` error and must not evict
/// the connection. Connection lifecycle paths use
/// [`classify_lifecycle`] instead.
pub(crate) fn classify_statement(backend: DatabaseBackend, err: sqlx::Error) -> QueryError {
    match err {
        sqlx::Error::Io(e) => QueryError::broken(format!("{backend} I/O failure: {e}")),
        sqlx::Error::Tls(e) => QueryError::broken(format!("{backend} TLS failure: {e}")),
        sqlx::Error::Protocol(e) => {
            QueryError::broken(format!("{backend} protocol violation: {e}"))
        }
        sqlx::Error::Database(db) => {
            let broken = match backend {
                DatabaseBackend::Postgres => db
                    .code()
                    .is_some_and(|state| pg_state_is_broken(state.as_ref())),
                DatabaseBackend::MySql | DatabaseBackend::MariaDb => db
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .is_some_and(|e| mysql_code_is_broken(e.number().into())),
            };
            if broken {
                QueryError::broken(format!("{backend} connection broken: {db}"))
            } else {
                QueryError::sql(db.to_string())
            }
        }
        other => QueryError::unknown(other.to_string()),
    }
}

/// Map a sqlx failure during connection lifecycle (open, validate, ping)
/// into the repository taxonomy.
///
/// A connection that cannot open or answer its trivial probe is broken no
/// matter which code the server attached; the statement-level `Sql` kind
/// exists only for queries running on an otherwise healthy connection.
pub(crate) fn classify_lifecycle(backend: DatabaseBackend, err: sqlx::Error) -> QueryError {
    if let sqlx::Error::Database(db) = &err {
        return QueryError::broken(format!("{backend} connection invalid: {db}"));
    }
    classify_statement(backend, err)
}

/// One open database connection.
///
/// MariaDB speaks the MySQL wire protocol, so both ride
/// [`MySqlConnection`]; the variants stay separate so logs and error
/// messages name what the deployment actually runs.
#[derive(Debug)]
pub enum DbHandle {
    /// PostgreSQL connection.
    Postgres(PgConnection),
    /// MySQL connection.
    MySql(MySqlConnection),
    /// MariaDB connection.
    MariaDb(MySqlConnection),
}

impl DbHandle {
    pub(crate) fn backend(&self) -> DatabaseBackend {
        match self {
            Self::Postgres(_) => DatabaseBackend::Postgres,
            Self::MySql(_) => DatabaseBackend::MySql,
            Self::MariaDb(_) => DatabaseBackend::MariaDb,
        }
    }

    /// Open one connection per the configured backend, bounded by the
    /// configured connect timeout.
    pub(crate) async fn open(config: &DatabaseConfig) -> QueryResult<Self> {
        let backend = config.backend;
        let connect = Self::connect(config);

        match tokio::time::timeout(config.connect_timeout(), connect).await {
            Ok(result) => result.map_err(|e| classify_lifecycle(backend, e)),
            Err(_) => Err(QueryError::broken(format!(
                "{backend} connect timed out after {}s",
                config.connect_timeout_secs
            ))),
        }
    }

    async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        match config.backend {
            DatabaseBackend::Postgres => {
                let mut options = PgConnectOptions::new()
                    .host(&config.host)
                    .port(config.port())
                    .database(&config.name)
                    .username(&config.user)
                    .password(&config.password);

                // Keep-alives ride along as per-session server settings.
                if let Some(keepalive) = &config.keepalive {
                    options = options.options([
                        ("tcp_keepalives_idle", keepalive.idle_secs.to_string()),
                        ("tcp_keepalives_interval", keepalive.interval_secs.to_string()),
                        ("tcp_keepalives_count", keepalive.count.to_string()),
                    ]);
                }

                PgConnection::connect_with(&options).await.map(Self::Postgres)
            }
            DatabaseBackend::MySql | DatabaseBackend::MariaDb => {
                let options = MySqlConnectOptions::new()
                    .host(&config.host)
                    .port(config.port())
                    .database(&config.name)
                    .username(&config.user)
                    .password(&config.password);

                let conn = MySqlConnection::connect_with(&options).await?;

                Ok(match config.backend {
                    DatabaseBackend::MariaDb => Self::MariaDb(conn),
                    _ => Self::MySql(conn),
                })
            }
        }
    }

    /// Liveness probe: a trivial `SELECT 1` round-trip, optionally wrapped
    /// in an explicit committed transaction. Auto-commit is back in force
    /// once the probe transaction commits.
    pub(crate) async fn validate(&mut self, use_transaction: bool) -> QueryResult<()> {
        let backend = self.backend();
        let result = if use_transaction {
            self.probe_in_transaction().await
        } else {
            self.probe().await
        };
        result.map_err(|e| classify_lifecycle(backend, e))
    }

    async fn probe(&mut self) -> Result<(), sqlx::Error> {
        match self {
            Self::Postgres(conn) => {
                sqlx::query_scalar::<_, i32>("SELECT 1")
                    .fetch_one(&mut *conn)
                    .await?;
            }
            Self::MySql(conn) | Self::MariaDb(conn) => {
                sqlx::query_scalar::<_, i32>("SELECT 1")
                    .fetch_one(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn probe_in_transaction(&mut self) -> Result<(), sqlx::Error> {
        match self {
            Self::Postgres(conn) => {
                let mut tx = conn.begin().await?;
                sqlx::query_scalar::<_, i32>("SELECT 1")
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await
            }
            Self::MySql(conn) | Self::MariaDb(conn) => {
                let mut tx = conn.begin().await?;
                sqlx::query_scalar::<_, i32>("SELECT 1")
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await
            }
        }
    }

    /// Cheap liveness test used when full validation is disabled.
    pub(crate) async fn ping(&mut self) -> QueryResult<()> {
        let backend = self.backend();
        let result = match self {
            Self::Postgres(conn) => conn.ping().await,
            Self::MySql(conn) | Self::MariaDb(conn) => conn.ping().await,
        };
        result.map_err(|e| classify_lifecycle(backend, e))
    }

    /// Close the connection. Consuming the handle makes a double close
    /// unrepresentable; a link that is already gone only logs.
    pub(crate) async fn close(self) {
        let backend = self.backend();
        let result = match self {
            Self::Postgres(conn) => conn.close().await,
            Self::MySql(conn) | Self::MariaDb(conn) => conn.close().await,
        };
        if let Err(err) = result {
            tracing::debug!("{} connection already broken during close: {}", backend, err);
        }
    }
}

// Each statement runs inside a short explicit transaction; on a failed path
// the transaction guard issues the rollback when it drops, restoring
// auto-commit either way.
impl QueryHandle for DbHandle {
    async fn echo_string(&mut self, input: &str) -> QueryResult<Option<String>> {
        let backend = self.backend();
        let result: Result<Option<String>, sqlx::Error> = match self {
            Self::Postgres(conn) => {
                async {
                    let mut tx = conn.begin().await?;
                    let row = sqlx::query_scalar::<_, String>("SELECT $1::text AS echoed")
                        .bind(input)
                        .fetch_optional(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(row)
                }
                .await
            }
            Self::MySql(conn) | Self::MariaDb(conn) => {
                async {
                    let mut tx = conn.begin().await?;
                    let row = sqlx::query_scalar::<_, String>("SELECT ? AS echoed")
                        .bind(input)
                        .fetch_optional(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(row)
                }
                .await
            }
        };
        result.map_err(|e| classify_statement(backend, e))
    }

    async fn sum_int(&mut self, a: i32, b: i32) -> QueryResult<Option<String>> {
        let backend = self.backend();
        let result: Result<Option<String>, sqlx::Error> = match self {
            Self::Postgres(conn) => {
                async {
                    let mut tx = conn.begin().await?;
                    let row = sqlx::query_scalar::<_, String>(
                        "SELECT ($1::int4 + $2::int4)::text AS total",
                    )
                    .bind(a)
                    .bind(b)
                    .fetch_optional(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok(row)
                }
                .await
            }
            Self::MySql(conn) | Self::MariaDb(conn) => {
                async {
                    let mut tx = conn.begin().await?;
                    let row = sqlx::query_scalar::<_, String>("SELECT CAST(? + ? AS CHAR) AS total")
                        .bind(a)
                        .bind(b)
                        .fetch_optional(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(row)
                }
                .await
            }
        };
        result.map_err(|e| classify_statement(backend, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport failures classify as broken regardless of backend.
    #[test]
    fn test_transport_errors_are_broken() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(classify_statement(DatabaseBackend::MariaDb, io).is_broken());

        let protocol = sqlx::Error::Protocol("unexpected packet".to_owned());
        assert!(classify_statement(DatabaseBackend::Postgres, protocol).is_broken());
    }

    /// Failures outside the transport and the code tables surface as Unknown.
    #[test]
    fn test_other_errors_are_unknown() {
        let err = classify_statement(DatabaseBackend::MySql, sqlx::Error::RowNotFound);
        assert!(matches!(err, QueryError::Unknown(_)));
    }

    /// Lifecycle classification never produces the statement-level SQL
    /// kind: transport failures are broken, and oddities that fit no kind
    /// stay Unknown rather than masquerading as statement errors.
    #[test]
    fn test_lifecycle_never_yields_sql() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(classify_lifecycle(DatabaseBackend::Postgres, io).is_broken());

        let err = classify_lifecycle(DatabaseBackend::MySql, sqlx::Error::RowNotFound);
        assert!(matches!(err, QueryError::Unknown(_)));
    }

    /// The MySQL/MariaDB broken-code table matches the connectivity and
    /// auth classes, and nothing else.
    #[test]
    fn test_mysql_broken_codes() {
        for code in [2002, 2003, 2006, 2013, 1040, 1044, 1045, 1049, 1927] {
            assert!(mysql_code_is_broken(code), "code {code} should be broken");
        }
        // 1064 syntax error, 1146 missing table: plain SQL errors.
        assert!(!mysql_code_is_broken(1064));
        assert!(!mysql_code_is_broken(1146));
    }

    /// The PostgreSQL table matches connection-class states by prefix and
    /// the listed auth/shutdown states exactly.
    #[test]
    fn test_pg_broken_states() {
        for state in ["08000", "08006", "08001", "28P01", "3D000", "53300", "57P01"] {
            assert!(pg_state_is_broken(state), "state {state} should be broken");
        }
        // 42601 syntax error, 23505 unique violation: plain SQL errors.
        assert!(!pg_state_is_broken("42601"));
        assert!(!pg_state_is_broken("23505"));
    }
}
