//! Resolved repository configuration.
//!
//! Configuration is loaded from a TOML file (primary) with environment
//! variable overrides (optional) and consumed read-only by the pool, both
//! tiers, and the cache adapter. The record is immutable after
//! [`RepositoryConfig::validate`] passes; the facade refuses to construct
//! otherwise.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "CACHET_";

/// Config file paths to search (in order).
const CONFIG_PATHS: &[&str] = &["cachet.toml", "config/cachet.toml"];

/// Environment variable for config file path (overrides search).
const CONFIG_PATH_ENV_VAR: &str = "CACHET_CONFIG";

/// Default minimum number of pooled database connections.
pub const DEFAULT_POOL_MIN_SIZE: u32 = 2;

/// Default maximum number of pooled database connections.
pub const DEFAULT_POOL_MAX_SIZE: u32 = 10;

/// Default per-connection connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default bounded wait for a free connection, in milliseconds.
pub const DEFAULT_ACQUIRE_WAIT_MS: u64 = 5_000;

/// Default overall acquire deadline, in milliseconds.
pub const DEFAULT_MAX_WAIT_MS: u64 = 15_000;

/// Default pause between health-check sweeps, in milliseconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

/// Default number of consecutive failed acquires before one warning is logged.
pub const DEFAULT_LOG_SATURATION_THRESHOLD: usize = 100;

/// Default cache command timeout in milliseconds.
pub const DEFAULT_CACHE_COMMAND_TIMEOUT_MS: u64 = 250;

/// Default cache mini-pool size.
pub const DEFAULT_CACHE_POOL_SIZE: u32 = 4;

/// Default wait for a free cache connection, in milliseconds.
pub const DEFAULT_CACHE_POOL_WAIT_MS: u64 = 1_000;

/// Default cache connection lifetime in seconds.
pub const DEFAULT_CACHE_CONNECTION_LIFETIME_SECS: u64 = 1_800;

/// Default cache connection idle time in seconds.
pub const DEFAULT_CACHE_CONNECTION_IDLE_SECS: u64 = 300;

/// Default cache entry TTL in seconds, used when a query has no override.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Relational backend selection.
///
/// All three variants are compiled in; one is active per deployment, chosen
/// by configuration. MariaDB speaks the MySQL wire protocol but keeps its own
/// variant so deployments state what they actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// PostgreSQL.
    Postgres,
    /// MySQL.
    #[serde(rename = "mysql")]
    MySql,
    /// MariaDB.
    #[serde(rename = "mariadb")]
    MariaDb,
}

impl DatabaseBackend {
    /// Well-known port for the backend.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySql | Self::MariaDb => 3306,
        }
    }

    /// Lowercase backend label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MariaDb => "mariadb",
        }
    }
}

impl std::fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TCP keep-alive tuning, applied per session.
///
/// PostgreSQL only: the values are forwarded as `tcp_keepalives_*` session
/// settings. MySQL and MariaDB have no session-level equivalent and ignore
/// this block.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds of inactivity before the first keep-alive probe.
    pub idle_secs: u64,
    /// Seconds between keep-alive probes.
    pub interval_secs: u64,
    /// Unanswered probes before the connection is considered dead.
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            interval_secs: 10,
            count: 3,
        }
    }
}

/// Database connection pool behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum connections the health checker refills to.
    pub min_size: u32,
    /// Hard cap on live connections.
    pub max_size: u32,
    /// How long one acquire waits for a release before reporting saturation.
    pub acquire_wait_ms: u64,
    /// Overall acquire deadline: the database tier keeps issuing fresh
    /// acquires (each bounded by `acquire_wait_ms`) until this passes.
    pub max_wait_ms: u64,
    /// Pause between health-check sweeps.
    pub health_check_interval_ms: u64,
    /// Run the full validation probe before handing a connection out.
    /// When false, acquire only pings.
    pub validate_before_acquire: bool,
    /// Wrap the validation probe in an explicit committed transaction.
    pub validate_using_transaction: bool,
    /// Consecutive failed acquires before a single warning is emitted.
    pub log_saturation_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_POOL_MIN_SIZE,
            max_size: DEFAULT_POOL_MAX_SIZE,
            acquire_wait_ms: DEFAULT_ACQUIRE_WAIT_MS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            validate_before_acquire: true,
            validate_using_transaction: false,
            log_saturation_threshold: DEFAULT_LOG_SATURATION_THRESHOLD,
        }
    }
}

impl PoolConfig {
    /// Bounded wait applied inside one acquire call.
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    /// Overall acquire deadline.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Pause between health-check sweeps.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Database endpoint, credentials, and pool sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Which backend this deployment talks to.
    pub backend: DatabaseBackend,

    /// Database server host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Database server port; backend default when absent.
    #[serde(default)]
    pub port: Option<u16>,

    /// Database (schema) name.
    #[serde(default = "default_database_name")]
    pub name: String,

    /// Login user.
    #[serde(default)]
    pub user: String,

    /// Login password.
    #[serde(default)]
    pub password: String,

    /// Per-connection connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Optional keep-alive tuning (PostgreSQL only).
    #[serde(default)]
    pub keepalive: Option<KeepaliveConfig>,

    /// Pool behavior.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl DatabaseConfig {
    /// Effective server port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.backend.default_port())
    }

    /// Per-connection connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingRequired("database.host".to_owned()));
        }
        if self.name.is_empty() {
            return Err(ConfigError::MissingRequired("database.name".to_owned()));
        }
        if self.user.is_empty() {
            return Err(ConfigError::MissingRequired("database.user".to_owned()));
        }
        if self.pool.min_size < 1 {
            return Err(ConfigError::OutOfRange(
                "database.pool.min_size must be at least 1".to_owned(),
            ));
        }
        if self.pool.max_size < self.pool.min_size {
            return Err(ConfigError::OutOfRange(format!(
                "database.pool.max_size ({}) must be >= min_size ({})",
                self.pool.max_size, self.pool.min_size
            )));
        }
        if self.pool.log_saturation_threshold < 1 {
            return Err(ConfigError::OutOfRange(
                "database.pool.log_saturation_threshold must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Cache mini-pool sizing and timing.
///
/// The cache adapter runs its own small connection pool; these knobs map
/// directly onto it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachePoolConfig {
    /// Number of cache connections.
    pub size: u32,
    /// How long to wait for a free cache connection, in milliseconds.
    pub wait_ms: u64,
    /// Maximum lifetime of one cache connection, in seconds.
    pub connection_lifetime_secs: u64,
    /// Idle time before a cache connection is recycled, in seconds.
    pub connection_idle_secs: u64,
}

impl Default for CachePoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CACHE_POOL_SIZE,
            wait_ms: DEFAULT_CACHE_POOL_WAIT_MS,
            connection_lifetime_secs: DEFAULT_CACHE_CONNECTION_LIFETIME_SECS,
            connection_idle_secs: DEFAULT_CACHE_CONNECTION_IDLE_SECS,
        }
    }
}

impl CachePoolConfig {
    /// Wait for a free cache connection.
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    /// Maximum lifetime of one cache connection.
    pub fn connection_lifetime(&self) -> Duration {
        Duration::from_secs(self.connection_lifetime_secs)
    }

    /// Idle time before a cache connection is recycled.
    pub fn connection_idle(&self) -> Duration {
        Duration::from_secs(self.connection_idle_secs)
    }
}

/// Cache endpoint, credentials, and per-query TTLs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache server host.
    pub host: String,

    /// Cache server port.
    pub port: u16,

    /// Logical database index (0..=15).
    pub index: i64,

    /// Optional ACL username.
    pub username: Option<String>,

    /// Optional password.
    pub password: Option<String>,

    /// Client label announced to the server; empty disables the announcement.
    pub client_name: String,

    /// Per-command timeout in milliseconds.
    pub command_timeout_ms: u64,

    /// TTL applied to cache entries when the query has no override.
    pub default_ttl_secs: u64,

    /// Per-query TTL overrides, keyed by query name.
    pub ttl_secs: HashMap<String, u64>,

    /// Mini-pool sizing and timing.
    pub pool: CachePoolConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 6379,
            index: 0,
            username: None,
            password: None,
            client_name: "cachet".to_owned(),
            command_timeout_ms: DEFAULT_CACHE_COMMAND_TIMEOUT_MS,
            default_ttl_secs: DEFAULT_TTL_SECS,
            ttl_secs: HashMap::new(),
            pool: CachePoolConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Per-command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// TTL for one query, falling back to the default.
    pub fn ttl_for(&self, query: &str) -> Duration {
        let secs = self
            .ttl_secs
            .get(query)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingRequired("cache.host".to_owned()));
        }
        if !(0..=15).contains(&self.index) {
            return Err(ConfigError::OutOfRange(format!(
                "cache.index ({}) must be within 0..=15",
                self.index
            )));
        }
        if self.pool.size < 1 {
            return Err(ConfigError::OutOfRange(
                "cache.pool.size must be at least 1".to_owned(),
            ));
        }
        if self.default_ttl_secs < 1 {
            return Err(ConfigError::OutOfRange(
                "cache.default_ttl_secs must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// The full resolved configuration record.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Database endpoint and pool behavior.
    pub database: DatabaseConfig,

    /// Cache endpoint and TTL policy.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl RepositoryConfig {
    /// Load configuration from TOML file with environment variable overrides.
    ///
    /// Configuration priority (highest to lowest):
    /// 1. Environment variables (`CACHET_*`)
    /// 2. TOML config file
    /// 3. Default values
    ///
    /// Config file search order:
    /// 1. `CACHET_CONFIG` env var (if set)
    /// 2. `./cachet.toml`
    /// 3. `./config/cachet.toml`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var(CONFIG_PATH_ENV_VAR).ok().or_else(|| {
            CONFIG_PATHS
                .iter()
                .find(|p| Path::new(p).exists())
                .map(|s| (*s).to_owned())
        });

        let mut config = match &config_path {
            Some(path) if Path::new(path).exists() => {
                tracing::info!(path = %path, "Loading configuration from file");
                let content = std::fs::read_to_string(path)?;
                Self::from_toml_str(&content)?
            }
            _ => {
                return Err(ConfigError::MissingRequired(format!(
                    "config file (searched {CONFIG_PATHS:?}, and {CONFIG_PATH_ENV_VAR})"
                )));
            }
        };

        config.apply_overrides(|name| env::var(format!("{ENV_PREFIX}{name}")).ok());
        Ok(config)
    }

    /// Parse a TOML document into a configuration record.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply deployment overrides from a variable lookup.
    ///
    /// [`load`](Self::load) passes the process environment; tests pass a map.
    /// Only endpoint and credential fields are overridable — behavior knobs
    /// stay in the file.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("DB_PORT").and_then(|v| v.parse().ok()) {
            self.database.port = Some(v);
        }
        if let Some(v) = get("DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = get("DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = get("DB_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = get("CACHE_HOST") {
            self.cache.host = v;
        }
        if let Some(v) = get("CACHE_PORT").and_then(|v| v.parse().ok()) {
            self.cache.port = v;
        }
        if let Some(v) = get("CACHE_PASSWORD") {
            self.cache.password = Some(v);
        }
    }

    /// Check every range rule; the facade aborts construction on `Err`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_database_name() -> String {
    "cachet".to_owned()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [database]
            backend = "mariadb"
            user = "app"
            password = "secret"
        "#
    }

    /// A minimal document parses and picks up every default.
    #[test]
    fn test_minimal_document_defaults() {
        let config = RepositoryConfig::from_toml_str(minimal_toml()).unwrap();

        assert_eq!(config.database.backend, DatabaseBackend::MariaDb);
        assert_eq!(config.database.port(), 3306);
        assert_eq!(config.database.name, "cachet");
        assert_eq!(config.database.pool.min_size, DEFAULT_POOL_MIN_SIZE);
        assert_eq!(config.database.pool.max_size, DEFAULT_POOL_MAX_SIZE);
        assert!(config.database.pool.validate_before_acquire);
        assert_eq!(config.cache.port, 6379);
        assert_eq!(
            config.cache.ttl_for("anything"),
            Duration::from_secs(DEFAULT_TTL_SECS)
        );
        assert!(config.validate().is_ok());
    }

    /// Backend selection drives the default port.
    #[test]
    fn test_backend_default_ports() {
        assert_eq!(DatabaseBackend::Postgres.default_port(), 5432);
        assert_eq!(DatabaseBackend::MySql.default_port(), 3306);
        assert_eq!(DatabaseBackend::MariaDb.default_port(), 3306);
    }

    /// An explicit port beats the backend default.
    #[test]
    fn test_explicit_port_wins() {
        let toml = r#"
            [database]
            backend = "postgres"
            user = "app"
            port = 6432
        "#;
        let config = RepositoryConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.database.port(), 6432);
    }

    /// min_size > max_size is rejected at validation.
    #[test]
    fn test_pool_bounds_rejected() {
        let toml = r#"
            [database]
            backend = "mysql"
            user = "app"

            [database.pool]
            min_size = 8
            max_size = 4
        "#;
        let config = RepositoryConfig::from_toml_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange(_)));
    }

    /// A zero minimum pool size is rejected.
    #[test]
    fn test_zero_min_size_rejected() {
        let toml = r#"
            [database]
            backend = "mysql"
            user = "app"

            [database.pool]
            min_size = 0
        "#;
        let config = RepositoryConfig::from_toml_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange(_))
        ));
    }

    /// A missing user is caught by validation, not by parsing.
    #[test]
    fn test_missing_user_rejected() {
        let toml = r#"
            [database]
            backend = "postgres"
        "#;
        let config = RepositoryConfig::from_toml_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    /// A cache index outside the server's range is rejected.
    #[test]
    fn test_cache_index_range() {
        let toml = r#"
            [database]
            backend = "postgres"
            user = "app"

            [cache]
            index = 16
        "#;
        let config = RepositoryConfig::from_toml_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange(_))
        ));
    }

    /// Per-query TTL overrides win over the default.
    #[test]
    fn test_ttl_override() {
        let toml = r#"
            [database]
            backend = "mariadb"
            user = "app"

            [cache]
            default_ttl_secs = 120

            [cache.ttl_secs]
            echo_string = 30
        "#;
        let config = RepositoryConfig::from_toml_str(toml).unwrap();
        assert_eq!(
            config.cache.ttl_for("echo_string"),
            Duration::from_secs(30)
        );
        assert_eq!(config.cache.ttl_for("sum_int"), Duration::from_secs(120));
    }

    /// Overrides replace endpoint fields and leave the rest untouched.
    #[test]
    fn test_apply_overrides() {
        let mut config = RepositoryConfig::from_toml_str(minimal_toml()).unwrap();

        config.apply_overrides(|name| match name {
            "DB_HOST" => Some("db.internal".to_owned()),
            "DB_PORT" => Some("3307".to_owned()),
            "CACHE_PASSWORD" => Some("hunter2".to_owned()),
            _ => None,
        });

        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port(), 3307);
        assert_eq!(config.cache.password.as_deref(), Some("hunter2"));
        assert_eq!(config.database.user, "app");
        assert_eq!(config.cache.host, "127.0.0.1");
    }

    /// Unparseable override values are ignored rather than fatal.
    #[test]
    fn test_bad_override_ignored() {
        let mut config = RepositoryConfig::from_toml_str(minimal_toml()).unwrap();
        config.apply_overrides(|name| (name == "DB_PORT").then(|| "not-a-port".to_owned()));
        assert_eq!(config.database.port(), 3306);
    }
}
