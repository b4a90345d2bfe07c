//! Shared error types.

use thiserror::Error;

/// Failures surfaced by repository query operations.
///
/// The kinds matter more than the messages: `Broken` is the retryable class
/// (callers typically map it to 503), everything else needs operator
/// attention.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A backend is unreachable or rejected the session (network refusal,
    /// server gone, credentials denied, database missing, connection cap).
    #[error("Broken connection: {0}")]
    Broken(String),

    /// Server-side statement failure on an otherwise healthy connection.
    #[error("Database error: {0}")]
    Sql(String),

    /// Anything that fits no other kind. Never swallowed.
    #[error("Unexpected failure: {0}")]
    Unknown(String),
}

impl QueryError {
    /// Create a broken-connection error with context.
    pub fn broken<S: Into<String>>(msg: S) -> Self {
        Self::Broken(msg.into())
    }

    /// Create a server-side SQL error.
    pub fn sql<S: Into<String>>(msg: S) -> Self {
        Self::Sql(msg.into())
    }

    /// Create an unexpected-failure error.
    pub fn unknown<S: Into<String>>(msg: S) -> Self {
        Self::Unknown(msg.into())
    }

    /// Check if this is the retryable broken-connection kind.
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Broken(_))
    }
}

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Configuration loading and validation errors.
///
/// Raised at startup only; the facade refuses to construct on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A required value is absent.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A value is present but outside its allowed range.
    #[error("Configuration value out of range: {0}")]
    OutOfRange(String),
}
