//! Error types for tandem

use thiserror::Error;

/// Result type alias for tandem operations
pub type Result<T> = std::result::Result<T, TandemError>;

/// Unified error type for all tandem operations
#[derive(Error, Debug, Clone)]
pub enum TandemError {
    /// A backend could not establish or validate a connection. Carries the
    /// backend kind as a plain string so this crate stays driver-agnostic.
    #[error("Connection failure ({backend}): {message}")]
    ConnectionFailure { backend: String, message: String },

    /// An acquire waited past its deadline.
    #[error("Pool timeout: {0}")]
    PoolTimeout(String),

    /// Both backends were unavailable during failover.
    #[error("Failover failure: {0}")]
    FailoverFailure(String),

    /// An operation or migration failed precondition checks.
    #[error("Validation failure: {0}")]
    ValidationFailure(String),

    /// The backend rejected a statement or the transaction aborted.
    #[error("Transaction failure: {message}")]
    TransactionFailure {
        message: String,
        rollback_performed: bool,
    },

    /// Migration apply or rollback failed.
    #[error("Migration failure ({migration_id}): {message}")]
    MigrationFailure {
        migration_id: String,
        message: String,
    },

    /// Current vs expected schema version mismatch.
    #[error("Schema version conflict: current {current}, expected {expected}")]
    SchemaVersionConflict { current: String, expected: String },

    /// User lacks access to the tenant.
    #[error("Tenant access denied for user {user_id} on tenant {tenant_id}: {message}")]
    TenantAccessDenied {
        tenant_id: String,
        user_id: String,
        message: String,
    },

    /// Cross-tenant data or query detected.
    #[error("Isolation violation: {0}")]
    IsolationViolation(String),

    /// Backend health probe failed.
    #[error("Health check failure ({backend}): {message}")]
    HealthCheckFailure { backend: String, message: String },

    /// The backend does not support the requested operation.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Deadlock detected (retryable).
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Serialization failure or other transient fault (retryable).
    #[error("Transient error: {0}")]
    Transient(String),

    /// Query-level failure that fits no more specific kind.
    #[error("Query error: {0}")]
    Query(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal invariant broken.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TandemError {
    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TandemError::Deadlock(_) | TandemError::Transient(_) | TandemError::PoolTimeout(_)
        )
    }

    /// Shorthand for a connection failure against a named backend.
    pub fn connection(backend: impl Into<String>, message: impl Into<String>) -> Self {
        TandemError::ConnectionFailure {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a migration failure with its offending id.
    pub fn migration(migration_id: impl Into<String>, message: impl Into<String>) -> Self {
        TandemError::MigrationFailure {
            migration_id: migration_id.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        TandemError::Serialization(err.to_string())
    }
}

// SQLSTATE-aware classification (when the sqlx-errors feature is enabled)
#[cfg(feature = "sqlx-errors")]
impl From<sqlx::Error> for TandemError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error;
        match &err {
            Error::Configuration(_) => TandemError::connection("unknown", err.to_string()),
            Error::Database(db_err) => {
                // Classify by SQLSTATE where the driver exposes one.
                // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
                if let Some(code) = db_err.code() {
                    let code_str: &str = &code;
                    match code_str {
                        // Deadlock detected
                        "40P01" => return TandemError::Deadlock(err.to_string()),
                        // Serialization failure (can retry)
                        "40001" => return TandemError::Transient(err.to_string()),
                        // Transaction rollback class
                        code if code.starts_with("40") => {
                            return TandemError::Transient(err.to_string())
                        }
                        // Connection errors (class 08)
                        code if code.starts_with("08") => {
                            return TandemError::connection("unknown", err.to_string())
                        }
                        // Integrity / check constraint classes
                        code if code.starts_with("23") => {
                            return TandemError::ValidationFailure(err.to_string())
                        }
                        // Operator intervention / admin shutdown (class 57)
                        "57P01" | "57P02" | "57P03" => {
                            return TandemError::Transient(err.to_string())
                        }
                        _ => {}
                    }
                }
                TandemError::Query(err.to_string())
            }
            Error::Io(_) => TandemError::connection("unknown", err.to_string()),
            Error::Tls(_) => TandemError::connection("unknown", err.to_string()),
            Error::Protocol(_) => TandemError::connection("unknown", err.to_string()),
            Error::RowNotFound => TandemError::Query("Row not found".to_string()),
            Error::ColumnNotFound(_) => TandemError::Query(err.to_string()),
            Error::ColumnIndexOutOfBounds { .. } => TandemError::Query(err.to_string()),
            Error::ColumnDecode { .. } => TandemError::Serialization(err.to_string()),
            Error::Decode(_) => TandemError::Serialization(err.to_string()),
            Error::PoolTimedOut => TandemError::PoolTimeout("driver pool timed out".to_string()),
            Error::PoolClosed => TandemError::connection("unknown", "driver pool closed"),
            Error::WorkerCrashed => TandemError::Internal("worker thread crashed".to_string()),
            _ => TandemError::Query(err.to_string()),
        }
    }
}
