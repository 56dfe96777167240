//! Metadata store error types.

use thiserror::Error;

/// SQLSTATE / SQLite result codes the store reports when two transactions
/// could not both have run first. Retrying the whole unit of work is safe.
const SERIALIZATION_CODES: &[&str] = &[
    "40001", // PostgreSQL serialization_failure
    "40P01", // PostgreSQL deadlock_detected
    "5",     // SQLITE_BUSY
    "6",     // SQLITE_LOCKED
    "261",   // SQLITE_BUSY_RECOVERY
    "517",   // SQLITE_BUSY_SNAPSHOT
    "773",   // SQLITE_BUSY_TIMEOUT
];

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    #[error("quota exceeded: {requested} bytes requested with {consumed} of {quota} in use")]
    QuotaExceeded {
        quota: i64,
        consumed: i64,
        requested: i64,
    },

    #[error("containing folder does not exist: {0}")]
    ParentMissing(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Check if the error is a serialization conflict that warrants
    /// re-running the transaction from the start.
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            Self::SerializationFailure(_) => true,
            Self::Database(sqlx::Error::Database(db_err)) => db_err
                .code()
                .is_some_and(|code| SERIALIZATION_CODES.contains(&code.as_ref())),
            _ => false,
        }
    }

    /// Check if the error is a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }

    /// Rewrite a raw uniqueness violation into [`MetadataError::AlreadyExists`].
    pub(crate) fn on_conflict(self, what: impl FnOnce() -> String) -> Self {
        match self {
            Self::Database(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Self::AlreadyExists(what())
            }
            other => other,
        }
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

impl From<cabinet_core::Error> for MetadataError {
    fn from(e: cabinet_core::Error) -> Self {
        MetadataError::Internal(e.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
