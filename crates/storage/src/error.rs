//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("multipart upload not found: {0}")]
    UploadNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid part: {0}")]
    InvalidPart(String),

    #[error("part count mismatch: expected {expected}, got {actual}")]
    PartCountMismatch { expected: u32, actual: usize },

    #[error("blob store call timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the error means the target is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::UploadNotFound(_))
    }
}

impl From<cabinet_core::Error> for StorageError {
    fn from(err: cabinet_core::Error) -> Self {
        Self::InvalidPart(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
