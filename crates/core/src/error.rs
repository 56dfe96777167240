//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid file size: {0}")]
    InvalidSize(u64),

    #[error("file too large: {size} bytes (maximum {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("invalid {kind}: {value}")]
    InvalidEnum { kind: &'static str, value: String },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
