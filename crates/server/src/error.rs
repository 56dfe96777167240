//! Operation error types and their outcome categories.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cabinet_metadata::MetadataError;
use cabinet_storage::StorageError;
use serde::Serialize;

/// The fixed set of outcomes a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TooLarge,
    Internal,
}

impl Outcome {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upload not finished: {0}")]
    UploadInProgress(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] cabinet_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::UploadInProgress(_) => "upload_in_progress",
            Self::Internal(_) => "internal_error",
            Self::Storage(e) => match e {
                StorageError::NotFound(_) | StorageError::UploadNotFound(_) => "blob_not_found",
                StorageError::InvalidKey(_) => "invalid_key",
                StorageError::InvalidPart(_) | StorageError::PartCountMismatch { .. } => {
                    "invalid_parts"
                }
                StorageError::Timeout(_) => "storage_timeout",
                _ => "storage_error",
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => "not_found",
                MetadataError::AlreadyExists(_) => "already_exists",
                MetadataError::InsufficientPermission(_) => "insufficient_permission",
                MetadataError::QuotaExceeded { .. } => "quota_exceeded",
                MetadataError::ParentMissing(_) => "parent_missing",
                MetadataError::Invalid(_) => "bad_request",
                MetadataError::InvalidState(_) => "invalid_state",
                MetadataError::RetriesExhausted { .. } => "retries_exhausted",
                MetadataError::Timeout(_) => "metadata_timeout",
                _ => "metadata_error",
            },
            Self::Core(e) => match e {
                cabinet_core::Error::InvalidPath(_) => "invalid_path",
                cabinet_core::Error::InvalidName(_) => "invalid_name",
                cabinet_core::Error::InvalidSize(_) => "invalid_size",
                cabinet_core::Error::FileTooLarge { .. } => "file_too_large",
                cabinet_core::Error::InvalidEnum { .. } => "bad_request",
            },
        }
    }

    /// Get the outcome category for this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::NotFound(_) => Outcome::NotFound,
            Self::BadRequest(_) => Outcome::BadRequest,
            Self::Unauthorized(_) => Outcome::Unauthorized,
            Self::Forbidden(_) => Outcome::Forbidden,
            Self::Conflict(_) | Self::UploadInProgress(_) => Outcome::Conflict,
            Self::Internal(_) => Outcome::Internal,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) | StorageError::UploadNotFound(_) => Outcome::NotFound,
                StorageError::InvalidKey(_)
                | StorageError::InvalidPart(_)
                | StorageError::PartCountMismatch { .. } => Outcome::BadRequest,
                _ => Outcome::Internal,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => Outcome::NotFound,
                MetadataError::AlreadyExists(_)
                | MetadataError::ParentMissing(_)
                | MetadataError::InvalidState(_) => Outcome::Conflict,
                MetadataError::InsufficientPermission(_) | MetadataError::QuotaExceeded { .. } => {
                    Outcome::Forbidden
                }
                MetadataError::Invalid(_) => Outcome::BadRequest,
                _ => Outcome::Internal,
            },
            Self::Core(e) => match e {
                cabinet_core::Error::FileTooLarge { .. } => Outcome::TooLarge,
                _ => Outcome::BadRequest,
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.outcome().status_code()
    }

    /// Message safe to show the caller. Internal failures are not described.
    pub fn public_message(&self) -> String {
        match self.outcome() {
            Outcome::Internal => match self {
                Self::Metadata(MetadataError::RetriesExhausted { .. }) => {
                    "the operation conflicted with concurrent changes, try again".to_string()
                }
                _ => "internal error".to_string(),
            },
            _ => match self {
                Self::Storage(e) => e.to_string(),
                Self::Metadata(e) => e.to_string(),
                Self::Core(e) => e.to_string(),
                other => other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "operation failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for lifecycle operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_omits_layer_prefix() {
        let quota = ApiError::from(MetadataError::QuotaExceeded {
            quota: 10,
            consumed: 8,
            requested: 5,
        });
        assert_eq!(
            quota.public_message(),
            "quota exceeded: 5 bytes requested with 8 of 10 in use"
        );

        let exists = ApiError::from(MetadataError::AlreadyExists("repository 'docs'".into()));
        assert_eq!(exists.public_message(), "already exists: repository 'docs'");
        assert!(exists.to_string().starts_with("metadata error"));
    }

    #[test]
    fn test_gate_failures_map_to_fixed_outcomes() {
        let cases = [
            (
                ApiError::from(MetadataError::InsufficientPermission("x".into())),
                Outcome::Forbidden,
            ),
            (
                ApiError::from(MetadataError::QuotaExceeded {
                    quota: 1,
                    consumed: 1,
                    requested: 1,
                }),
                Outcome::Forbidden,
            ),
            (
                ApiError::from(MetadataError::AlreadyExists("a".into())),
                Outcome::Conflict,
            ),
            (
                ApiError::from(MetadataError::ParentMissing("a".into())),
                Outcome::Conflict,
            ),
            (
                ApiError::from(MetadataError::NotFound("a".into())),
                Outcome::NotFound,
            ),
        ];
        for (err, outcome) in cases {
            assert_eq!(err.outcome(), outcome, "{err}");
        }
    }

    #[test]
    fn test_transient_and_dependency_failures_are_internal() {
        let exhausted = ApiError::from(MetadataError::RetriesExhausted {
            operation: "insert file",
            attempts: 3,
        });
        assert_eq!(exhausted.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(exhausted.code(), "retries_exhausted");
        assert!(!exhausted.public_message().contains("insert file"));

        let db = ApiError::from(MetadataError::Internal("password=hunter2".into()));
        assert_eq!(db.public_message(), "internal error");

        let timeout = ApiError::from(StorageError::Timeout("presign".into()));
        assert_eq!(timeout.outcome(), Outcome::Internal);
    }

    #[test]
    fn test_validation_failures() {
        let too_large = ApiError::from(cabinet_core::Error::FileTooLarge { size: 9, max: 1 });
        assert_eq!(too_large.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let bad_path = ApiError::from(cabinet_core::Error::InvalidPath("/abs".into()));
        assert_eq!(bad_path.outcome(), Outcome::BadRequest);
        assert!(bad_path.public_message().contains("/abs"));

        let parts = ApiError::from(StorageError::PartCountMismatch {
            expected: 9,
            actual: 3,
        });
        assert_eq!(parts.outcome(), Outcome::BadRequest);
    }

    #[test]
    fn test_response_status() {
        let response = ApiError::Unauthorized("sign in".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
