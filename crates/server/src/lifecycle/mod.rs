//! Resource lifecycle operations.
//!
//! Operations that touch the blob store run in three phases:
//!
//! 1. A read-only snapshot gathers the committed facts the blob call needs.
//! 2. The blob call runs outside any transaction. It cannot be rolled back.
//! 3. The relational write runs through the retry executor.
//!
//! When phase 3 fails after phase 2 succeeded, the two stores disagree. Those
//! windows are reported through [`Orphan::report`] and reconciled later by
//! the sweep.

pub mod accounts;
pub mod repositories;
pub mod resources;
pub mod uploads;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use cabinet_core::{RepositoryId, UserId};
use cabinet_metadata::models::ResourceRow;
use cabinet_metadata::{Access, MetadataError, MetadataResult};
use std::future::Future;

/// Run a snapshot read bounded by the metadata timeout.
///
/// A timeout here happens before any side effect, so the operation simply
/// fails.
pub(crate) async fn snapshot<T>(
    state: &AppState,
    what: &'static str,
    read: impl Future<Output = MetadataResult<T>>,
) -> ApiResult<T> {
    let limit = state.config.engine.metadata_timeout();
    let result = tokio::time::timeout(limit, read).await.map_err(|_| {
        MetadataError::Timeout(format!("{what} after {}ms", limit.as_millis()))
    })?;
    Ok(result?)
}

/// Reads need visibility, membership or ownership. Anonymous callers are
/// told to authenticate rather than that they lack access.
pub(crate) fn require_read(access: &Access) -> ApiResult<()> {
    if access.can_read() {
        Ok(())
    } else if access.actor.is_none() {
        Err(ApiError::Unauthorized(format!(
            "repository {} is private",
            access.repository_id
        )))
    } else {
        Err(ApiError::Forbidden(format!(
            "no access to repository {}",
            access.repository_id
        )))
    }
}

/// Blob state that no longer matches any metadata.
#[derive(Debug, Clone)]
pub(crate) struct Orphan {
    pub repository_id: RepositoryId,
    pub user_id: UserId,
    pub path: String,
    pub key: String,
    pub upload_handle: Option<String>,
}

impl Orphan {
    pub fn from_row(row: &ResourceRow) -> Self {
        Self {
            repository_id: row.repository(),
            user_id: row.owner(),
            path: row.path.clone(),
            key: row.blob_key(),
            upload_handle: row.upload_handle.clone(),
        }
    }

    /// Log the window with everything the sweep or an operator needs.
    pub fn report(&self, operation: &'static str, error: &dyn std::fmt::Display) {
        tracing::error!(
            operation,
            repository_id = %self.repository_id,
            user_id = %self.user_id,
            path = %self.path,
            key = %self.key,
            upload_handle = self.upload_handle.as_deref().unwrap_or(""),
            error = %error,
            "blob store changed but metadata write did not follow; left for the sweep"
        );
        metrics::record_inconsistency(operation);
    }
}
