//! User provisioning, quota and account deletion.
//!
//! Provisioning is trusted input: whoever calls [`create_user`] and
//! [`set_space_quota`] has already been authorized upstream.

use super::resources::report_unreconciled;
use super::{Orphan, snapshot};
use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use cabinet_core::path::MAX_SEGMENT_BYTES;
use cabinet_core::{Role, UserId, repository_prefix};
use cabinet_metadata::DeleteSet;
use cabinet_metadata::models::UserRow;
use cabinet_storage::DeleteStats;
use tracing::instrument;

/// Provision a user. The quota defaults to the engine's default.
#[instrument(skip(state))]
pub async fn create_user(
    state: &AppState,
    username: &str,
    role: Role,
    space_quota: Option<i64>,
) -> ApiResult<UserRow> {
    let username = username.trim();
    if username.is_empty() || username.len() > MAX_SEGMENT_BYTES {
        return Err(ApiError::BadRequest(format!(
            "username must be 1 to {MAX_SEGMENT_BYTES} bytes"
        )));
    }
    let space_quota = space_quota.unwrap_or(state.config.engine.default_space_quota);
    if space_quota < 0 {
        return Err(ApiError::BadRequest("space quota must not be negative".to_string()));
    }

    let metadata = &state.metadata;
    let user = state
        .retry
        .run("create user", move || async move {
            metadata.create_user(username, role, space_quota).await
        })
        .await?;
    tracing::info!(user_id = %user.user_id, "user created");
    Ok(user)
}

#[instrument(skip(state))]
pub async fn set_space_quota(state: &AppState, user_id: UserId, space_quota: i64) -> ApiResult<()> {
    if space_quota < 0 {
        return Err(ApiError::BadRequest("space quota must not be negative".to_string()));
    }
    let metadata = &state.metadata;
    state
        .retry
        .run("set space quota", move || async move {
            metadata.set_space_quota(user_id, space_quota).await
        })
        .await?;
    Ok(())
}

/// Bytes the user's files occupy, summed live. Only the user may ask.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn consumed_space(
    state: &AppState,
    ctx: &RequestContext,
    user_id: UserId,
) -> ApiResult<i64> {
    if ctx.require_actor()? != user_id {
        return Err(ApiError::Forbidden(format!(
            "usage of user {user_id} is private"
        )));
    }
    snapshot(
        state,
        "consumed space",
        state.metadata.consumed_space(user_id),
    )
    .await
}

/// Delete the caller's own account and everything it owns.
///
/// Owned repositories go through a prefix delete. Files uploaded to other
/// users' repositories are reconciled one by one; folders there are handed
/// to the repository owners.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn delete_account(
    state: &AppState,
    ctx: &RequestContext,
    user_id: UserId,
) -> ApiResult<DeleteStats> {
    if ctx.require_actor()? != user_id {
        return Err(ApiError::Forbidden(
            "an account can only be deleted by its user".to_string(),
        ));
    }
    let snap = snapshot(
        state,
        "account snapshot",
        state.metadata.account_snapshot(user_id),
    )
    .await?;

    let mut stats = DeleteStats::default();
    for repository in &snap.owned_repositories {
        stats += state
            .coordinator
            .delete_all(&repository_prefix(repository.id()))
            .await?;
    }
    let foreign = DeleteSet::partition(snap.foreign_files);
    stats += state
        .coordinator
        .delete_set(foreign.uploaded_keys(), foreign.pending_uploads())
        .await?;
    metrics::record_blob_cleanup(&stats);

    let metadata = &state.metadata;
    let removed = state
        .retry
        .run("delete account", move || async move {
            metadata.delete_account(user_id).await
        })
        .await;

    match removed {
        Ok(removal) => {
            report_unreconciled("delete account", &foreign, &removal.foreign_files);
            tracing::info!(
                repositories = snap.owned_repositories.len(),
                foreign_files = removal.foreign_files.len(),
                reassigned_folders = removal.reassigned_folders,
                "account deleted"
            );
            Ok(stats)
        }
        Err(err) => {
            for repository in &snap.owned_repositories {
                Orphan {
                    repository_id: repository.id(),
                    user_id,
                    path: String::new(),
                    key: repository_prefix(repository.id()),
                    upload_handle: None,
                }
                .report("delete account", &err);
            }
            for row in foreign.uploaded.iter().chain(&foreign.in_progress) {
                Orphan::from_row(row).report("delete account", &err);
            }
            Err(err.into())
        }
    }
}
