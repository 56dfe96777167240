//! Repositories and their memberships.

use super::resources::report_unreconciled;
use super::{Orphan, require_read, snapshot};
use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use cabinet_core::{MemberId, Permission, RepositoryId, UserId, Visibility, path, repository_prefix};
use cabinet_metadata::DeleteSet;
use cabinet_metadata::models::{MemberRow, RepositoryRow, RepositorySummary};
use cabinet_storage::DeleteStats;
use tracing::instrument;

/// Create a repository owned by the caller.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn create_repository(
    state: &AppState,
    ctx: &RequestContext,
    name: &str,
    visibility: Visibility,
) -> ApiResult<RepositoryRow> {
    let actor = ctx.require_actor()?;
    let name = path::normalize_name(name)?;

    let metadata = &state.metadata;
    let name = name.as_str();
    let repository = state
        .retry
        .run("create repository", move || async move {
            metadata.create_repository(actor, name, visibility).await
        })
        .await?;
    tracing::info!(repository_id = %repository.repository_id, name, "repository created");
    Ok(repository)
}

#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn get_repository(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
) -> ApiResult<RepositoryRow> {
    let access = snapshot(
        state,
        "repository access",
        state.metadata.access(ctx.actor, repository_id),
    )
    .await?;
    require_read(&access)?;
    snapshot(
        state,
        "get repository",
        state.metadata.get_repository(repository_id),
    )
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("repository {repository_id}")))
}

/// Repositories the caller owns or belongs to, with the space their own
/// files take in each.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn list_repositories(
    state: &AppState,
    ctx: &RequestContext,
) -> ApiResult<Vec<RepositorySummary>> {
    let actor = ctx.require_actor()?;
    snapshot(
        state,
        "list repositories",
        state.metadata.list_repositories(actor),
    )
    .await
}

/// Rename the caller's repository.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn rename_repository(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
    new_name: &str,
) -> ApiResult<RepositoryRow> {
    let actor = ctx.require_actor()?;
    let name = path::normalize_name(new_name)?;

    let metadata = &state.metadata;
    let name = name.as_str();
    let repository = state
        .retry
        .run("rename repository", move || async move {
            metadata.rename_repository(actor, repository_id, name).await
        })
        .await?;
    tracing::info!(repository_id = %repository.repository_id, name, "repository renamed");
    Ok(repository)
}

#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn set_visibility(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
    visibility: Visibility,
) -> ApiResult<RepositoryRow> {
    let actor = ctx.require_actor()?;
    let metadata = &state.metadata;
    let repository = state
        .retry
        .run("set visibility", move || async move {
            metadata
                .set_visibility(actor, repository_id, visibility)
                .await
        })
        .await?;
    tracing::info!(
        repository_id = %repository.repository_id,
        visibility = %repository.visibility,
        "repository visibility changed"
    );
    Ok(repository)
}

/// Grant a user access to the caller's repository.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn add_member(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
    user_id: UserId,
    permission: Permission,
) -> ApiResult<MemberRow> {
    let actor = ctx.require_actor()?;
    let metadata = &state.metadata;
    let member = state
        .retry
        .run("add member", move || async move {
            metadata
                .add_member(actor, repository_id, user_id, permission)
                .await
        })
        .await?;
    Ok(member)
}

/// A membership, visible to anyone who can read its repository.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn get_member(
    state: &AppState,
    ctx: &RequestContext,
    member_id: MemberId,
) -> ApiResult<MemberRow> {
    let member = snapshot(state, "get member", state.metadata.get_member(member_id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("member {member_id}")))?;
    let access = snapshot(
        state,
        "repository access",
        state
            .metadata
            .access(ctx.actor, RepositoryId::new(member.repository_id)),
    )
    .await?;
    require_read(&access)?;
    Ok(member)
}

/// Memberships of a repository, visible to anyone who can read it.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn list_members(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
) -> ApiResult<Vec<MemberRow>> {
    let access = snapshot(
        state,
        "repository access",
        state.metadata.access(ctx.actor, repository_id),
    )
    .await?;
    require_read(&access)?;
    snapshot(
        state,
        "list members",
        state.metadata.list_members(repository_id),
    )
    .await
}

/// Delete a repository with every object and upload under its prefix.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn delete_repository(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
) -> ApiResult<DeleteStats> {
    let actor = ctx.require_actor()?;
    snapshot(
        state,
        "repository access",
        state.metadata.access(Some(actor), repository_id),
    )
    .await?
    .require_owner()?;

    let prefix = repository_prefix(repository_id);
    let stats = state.coordinator.delete_all(&prefix).await?;
    metrics::record_blob_cleanup(&stats);

    let metadata = &state.metadata;
    let deleted = state
        .retry
        .run("delete repository", move || async move {
            metadata.delete_repository(actor, repository_id).await
        })
        .await;

    match deleted {
        Ok(repository) => {
            tracing::info!(
                name = %repository.name,
                objects_deleted = stats.objects_deleted,
                uploads_aborted = stats.uploads_aborted,
                "repository deleted"
            );
            Ok(stats)
        }
        Err(err) => {
            Orphan {
                repository_id,
                user_id: actor,
                path: String::new(),
                key: prefix,
                upload_handle: None,
            }
            .report("delete repository", &err);
            Err(err.into())
        }
    }
}

/// Remove a membership with the member's files in that repository.
///
/// The member's folders stay, handed to the repository owner, because other
/// users' files may live below them.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn delete_member(
    state: &AppState,
    ctx: &RequestContext,
    member_id: MemberId,
) -> ApiResult<DeleteStats> {
    let actor = ctx.require_actor()?;
    let snap = snapshot(
        state,
        "member snapshot",
        state.metadata.member_snapshot(actor, member_id),
    )
    .await?;

    let set = DeleteSet::partition(snap.files);
    let stats = state
        .coordinator
        .delete_set(set.uploaded_keys(), set.pending_uploads())
        .await?;
    metrics::record_blob_cleanup(&stats);

    let metadata = &state.metadata;
    let removed = state
        .retry
        .run("delete member", move || async move {
            metadata.delete_member(actor, member_id).await
        })
        .await;

    match removed {
        Ok(removal) => {
            report_unreconciled("delete member", &set, &removal.files);
            tracing::info!(
                repository_id = snap.member.repository_id,
                user_id = snap.member.user_id,
                files = removal.files.len(),
                reassigned_folders = removal.reassigned_folders,
                "member removed"
            );
            Ok(stats)
        }
        Err(err) => {
            for row in set.uploaded.iter().chain(&set.in_progress) {
                Orphan::from_row(row).report("delete member", &err);
            }
            Err(err.into())
        }
    }
}
