//! Folders, renames, deletes and reads over the resource hierarchy.

use super::{Orphan, require_read, snapshot};
use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use cabinet_core::{RepositoryId, ResourceId, ResourceKind, path};
use cabinet_metadata::models::ResourceRow;
use cabinet_metadata::{Admission, DeleteSet, PathRewrite};
use cabinet_storage::DeleteStats;
use std::collections::HashMap;
use tracing::instrument;

/// Report write-time rows the snapshot did not cover.
///
/// `deleted` is what the write transaction actually removed. Files that were
/// not in the snapshot, or whose upload state moved since, had no blob
/// reconciliation.
pub(crate) fn report_unreconciled(
    operation: &'static str,
    snapshot: &DeleteSet,
    deleted: &[ResourceRow],
) -> usize {
    let seen: HashMap<i64, bool> = snapshot
        .uploaded
        .iter()
        .map(|r| (r.resource_id, true))
        .chain(snapshot.in_progress.iter().map(|r| (r.resource_id, false)))
        .collect();

    let mut missed = 0;
    for row in deleted.iter().filter(|r| r.is_file()) {
        let completed = row.upload_completed_at.is_some();
        if seen.get(&row.resource_id) != Some(&completed) {
            Orphan::from_row(row).report(operation, &"file changed after the delete snapshot");
            missed += 1;
        }
    }
    missed
}

/// Create a folder. Folders are complete on insert and count against no quota.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn create_folder(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
    raw_path: &str,
) -> ApiResult<ResourceRow> {
    let actor = ctx.require_actor()?;
    let path = path::normalize(raw_path)?;
    let admission = Admission {
        actor,
        repository_id,
        path: &path,
        kind: ResourceKind::Folder,
        size: 0,
    };

    let metadata = &state.metadata;
    let admission = &admission;
    let folder = state
        .retry
        .run("insert folder", move || async move {
            metadata.insert_folder(admission).await
        })
        .await?;
    tracing::info!(folder_id = %folder.resource_id, path = %folder.path, "folder created");
    Ok(folder)
}

async fn rename(
    state: &AppState,
    ctx: &RequestContext,
    resource_id: ResourceId,
    kind: ResourceKind,
    new_name: &str,
) -> ApiResult<Vec<PathRewrite>> {
    let actor = ctx.require_actor()?;
    let name = path::normalize_name(new_name)?;

    let metadata = &state.metadata;
    let name = name.as_str();
    let rewrites = state
        .retry
        .run("rename resource", move || async move {
            metadata
                .rename_resource(actor, resource_id, kind, name)
                .await
        })
        .await?;

    if let Some(own) = rewrites.first() {
        tracing::info!(
            old_path = %own.old_path,
            new_path = %own.new_path,
            rewritten = rewrites.len(),
            "renamed"
        );
    }
    Ok(rewrites)
}

/// Rename a file within its folder. Blob keys do not depend on paths.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn rename_file(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
    new_name: &str,
) -> ApiResult<Vec<PathRewrite>> {
    rename(state, ctx, file_id, ResourceKind::File, new_name).await
}

/// Rename a folder and rewrite the path of everything below it.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn rename_folder(
    state: &AppState,
    ctx: &RequestContext,
    folder_id: ResourceId,
    new_name: &str,
) -> ApiResult<Vec<PathRewrite>> {
    rename(state, ctx, folder_id, ResourceKind::Folder, new_name).await
}

/// Delete one file: its object, or its outstanding upload, then its record.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn delete_file(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
) -> ApiResult<DeleteStats> {
    let actor = ctx.require_actor()?;
    let snap = snapshot(
        state,
        "file snapshot",
        state.metadata.resource_snapshot(Some(actor), file_id),
    )
    .await?;
    if !snap.resource.is_file() {
        return Err(ApiError::NotFound(format!("file {file_id}")));
    }
    snap.access.require_modify()?;

    let set = DeleteSet::partition([snap.resource]);
    let stats = state
        .coordinator
        .delete_set(set.uploaded_keys(), set.pending_uploads())
        .await?;
    metrics::record_blob_cleanup(&stats);

    let metadata = &state.metadata;
    let deleted = state
        .retry
        .run("delete file", move || async move {
            metadata.delete_file(actor, file_id).await
        })
        .await;

    match deleted {
        Ok(row) => {
            report_unreconciled("delete file", &set, std::slice::from_ref(&row));
            tracing::info!(path = %row.path, "file deleted");
            Ok(stats)
        }
        Err(err) => {
            for row in set.uploaded.iter().chain(&set.in_progress) {
                Orphan::from_row(row).report("delete file", &err);
            }
            Err(err.into())
        }
    }
}

/// Delete a folder and everything below it.
///
/// The blob side works from the snapshot. The write deletes by prefix at
/// write time, so files created in between are removed without blob
/// reconciliation and reported.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn delete_folder(
    state: &AppState,
    ctx: &RequestContext,
    folder_id: ResourceId,
) -> ApiResult<DeleteStats> {
    let actor = ctx.require_actor()?;
    let snap = snapshot(
        state,
        "subtree snapshot",
        state.metadata.subtree_snapshot(actor, folder_id),
    )
    .await?;
    snap.access.require_modify()?;

    let set = DeleteSet::for_folder(&snap.records, &snap.folder.path);
    let stats = state
        .coordinator
        .delete_set(set.uploaded_keys(), set.pending_uploads())
        .await?;
    metrics::record_blob_cleanup(&stats);

    let metadata = &state.metadata;
    let deleted = state
        .retry
        .run("delete folder", move || async move {
            metadata.delete_subtree(actor, folder_id).await
        })
        .await;

    match deleted {
        Ok(rows) => {
            let missed = report_unreconciled("delete folder", &set, &rows);
            tracing::info!(
                path = %snap.folder.path,
                records = rows.len(),
                objects_deleted = stats.objects_deleted,
                uploads_aborted = stats.uploads_aborted,
                unreconciled = missed,
                "folder deleted"
            );
            Ok(stats)
        }
        Err(err) => {
            for row in set.uploaded.iter().chain(&set.in_progress) {
                Orphan::from_row(row).report("delete folder", &err);
            }
            Err(err.into())
        }
    }
}

/// Get one resource record.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn get_resource(
    state: &AppState,
    ctx: &RequestContext,
    resource_id: ResourceId,
) -> ApiResult<ResourceRow> {
    let snap = snapshot(
        state,
        "resource snapshot",
        state.metadata.resource_snapshot(ctx.actor, resource_id),
    )
    .await?;
    require_read(&snap.access)?;
    Ok(snap.resource)
}

/// Every record in a repository, ordered by path.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn list_resources(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
) -> ApiResult<Vec<ResourceRow>> {
    let access = snapshot(
        state,
        "repository access",
        state.metadata.access(ctx.actor, repository_id),
    )
    .await?;
    require_read(&access)?;
    snapshot(
        state,
        "list resources",
        state.metadata.list_resources(repository_id),
    )
    .await
}

/// Look a record up by its path within a repository.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn find_resource(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
    raw_path: &str,
) -> ApiResult<ResourceRow> {
    let path = path::normalize(raw_path)?;
    let access = snapshot(
        state,
        "repository access",
        state.metadata.access(ctx.actor, repository_id),
    )
    .await?;
    require_read(&access)?;
    snapshot(
        state,
        "find resource",
        state.metadata.find_resource(repository_id, &path),
    )
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("'{path}' in repository {repository_id}")))
}

/// A time-limited download URL for a completed file.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn get_download(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
) -> ApiResult<String> {
    let snap = snapshot(
        state,
        "file snapshot",
        state.metadata.resource_snapshot(ctx.actor, file_id),
    )
    .await?;
    require_read(&snap.access)?;
    let file = snap.resource;
    if !file.is_file() {
        return Err(ApiError::NotFound(format!("file {file_id}")));
    }
    if file.upload_completed_at.is_none() {
        return Err(ApiError::UploadInProgress(format!("file {file_id}")));
    }

    let url = state
        .coordinator
        .download_url(&file.blob_key(), path::file_name(&file.path))
        .await?;
    Ok(url)
}
