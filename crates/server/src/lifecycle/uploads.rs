//! Multipart upload lifecycle: start, acknowledge, resume, complete, abort.

use super::{Orphan, require_read, snapshot};
use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use cabinet_core::{Partition, RepositoryId, ResourceId, ResourceKind, UserId, blob_key, path};
use cabinet_metadata::Admission;
use cabinet_metadata::models::{PartRow, ResourceRow};
use cabinet_metadata::repos::ResourceSnapshot;
use cabinet_storage::{CompletedPart, PartTarget};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::instrument;

/// What a client needs to upload the parts of a new file.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub file_id: ResourceId,
    pub upload_handle: String,
    pub partition: Partition,
    pub part_targets: Vec<PartTarget>,
}

/// The uploader's in-progress file, with its handle.
struct PendingUpload {
    file: ResourceRow,
    handle: String,
    parts: Vec<PartRow>,
}

/// Resolve a snapshot into the actor's own in-progress upload.
fn pending_upload(snap: ResourceSnapshot, actor: UserId) -> ApiResult<PendingUpload> {
    let ResourceSnapshot {
        resource: file,
        parts,
        ..
    } = snap;
    if !file.is_file() {
        return Err(ApiError::NotFound(format!("file {}", file.resource_id)));
    }
    if file.owner() != actor {
        return Err(ApiError::Forbidden(format!(
            "only the uploader may manage the upload of file {}",
            file.resource_id
        )));
    }
    if file.upload_completed_at.is_some() {
        return Err(ApiError::Conflict(format!(
            "upload of file {} is already completed",
            file.resource_id
        )));
    }
    let handle = file.upload_handle.clone().ok_or_else(|| {
        ApiError::Internal(format!(
            "in-progress file {} has no upload handle",
            file.resource_id
        ))
    })?;
    Ok(PendingUpload {
        file,
        handle,
        parts,
    })
}

/// Open an upload for a new file at `raw_path`.
///
/// The gate runs twice: once read-only to reject early without touching the
/// blob store, then again inside the write transaction, where it is
/// authoritative. If that write fails the opened upload is left for the
/// sweep; nothing is aborted here.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn start_upload(
    state: &AppState,
    ctx: &RequestContext,
    repository_id: RepositoryId,
    raw_path: &str,
    size: u64,
) -> ApiResult<UploadTicket> {
    let actor = ctx.require_actor()?;
    let path = path::normalize(raw_path)?;
    Partition::for_size(size)?;
    let declared = i64::try_from(size)
        .map_err(|_| ApiError::BadRequest(format!("size {size} out of range")))?;

    let admission = Admission {
        actor,
        repository_id,
        path: &path,
        kind: ResourceKind::File,
        size: declared,
    };

    snapshot(
        state,
        "check admission",
        state.metadata.check_admission(&admission),
    )
    .await?;
    let resource_id = snapshot(
        state,
        "reserve resource id",
        state.metadata.reserve_resource_id(),
    )
    .await?;
    let key = blob_key(repository_id, resource_id);

    let started = state.coordinator.start(&key, size).await?;
    metrics::UPLOADS_STARTED.inc();

    let metadata = &state.metadata;
    let admission = &admission;
    let handle = started.upload_handle.as_str();
    let inserted = state
        .retry
        .run("insert file", move || async move {
            metadata.insert_file(admission, resource_id, handle).await
        })
        .await;

    let file = match inserted {
        Ok(file) => file,
        Err(err) => {
            Orphan {
                repository_id,
                user_id: actor,
                path: path.clone(),
                key,
                upload_handle: Some(started.upload_handle.clone()),
            }
            .report("start upload", &err);
            return Err(err.into());
        }
    };

    tracing::info!(
        file_id = %file.resource_id,
        path = %file.path,
        parts = started.partition.part_count,
        "upload started"
    );
    Ok(UploadTicket {
        file_id: file.id(),
        upload_handle: started.upload_handle,
        partition: started.partition,
        part_targets: started.targets,
    })
}

/// Record the integrity token the blob store returned for one part.
#[instrument(skip(state, ctx, integrity_token), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn acknowledge_part(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
    part_number: u32,
    integrity_token: &str,
) -> ApiResult<PartRow> {
    let actor = ctx.require_actor()?;
    if integrity_token.is_empty() {
        return Err(ApiError::BadRequest(
            "integrity token must not be empty".to_string(),
        ));
    }

    let metadata = &state.metadata;
    let part = state
        .retry
        .run("record part", move || async move {
            metadata
                .record_part(actor, file_id, part_number, integrity_token)
                .await
        })
        .await?;
    Ok(part)
}

/// Fresh targets for every part not yet acknowledged.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn upload_resume(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
) -> ApiResult<Vec<PartTarget>> {
    let actor = ctx.require_actor()?;
    let snap = snapshot(
        state,
        "upload snapshot",
        state.metadata.resource_snapshot(Some(actor), file_id),
    )
    .await?;
    let pending = pending_upload(snap, actor)?;

    let done: Vec<u32> = pending
        .parts
        .iter()
        .filter_map(|p| u32::try_from(p.part_number).ok())
        .collect();
    let targets = state
        .coordinator
        .resume(
            &pending.file.blob_key(),
            &pending.handle,
            pending.file.byte_size()?,
            &done,
        )
        .await?;

    tracing::debug!(remaining = targets.len(), "resumed upload");
    Ok(targets)
}

/// Finalize the upload in the blob store, then mark the file completed.
///
/// Calling this again after success returns the completed record without
/// touching the blob store.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn complete_upload(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
) -> ApiResult<ResourceRow> {
    let actor = ctx.require_actor()?;
    let snap = snapshot(
        state,
        "upload snapshot",
        state.metadata.resource_snapshot(Some(actor), file_id),
    )
    .await?;

    if snap.resource.is_file()
        && snap.resource.owner() == actor
        && snap.resource.upload_completed_at.is_some()
    {
        return Ok(snap.resource);
    }
    let pending = pending_upload(snap, actor)?;
    if pending.parts.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "no parts acknowledged for file {file_id}"
        )));
    }

    let key = pending.file.blob_key();
    let parts: Vec<CompletedPart> = pending
        .parts
        .iter()
        .map(|p| {
            Ok(CompletedPart {
                part_number: u32::try_from(p.part_number).map_err(|_| {
                    ApiError::Internal(format!("stored part number {}", p.part_number))
                })?,
                integrity_token: p.integrity_token.clone(),
            })
        })
        .collect::<ApiResult<_>>()?;

    if let Err(err) = state
        .coordinator
        .complete(&key, &pending.handle, pending.file.byte_size()?, &parts)
        .await
    {
        // An earlier call may have finalized the object without recording it
        if !(err.is_not_found() && state.blobs().exists(&key).await?) {
            return Err(err.into());
        }
        tracing::warn!(
            key = %key,
            upload_handle = %pending.handle,
            "multipart upload already finalized, recording completion"
        );
    }

    let metadata = &state.metadata;
    let handle = pending.handle.as_str();
    let completed_at = OffsetDateTime::now_utc();
    let completed = state
        .retry
        .run("complete upload", move || async move {
            metadata
                .complete_upload(actor, file_id, handle, completed_at)
                .await
        })
        .await;

    match completed {
        Ok(file) => {
            metrics::UPLOADS_COMPLETED.inc();
            tracing::info!(path = %file.path, size = file.size, "upload completed");
            Ok(file)
        }
        Err(err) => {
            Orphan::from_row(&pending.file).report("complete upload", &err);
            Err(err.into())
        }
    }
}

/// Abort an in-progress upload and remove its record.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn abort_upload(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
) -> ApiResult<()> {
    let actor = ctx.require_actor()?;
    let snap = snapshot(
        state,
        "upload snapshot",
        state.metadata.resource_snapshot(Some(actor), file_id),
    )
    .await?;
    let pending = pending_upload(snap, actor)?;

    state
        .coordinator
        .abort(&pending.file.blob_key(), &pending.handle)
        .await?;
    metrics::BLOB_UPLOADS_ABORTED.inc();

    let metadata = &state.metadata;
    let handle = pending.handle.as_str();
    let removed = state
        .retry
        .run("remove upload", move || async move {
            metadata.remove_upload(Some(actor), file_id, handle).await
        })
        .await;

    match removed {
        Ok(_) => {
            metrics::UPLOADS_ABORTED.inc();
            tracing::info!(path = %pending.file.path, "upload aborted");
            Ok(())
        }
        Err(err) => {
            Orphan::from_row(&pending.file).report("abort upload", &err);
            Err(err.into())
        }
    }
}

/// Acknowledged parts of a file, for anyone who can read the repository.
#[instrument(skip(state, ctx), fields(actor = ?ctx.actor, trace_id = %ctx.trace_id))]
pub async fn list_parts(
    state: &AppState,
    ctx: &RequestContext,
    file_id: ResourceId,
) -> ApiResult<Vec<PartRow>> {
    let snap = snapshot(
        state,
        "upload snapshot",
        state.metadata.resource_snapshot(ctx.actor, file_id),
    )
    .await?;
    require_read(&snap.access)?;
    Ok(snap.parts)
}
