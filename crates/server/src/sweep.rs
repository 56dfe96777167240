//! Reconciliation sweep for the windows where the two stores disagree.
//!
//! Three passes, each independent of the others:
//!
//! 1. Stale uploads: records still in progress long after their part URLs
//!    expired. The multipart upload is aborted and the record removed,
//!    unless the object was already finalized.
//! 2. Orphan uploads: multipart uploads whose key names a resource that is
//!    missing, already completed, or holding a different handle.
//! 3. Orphan objects: finalized objects whose key names no resource.
//!
//! A finalized object whose record is still in progress is what a
//! completion that exhausted its retries leaves behind. Both passes 1 and 3
//! record the completion for it instead of discarding the bytes.
//!
//! Passes 2 and 3 only touch blob state older than the grace period, which
//! keeps them clear of operations still between their blob call and their
//! metadata write.

use crate::error::ApiResult;
use crate::metrics;
use crate::state::AppState;
use cabinet_core::config::SweepConfig;
use cabinet_core::{ResourceId, parse_blob_key};
use cabinet_metadata::models::ResourceRow;
use cabinet_storage::traits::DEFAULT_PAGE_SIZE;
use cabinet_storage::{BlobStoreListExt, MultipartEntry, ObjectEntry};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::instrument;

/// What a sweep did, or would have done in dry-run mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub stale_uploads_removed: u64,
    pub orphan_uploads_aborted: u64,
    pub orphan_objects_deleted: u64,
    /// In-progress records whose object was already finalized, now completed.
    pub uploads_recovered: u64,
    /// Blob keys that do not name a resource; never touched.
    pub unparseable_keys: u64,
    pub errors: u64,
    pub dry_run: bool,
}

/// Run all three passes once.
#[instrument(skip_all, fields(dry_run = config.dry_run))]
pub async fn run_sweep(state: &AppState, config: &SweepConfig) -> ApiResult<SweepStats> {
    let now = OffsetDateTime::now_utc();
    let sweeper = Sweeper {
        state,
        config,
        stale_before: now - std::time::Duration::from_secs(config.stale_upload_after_secs),
        orphan_before: now - std::time::Duration::from_secs(config.orphan_grace_secs),
    };
    let mut stats = SweepStats {
        dry_run: config.dry_run,
        ..SweepStats::default()
    };

    if config.dry_run {
        tracing::warn!("dry-run sweep: reporting only, nothing will be removed");
    }

    let result = async {
        sweeper.stale_uploads(&mut stats).await?;
        sweeper.orphan_uploads(&mut stats).await?;
        sweeper.orphan_objects(&mut stats).await
    }
    .await;

    match result {
        Ok(()) => {
            metrics::SWEEP_RUNS.with_label_values(&["ok"]).inc();
            if !config.dry_run {
                metrics::SWEEP_LAST_ABORTED
                    .set((stats.stale_uploads_removed + stats.orphan_uploads_aborted) as i64);
                metrics::SWEEP_LAST_DELETED.set(stats.orphan_objects_deleted as i64);
            }
            tracing::info!(?stats, "sweep finished");
            Ok(stats)
        }
        Err(err) => {
            metrics::SWEEP_RUNS.with_label_values(&["failed"]).inc();
            tracing::error!(error = %err, ?stats, "sweep aborted");
            Err(err)
        }
    }
}

struct Sweeper<'a> {
    state: &'a AppState,
    config: &'a SweepConfig,
    stale_before: OffsetDateTime,
    orphan_before: OffsetDateTime,
}

impl Sweeper<'_> {
    async fn stale_uploads(&self, stats: &mut SweepStats) -> ApiResult<()> {
        let metadata = &self.state.metadata;
        let stale = metadata
            .stale_uploads(self.stale_before, self.config.batch_size)
            .await?;

        for row in stale {
            let Some(handle) = row.upload_handle.as_deref() else {
                tracing::warn!(file_id = row.resource_id, "in-progress file without handle");
                stats.errors += 1;
                continue;
            };
            let key = row.blob_key();
            tracing::info!(
                repository_id = row.repository_id,
                user_id = row.owner_id,
                path = %row.path,
                key = %key,
                upload_handle = handle,
                created_at = %row.created_at,
                "stale upload"
            );
            match self.state.blobs().exists(&key).await {
                Ok(true) => {
                    self.recover_upload(&row, handle, stats).await;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to check stale upload object");
                    stats.errors += 1;
                    continue;
                }
            }
            if self.config.dry_run {
                stats.stale_uploads_removed += 1;
                continue;
            }

            if let Err(e) = self.state.coordinator.abort(&key, handle).await {
                tracing::warn!(key = %key, error = %e, "failed to abort stale upload");
                stats.errors += 1;
                continue;
            }

            let file_id = row.id();
            let removed = self
                .state
                .retry
                .run("remove stale upload", move || async move {
                    metadata.remove_upload(None, file_id, handle).await
                })
                .await;
            match removed {
                Ok(_) => stats.stale_uploads_removed += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to remove stale upload record");
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Mark an in-progress record completed because its object exists.
    async fn recover_upload(&self, row: &ResourceRow, handle: &str, stats: &mut SweepStats) {
        let key = row.blob_key();
        tracing::info!(
            key = %key,
            upload_handle = handle,
            "object finalized for in-progress record, recording completion"
        );
        if self.config.dry_run {
            stats.uploads_recovered += 1;
            return;
        }

        let metadata = &self.state.metadata;
        let owner = row.owner();
        let file_id = row.id();
        let completed_at = OffsetDateTime::now_utc();
        let completed = self
            .state
            .retry
            .run("recover upload", move || async move {
                metadata
                    .complete_upload(owner, file_id, handle, completed_at)
                    .await
            })
            .await;
        match completed {
            Ok(_) => {
                stats.uploads_recovered += 1;
                metrics::UPLOADS_COMPLETED.inc();
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to record recovered upload");
                stats.errors += 1;
            }
        }
    }

    /// Resolve a page of keys to the records they name.
    ///
    /// Keys that do not parse are counted and dropped from the result.
    async fn resolve<'e, E>(
        &self,
        entries: &'e [E],
        key: impl Fn(&E) -> &str,
        stats: &mut SweepStats,
    ) -> ApiResult<(Vec<(&'e E, ResourceId)>, HashMap<i64, ResourceRow>)> {
        let mut named = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_blob_key(key(entry)) {
                Some((_, resource_id)) => named.push((entry, resource_id)),
                None => {
                    tracing::warn!(key = key(entry), "blob key does not name a resource, leaving it");
                    stats.unparseable_keys += 1;
                }
            }
        }

        let ids: Vec<i64> = named.iter().map(|(_, id)| id.get()).collect();
        let rows = self
            .state
            .metadata
            .resources_by_ids(&ids)
            .await?
            .into_iter()
            .map(|r| (r.resource_id, r))
            .collect();
        Ok((named, rows))
    }

    async fn orphan_uploads(&self, stats: &mut SweepStats) -> ApiResult<()> {
        let blobs = self.state.blobs();
        let mut pages = blobs.multipart_pages("", DEFAULT_PAGE_SIZE);

        while let Some(page) = pages.next().await {
            let page: Vec<MultipartEntry> = page?
                .into_iter()
                .filter(|u| u.initiated.is_some_and(|t| t < self.orphan_before))
                .collect();
            let (named, rows) = self.resolve(&page, |u| u.key.as_str(), stats).await?;

            for (upload, resource_id) in named {
                let live = rows.get(&resource_id.get()).is_some_and(|r| {
                    r.upload_completed_at.is_none()
                        && r.upload_handle.as_deref() == Some(upload.upload_handle.as_str())
                        && r.blob_key() == upload.key
                });
                if live {
                    continue;
                }

                tracing::info!(
                    key = %upload.key,
                    upload_handle = %upload.upload_handle,
                    "orphan multipart upload"
                );
                if self.config.dry_run {
                    stats.orphan_uploads_aborted += 1;
                    continue;
                }
                match self
                    .state
                    .coordinator
                    .abort(&upload.key, &upload.upload_handle)
                    .await
                {
                    Ok(_) => {
                        stats.orphan_uploads_aborted += 1;
                        metrics::BLOB_UPLOADS_ABORTED.inc();
                    }
                    Err(e) => {
                        tracing::warn!(key = %upload.key, error = %e, "failed to abort orphan upload");
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn orphan_objects(&self, stats: &mut SweepStats) -> ApiResult<()> {
        let blobs = self.state.blobs();
        let mut pages = blobs.object_pages("", DEFAULT_PAGE_SIZE);

        while let Some(page) = pages.next().await {
            let page: Vec<ObjectEntry> = page?
                .into_iter()
                .filter(|o| o.last_modified.is_some_and(|t| t < self.orphan_before))
                .collect();
            let (named, rows) = self.resolve(&page, |o| o.key.as_str(), stats).await?;

            let mut orphans = Vec::new();
            for (object, resource_id) in named {
                let row = rows
                    .get(&resource_id.get())
                    .filter(|r| r.blob_key() == object.key);
                match row {
                    Some(r) if r.upload_completed_at.is_some() => {}
                    Some(r) => match r.upload_handle.as_deref() {
                        Some(handle) => self.recover_upload(r, handle, stats).await,
                        None => {
                            tracing::warn!(file_id = r.resource_id, "in-progress file without handle");
                            stats.errors += 1;
                        }
                    },
                    None => orphans.push(object.key.clone()),
                }
            }
            if orphans.is_empty() {
                continue;
            }

            for key in &orphans {
                tracing::info!(key = %key, "orphan object");
            }
            if self.config.dry_run {
                stats.orphan_objects_deleted += orphans.len() as u64;
                continue;
            }
            let count = orphans.len() as u64;
            match self.state.coordinator.delete_set(orphans, Vec::new()).await {
                Ok(deleted) => {
                    stats.orphan_objects_deleted += deleted.objects_deleted;
                    metrics::record_blob_cleanup(&deleted);
                }
                Err(e) => {
                    tracing::warn!(objects = count, error = %e, "failed to delete orphan objects");
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }
}
