//! Blob upload coordinator.
//!
//! Drives the multipart lifecycle against a [`BlobStore`] using the
//! size-derived [`Partition`]. Nothing here touches the metadata store.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BlobStore, CompletedPart, DEFAULT_PAGE_SIZE};
use cabinet_core::Partition;
use cabinet_core::config::EngineConfig;
use futures::{StreamExt, TryStreamExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Concurrent aborts issued while reconciling a prefix or delete set.
const ABORT_CONCURRENCY: usize = 16;

/// RFC 5987 `attr-char`: everything else in `filename*` is percent-encoded.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// A time-limited write target for one part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartTarget {
    pub part_number: u32,
    pub length: u64,
    pub url: String,
}

/// Result of opening a multipart upload.
#[derive(Clone, Debug)]
pub struct StartedUpload {
    pub upload_handle: String,
    pub partition: Partition,
    pub targets: Vec<PartTarget>,
}

/// Counts of blob side effects performed by a bulk delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeleteStats {
    pub objects_deleted: u64,
    pub uploads_aborted: u64,
}

impl std::ops::AddAssign for DeleteStats {
    fn add_assign(&mut self, rhs: Self) {
        self.objects_deleted += rhs.objects_deleted;
        self.uploads_aborted += rhs.uploads_aborted;
    }
}

/// `Content-Disposition` for a download of a file named `file_name`.
///
/// The plain `filename` is a fixed ASCII fallback; the real name travels in
/// the RFC 5987 `filename*` parameter.
pub fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"download\"; filename*=UTF-8''{}",
        utf8_percent_encode(file_name, ATTR_CHAR)
    )
}

/// Check that `parts` is exactly parts `1..=partition.part_count` and return
/// them in ascending order.
pub fn validate_parts(
    partition: &Partition,
    parts: &[CompletedPart],
) -> StorageResult<Vec<CompletedPart>> {
    if parts.len() != partition.part_count as usize {
        return Err(StorageError::PartCountMismatch {
            expected: partition.part_count,
            actual: parts.len(),
        });
    }

    let mut sorted = parts.to_vec();
    sorted.sort_by_key(|p| p.part_number);
    for (expected, part) in (1..=partition.part_count).zip(&sorted) {
        if part.part_number != expected {
            return Err(StorageError::InvalidPart(format!(
                "expected part {expected}, found part {}",
                part.part_number
            )));
        }
        if part.integrity_token.is_empty() {
            return Err(StorageError::InvalidPart(format!(
                "part {expected} has an empty integrity token"
            )));
        }
    }
    Ok(sorted)
}

/// Drives multipart uploads and bulk deletes against a blob store.
#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<dyn BlobStore>,
    part_url_expiry: Duration,
    download_url_expiry: Duration,
    call_timeout: Duration,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn BlobStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            part_url_expiry: config.part_url_expiry(),
            download_url_expiry: config.download_url_expiry(),
            call_timeout: config.blob_timeout(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Bound a single blob store call.
    async fn bounded<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| {
                StorageError::Timeout(format!("{what} after {}ms", self.call_timeout.as_millis()))
            })?
    }

    async fn targets(
        &self,
        key: &str,
        upload_handle: &str,
        partition: &Partition,
        skip: &HashSet<u32>,
    ) -> StorageResult<Vec<PartTarget>> {
        let mut targets = Vec::new();
        for (part_number, length) in partition.parts() {
            if skip.contains(&part_number) {
                continue;
            }
            let url = self
                .bounded(
                    "presign part",
                    self.store.presign_upload_part(
                        key,
                        upload_handle,
                        part_number,
                        length,
                        self.part_url_expiry,
                    ),
                )
                .await?;
            targets.push(PartTarget {
                part_number,
                length,
                url,
            });
        }
        Ok(targets)
    }

    /// Open a multipart upload for `size` bytes and issue one target per part.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn start(&self, key: &str, size: u64) -> StorageResult<StartedUpload> {
        let partition = Partition::for_size(size)?;
        let upload_handle = self
            .bounded("create multipart", self.store.create_multipart(key))
            .await?;

        match self
            .targets(key, &upload_handle, &partition, &HashSet::new())
            .await
        {
            Ok(targets) => Ok(StartedUpload {
                upload_handle,
                partition,
                targets,
            }),
            Err(err) => {
                // No metadata refers to this upload yet, so it can be dropped here
                if let Err(abort_err) = self.abort(key, &upload_handle).await {
                    tracing::warn!(
                        key,
                        upload_handle,
                        error = %abort_err,
                        "failed to abort upload after presign failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Re-issue targets for the parts not yet in `completed_parts`.
    #[instrument(skip(self, completed_parts), fields(backend = self.store.backend_name()))]
    pub async fn resume(
        &self,
        key: &str,
        upload_handle: &str,
        size: u64,
        completed_parts: &[u32],
    ) -> StorageResult<Vec<PartTarget>> {
        let partition = Partition::for_size(size)?;
        let done: HashSet<u32> = completed_parts.iter().copied().collect();
        self.targets(key, upload_handle, &partition, &done).await
    }

    /// Finalize an upload after checking the parts against the partition.
    ///
    /// Completion is not bounded by the call timeout: stores may take a
    /// while to stitch large objects.
    #[instrument(skip(self, parts), fields(backend = self.store.backend_name(), parts = parts.len()))]
    pub async fn complete(
        &self,
        key: &str,
        upload_handle: &str,
        size: u64,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let partition = Partition::for_size(size)?;
        let ordered = validate_parts(&partition, parts)?;
        self.store
            .complete_multipart(key, upload_handle, &ordered)
            .await
    }

    /// Abort an upload. Returns `false` if the store no longer knew it.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn abort(&self, key: &str, upload_handle: &str) -> StorageResult<bool> {
        match self
            .bounded("abort multipart", self.store.abort_multipart(key, upload_handle))
            .await
        {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => {
                tracing::debug!(key, upload_handle, "upload already gone");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Delete every object and abort every in-progress upload under `prefix`.
    ///
    /// Each round re-lists from the start, so progress never depends on a
    /// cursor that deletes may have invalidated.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn delete_all(&self, prefix: &str) -> StorageResult<DeleteStats> {
        let mut stats = DeleteStats::default();

        loop {
            let page = self
                .bounded(
                    "list objects",
                    self.store.list_objects(prefix, None, DEFAULT_PAGE_SIZE),
                )
                .await?;
            if page.items.is_empty() {
                break;
            }
            let keys: Vec<String> = page.items.into_iter().map(|e| e.key).collect();
            self.bounded("delete objects", self.store.delete_objects(&keys))
                .await?;
            stats.objects_deleted += keys.len() as u64;
        }

        loop {
            let page = self
                .bounded(
                    "list multipart uploads",
                    self.store
                        .list_multipart_uploads(prefix, None, DEFAULT_PAGE_SIZE),
                )
                .await?;
            if page.items.is_empty() {
                break;
            }
            let uploads = page
                .items
                .into_iter()
                .map(|u| (u.key, u.upload_handle))
                .collect();
            stats.uploads_aborted += self.abort_many(uploads).await?;
        }

        tracing::info!(
            prefix,
            objects_deleted = stats.objects_deleted,
            uploads_aborted = stats.uploads_aborted,
            "deleted blob prefix"
        );
        Ok(stats)
    }

    /// Delete the given finalized objects and abort the given uploads.
    #[instrument(skip_all, fields(backend = self.store.backend_name(), objects = keys.len(), uploads = uploads.len()))]
    pub async fn delete_set(
        &self,
        keys: Vec<String>,
        uploads: Vec<(String, String)>,
    ) -> StorageResult<DeleteStats> {
        let deletes = async {
            let mut deleted = 0u64;
            for batch in keys.chunks(DEFAULT_PAGE_SIZE) {
                self.bounded("delete objects", self.store.delete_objects(batch))
                    .await?;
                deleted += batch.len() as u64;
            }
            Ok::<_, StorageError>(deleted)
        };

        let (objects_deleted, uploads_aborted) =
            futures::try_join!(deletes, self.abort_many(uploads))?;
        Ok(DeleteStats {
            objects_deleted,
            uploads_aborted,
        })
    }

    async fn abort_many(&self, uploads: Vec<(String, String)>) -> StorageResult<u64> {
        let aborted: Vec<bool> = futures::stream::iter(uploads)
            .map(|(key, handle)| async move { self.abort(&key, &handle).await })
            .buffer_unordered(ABORT_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(aborted.into_iter().filter(|gone| *gone).count() as u64)
    }

    /// Issue a time-limited download URL that saves as `file_name`.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn download_url(&self, key: &str, file_name: &str) -> StorageResult<String> {
        let disposition = content_disposition(file_name);
        self.bounded(
            "presign get",
            self.store
                .presign_get(key, &disposition, self.download_url_expiry),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32) -> CompletedPart {
        CompletedPart {
            part_number: n,
            integrity_token: format!("etag-{n}"),
        }
    }

    #[test]
    fn test_content_disposition_encodes_name() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"download\"; filename*=UTF-8''report.pdf"
        );
        assert_eq!(
            content_disposition("naïve plan \"v2\".txt"),
            "attachment; filename=\"download\"; filename*=UTF-8''na%C3%AFve%20plan%20%22v2%22.txt"
        );
    }

    #[test]
    fn test_validate_parts_sorts() {
        let partition = Partition::for_size(20_000_000).unwrap();
        assert_eq!(partition.part_count, 4);

        let parts = vec![part(3), part(1), part(4), part(2)];
        let ordered = validate_parts(&partition, &parts).unwrap();
        let numbers: Vec<u32> = ordered.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_validate_parts_rejects_wrong_count() {
        let partition = Partition::for_size(20_000_000).unwrap();
        let err = validate_parts(&partition, &[part(1), part(2)]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::PartCountMismatch {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_validate_parts_rejects_duplicates_and_gaps() {
        let partition = Partition::for_size(20_000_000).unwrap();
        let err = validate_parts(&partition, &[part(1), part(2), part(2), part(4)]).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPart(_)));

        let mut empty = part(1);
        empty.integrity_token.clear();
        let err = validate_parts(&partition, &[empty, part(2), part(3), part(4)]).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPart(_)));
    }
}
