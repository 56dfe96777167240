//! In-memory blob store for tests and local development.
//!
//! Every call is counted per [`BlobOp`], listings are capped at a
//! configurable page size, and failures can be injected per operation.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BlobStore, CompletedPart, DEFAULT_PAGE_SIZE, MultipartCursor, MultipartEntry, ObjectEntry,
    Page,
};
use async_trait::async_trait;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Blob store operations, as counted by [`MemoryBackend`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BlobOp {
    CreateMultipart,
    PresignPart,
    CompleteMultipart,
    AbortMultipart,
    DeleteObjects,
    ListObjects,
    ListMultipartUploads,
    PresignGet,
    Exists,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, OffsetDateTime>,
    /// Keyed by (key, handle) so listings come out in S3 order.
    uploads: BTreeMap<(String, String), OffsetDateTime>,
    calls: HashMap<BlobOp, usize>,
    failures: HashMap<BlobOp, usize>,
    deleted: Vec<String>,
    aborted: Vec<(String, String)>,
}

/// In-memory blob store.
pub struct MemoryBackend {
    state: Mutex<State>,
    page_limit: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_page_limit(DEFAULT_PAGE_SIZE)
    }

    /// Cap every listing and delete batch at `page_limit` entries.
    pub fn with_page_limit(page_limit: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_limit: page_limit.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // No invariant spans a panic here, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and fail it if a failure was injected.
    fn enter(&self, op: BlobOp) -> StorageResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.failures.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StorageError::Io(std::io::Error::other(format!(
                "injected {op:?} failure"
            ))));
        }
        Ok(state)
    }

    /// Number of calls made for `op`.
    pub fn calls(&self, op: BlobOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of calls made across all operations.
    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: BlobOp, times: usize) {
        self.state().failures.insert(op, times);
    }

    /// Finalized object keys, sorted.
    pub fn object_keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// In-progress uploads as (key, handle), sorted.
    pub fn open_uploads(&self) -> Vec<(String, String)> {
        self.state().uploads.keys().cloned().collect()
    }

    /// Keys removed through [`BlobStore::delete_objects`], in call order.
    pub fn deleted_keys(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Uploads discarded through [`BlobStore::abort_multipart`], in call order.
    pub fn aborted_uploads(&self) -> Vec<(String, String)> {
        self.state().aborted.clone()
    }

    /// Seed a finalized object.
    pub fn insert_object(&self, key: &str, last_modified: OffsetDateTime) {
        self.state().objects.insert(key.to_string(), last_modified);
    }

    /// Seed an in-progress upload.
    pub fn insert_upload(&self, key: &str, upload_handle: &str, initiated: OffsetDateTime) {
        self.state()
            .uploads
            .insert((key.to_string(), upload_handle.to_string()), initiated);
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let mut state = self.enter(BlobOp::CreateMultipart)?;
        let handle = Uuid::new_v4().simple().to_string();
        state
            .uploads
            .insert((key.to_string(), handle.clone()), OffsetDateTime::now_utc());
        Ok(handle)
    }

    async fn presign_upload_part(
        &self,
        key: &str,
        upload_handle: &str,
        part_number: u32,
        content_length: u64,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let state = self.enter(BlobOp::PresignPart)?;
        if !state
            .uploads
            .contains_key(&(key.to_string(), upload_handle.to_string()))
        {
            return Err(StorageError::UploadNotFound(upload_handle.to_string()));
        }
        Ok(format!(
            "memory://{key}?uploadId={upload_handle}&partNumber={part_number}&length={content_length}&expires={}",
            expires_in.as_secs()
        ))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_handle: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let mut state = self.enter(BlobOp::CompleteMultipart)?;
        if parts.is_empty() {
            return Err(StorageError::InvalidPart("no parts".to_string()));
        }
        if state
            .uploads
            .remove(&(key.to_string(), upload_handle.to_string()))
            .is_none()
        {
            return Err(StorageError::UploadNotFound(upload_handle.to_string()));
        }
        state
            .objects
            .insert(key.to_string(), OffsetDateTime::now_utc());
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_handle: &str) -> StorageResult<()> {
        let mut state = self.enter(BlobOp::AbortMultipart)?;
        let id = (key.to_string(), upload_handle.to_string());
        if state.uploads.remove(&id).is_none() {
            return Err(StorageError::UploadNotFound(upload_handle.to_string()));
        }
        state.aborted.push(id);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        let mut state = self.enter(BlobOp::DeleteObjects)?;
        if keys.len() > self.page_limit {
            return Err(StorageError::InvalidKey(format!(
                "{} keys exceeds batch limit {}",
                keys.len(),
                self.page_limit
            )));
        }
        for key in keys {
            if state.objects.remove(key).is_some() {
                state.deleted.push(key.clone());
            }
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> StorageResult<Page<ObjectEntry>> {
        let state = self.enter(BlobOp::ListObjects)?;
        let limit = limit.clamp(1, self.page_limit);
        let mut matching = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| cursor.as_ref().is_none_or(|after| *key > after))
            .map(|(key, modified)| ObjectEntry {
                key: key.clone(),
                last_modified: Some(*modified),
            });

        let items: Vec<ObjectEntry> = matching.by_ref().take(limit).collect();
        let next = match matching.next() {
            Some(_) => items.last().map(|e| e.key.clone()),
            None => None,
        };
        Ok(Page { items, next })
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        cursor: Option<MultipartCursor>,
        limit: usize,
    ) -> StorageResult<Page<MultipartEntry, MultipartCursor>> {
        let state = self.enter(BlobOp::ListMultipartUploads)?;
        let limit = limit.clamp(1, self.page_limit);
        let mut matching = state
            .uploads
            .iter()
            .filter(|((key, _), _)| key.starts_with(prefix))
            .filter(|((key, handle), _)| {
                cursor.as_ref().is_none_or(|c| {
                    (key, handle) > (&c.key_marker, &c.upload_id_marker)
                })
            })
            .map(|((key, handle), initiated)| MultipartEntry {
                key: key.clone(),
                upload_handle: handle.clone(),
                initiated: Some(*initiated),
            });

        let items: Vec<MultipartEntry> = matching.by_ref().take(limit).collect();
        let next = match (matching.next(), items.last()) {
            (Some(_), Some(last)) => Some(MultipartCursor {
                key_marker: last.key.clone(),
                upload_id_marker: last.upload_handle.clone(),
            }),
            _ => None,
        };
        Ok(Page { items, next })
    }

    async fn presign_get(
        &self,
        key: &str,
        content_disposition: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let state = self.enter(BlobOp::PresignGet)?;
        if !state.objects.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!(
            "memory://{key}?response-content-disposition={}&expires={}",
            utf8_percent_encode(content_disposition, NON_ALPHANUMERIC),
            expires_in.as_secs()
        ))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let state = self.enter(BlobOp::Exists)?;
        Ok(state.objects.contains_key(key))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next(BlobOp::CreateMultipart, 1);

        assert!(backend.create_multipart("1/1").await.is_err());
        let handle = backend.create_multipart("1/1").await.unwrap();

        assert_eq!(backend.calls(BlobOp::CreateMultipart), 2);
        assert_eq!(
            backend.open_uploads(),
            vec![("1/1".to_string(), handle.clone())]
        );
    }

    #[tokio::test]
    async fn test_listing_is_capped_at_page_limit() {
        let backend = MemoryBackend::with_page_limit(2);
        let now = OffsetDateTime::now_utc();
        for i in 0..5 {
            backend.insert_object(&format!("3/{i}"), now);
        }

        let page = backend.list_objects("3/", None, 1000).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next.as_deref(), Some("3/1"));

        let err = backend
            .delete_objects(&["3/0".into(), "3/1".into(), "3/2".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
