//! Test doubles for blob store behavior the real backends can't produce on demand.

use async_trait::async_trait;
use cabinet_storage::{
    BlobStore, CompletedPart, MemoryBackend, MultipartCursor, MultipartEntry, ObjectEntry, Page,
    StorageResult,
};
use std::time::Duration;

/// Delays every call before delegating to an in-memory store.
#[allow(dead_code)]
pub struct SlowBackend {
    pub inner: MemoryBackend,
    pub delay: Duration,
}

#[allow(dead_code)]
impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::new(),
            delay,
        }
    }
}

#[async_trait]
impl BlobStore for SlowBackend {
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_multipart(key).await
    }

    async fn presign_upload_part(
        &self,
        key: &str,
        upload_handle: &str,
        part_number: u32,
        content_length: u64,
        expires_in: Duration,
    ) -> StorageResult<String> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .presign_upload_part(key, upload_handle, part_number, content_length, expires_in)
            .await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_handle: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.complete_multipart(key, upload_handle, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_handle: &str) -> StorageResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.abort_multipart(key, upload_handle).await
    }

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete_objects(keys).await
    }

    async fn list_objects(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> StorageResult<Page<ObjectEntry>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_objects(prefix, cursor, limit).await
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        cursor: Option<MultipartCursor>,
        limit: usize,
    ) -> StorageResult<Page<MultipartEntry, MultipartCursor>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_multipart_uploads(prefix, cursor, limit).await
    }

    async fn presign_get(
        &self,
        key: &str,
        content_disposition: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .presign_get(key, content_disposition, expires_in)
            .await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.exists(key).await
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}
