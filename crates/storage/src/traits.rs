//! Blob store capability trait.

use crate::error::StorageResult;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use time::OffsetDateTime;

/// Page size used for listing and batched deletes.
///
/// S3 caps `ListObjectsV2`, `ListMultipartUploads` and `DeleteObjects` at
/// 1000 entries per call.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// One acknowledged part, as handed to [`BlobStore::complete_multipart`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// The tag the store returned when the part was written (an ETag on S3).
    pub integrity_token: String,
}

/// A finalized object.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub key: String,
    pub last_modified: Option<OffsetDateTime>,
}

/// An in-progress multipart upload.
#[derive(Clone, Debug)]
pub struct MultipartEntry {
    pub key: String,
    pub upload_handle: String,
    pub initiated: Option<OffsetDateTime>,
}

/// Resume position for multipart listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartCursor {
    pub key_marker: String,
    pub upload_id_marker: String,
}

/// A single page of listing results.
///
/// `next` is `None` on the last page.
#[derive(Clone, Debug)]
pub struct Page<T, C = String> {
    pub items: Vec<T>,
    pub next: Option<C>,
}

impl<T, C> Page<T, C> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Blob store abstraction: finalized objects plus multipart uploads.
///
/// Keys are relative to the backend's configured root or prefix.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Open a multipart upload and return its handle.
    async fn create_multipart(&self, key: &str) -> StorageResult<String>;

    /// Issue a time-limited write target for one part.
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_handle: &str,
        part_number: u32,
        content_length: u64,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// Finalize a multipart upload from its ordered parts.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_handle: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    /// Discard an incomplete multipart upload.
    ///
    /// Returns [`StorageError::UploadNotFound`](crate::StorageError::UploadNotFound)
    /// if the upload no longer exists.
    async fn abort_multipart(&self, key: &str, upload_handle: &str) -> StorageResult<()>;

    /// Delete up to [`DEFAULT_PAGE_SIZE`] finalized objects. Missing keys are ignored.
    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()>;

    /// List finalized objects under `prefix`.
    async fn list_objects(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> StorageResult<Page<ObjectEntry>>;

    /// List in-progress multipart uploads under `prefix`.
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        cursor: Option<MultipartCursor>,
        limit: usize,
    ) -> StorageResult<Page<MultipartEntry, MultipartCursor>>;

    /// Issue a time-limited read URL for a finalized object.
    async fn presign_get(
        &self,
        key: &str,
        content_disposition: &str,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// Check if a finalized object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Static identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// A boxed stream of listing pages.
pub type PageStream<'a, T> = Pin<Box<dyn Stream<Item = StorageResult<Vec<T>>> + Send + 'a>>;

/// Extension trait that walks listings page by page until the store reports
/// no more results.
///
/// Automatically implemented for every [`BlobStore`].
pub trait BlobStoreListExt: BlobStore {
    /// Stream every finalized object under `prefix`, one page at a time.
    fn object_pages<'a>(&'a self, prefix: &str, page_size: usize) -> PageStream<'a, ObjectEntry> {
        let prefix = prefix.to_string();
        Box::pin(async_stream::try_stream! {
            let mut cursor = None;
            loop {
                let page = self.list_objects(&prefix, cursor.take(), page_size).await?;
                if !page.items.is_empty() {
                    yield page.items;
                }
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        })
    }

    /// Stream every in-progress multipart upload under `prefix`, one page at a time.
    fn multipart_pages<'a>(
        &'a self,
        prefix: &str,
        page_size: usize,
    ) -> PageStream<'a, MultipartEntry> {
        let prefix = prefix.to_string();
        Box::pin(async_stream::try_stream! {
            let mut cursor = None;
            loop {
                let page = self
                    .list_multipart_uploads(&prefix, cursor.take(), page_size)
                    .await?;
                if !page.items.is_empty() {
                    yield page.items;
                }
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        })
    }
}

impl<T: BlobStore + ?Sized> BlobStoreListExt for T {}
