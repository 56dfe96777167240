//! Local filesystem blob store.
//!
//! Multipart uploads are staged under `uploads/<handle>/` with one file per
//! part; completion concatenates the parts into `objects/<key>`. Write targets
//! are `file://` URLs pointing at the part's staging file.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BlobStore, CompletedPart, MultipartCursor, MultipartEntry, ObjectEntry, Page,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

const OBJECTS_DIR: &str = "objects";
const UPLOADS_DIR: &str = "uploads";
/// Staged upload metadata: the object key the upload targets.
const UPLOAD_KEY_FILE: &str = "key";

/// Integrity token the filesystem backend expects for a part's bytes.
pub fn integrity_token(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Local filesystem blob store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(OBJECTS_DIR)).await?;
        fs::create_dir_all(root.join(UPLOADS_DIR)).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to its object path, rejecting anything that could
    /// escape the objects directory.
    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(OBJECTS_DIR).join(key))
    }

    fn upload_dir(&self, upload_handle: &str) -> StorageResult<PathBuf> {
        let handle = Uuid::parse_str(upload_handle)
            .map_err(|_| StorageError::UploadNotFound(upload_handle.to_string()))?;
        Ok(self
            .root
            .join(UPLOADS_DIR)
            .join(handle.simple().to_string()))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part-{part_number:05}"))
    }

    /// Open a staged upload, checking it targets `key`.
    async fn staged_upload(&self, key: &str, upload_handle: &str) -> StorageResult<PathBuf> {
        let dir = self.upload_dir(upload_handle)?;
        let staged_key = match fs::read_to_string(dir.join(UPLOAD_KEY_FILE)).await {
            Ok(k) => k,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::UploadNotFound(upload_handle.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        if staged_key != key {
            return Err(StorageError::UploadNotFound(format!(
                "{upload_handle} does not target {key}"
            )));
        }
        Ok(dir)
    }

    /// All finalized keys under `prefix`, sorted.
    async fn object_keys(&self, prefix: &str) -> StorageResult<Vec<(String, PathBuf)>> {
        let objects_root = self.root.join(OBJECTS_DIR);
        // Walk from the deepest directory named by the prefix
        let start = match prefix.rfind('/') {
            Some(idx) => {
                let dir = &prefix[..idx];
                validate_key(dir)?;
                objects_root.join(dir)
            }
            None => objects_root.clone(),
        };

        let mut keys = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() doesn't follow symlinks, so links are skipped
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(&objects_root)
                {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) && !is_temp_name(&key) {
                        keys.push((key, path));
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove now-empty directories between `path` and the objects root.
    async fn prune_empty_dirs(&self, path: &Path) {
        let objects_root = self.root.join(OBJECTS_DIR);
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == objects_root || !dir.starts_with(&objects_root) {
                break;
            }
            // Fails on non-empty dirs, which ends the walk
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!("invalid object key: {key:?}")));
    }
    for component in Path::new(key).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }
    }
    Ok(())
}

fn is_temp_name(key: &str) -> bool {
    key.rsplit('/').next().is_some_and(|name| name.contains(".tmp."))
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Concatenate staged parts into `target`, checking each integrity token.
async fn assemble_parts(dir: &Path, parts: &[CompletedPart], target: &Path) -> StorageResult<()> {
    let mut file = fs::File::create(target).await?;
    for part in parts {
        let data = match fs::read(FilesystemBackend::part_path(dir, part.part_number)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::InvalidPart(format!(
                    "part {} was never written",
                    part.part_number
                )));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        if integrity_token(&data) != part.integrity_token {
            return Err(StorageError::InvalidPart(format!(
                "part {} integrity token mismatch",
                part.part_number
            )));
        }
        file.write_all(&data).await?;
    }
    // Ensure data is flushed to disk before rename
    file.sync_all().await?;
    Ok(())
}

async fn modified_at(path: &Path) -> Option<OffsetDateTime> {
    fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .map(OffsetDateTime::from)
}

#[async_trait]
impl BlobStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        let handle = Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&handle)?;
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(UPLOAD_KEY_FILE), key.as_bytes()).await?;
        Ok(handle)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_handle: &str,
        part_number: u32,
        _content_length: u64,
        _expires_in: Duration,
    ) -> StorageResult<String> {
        if part_number == 0 {
            return Err(StorageError::InvalidPart("part numbers start at 1".to_string()));
        }
        let dir = self.staged_upload(key, upload_handle).await?;
        Ok(file_url(&Self::part_path(&dir, part_number)))
    }

    #[instrument(skip(self, parts), fields(backend = "filesystem", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_handle: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let dir = self.staged_upload(key, upload_handle).await?;
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Assemble into a temp file, fsync, then rename for atomicity
        let temp_path = path.with_file_name(format!(
            "{}.tmp.{}",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            Uuid::new_v4().simple()
        ));
        let assembled = assemble_parts(&dir, parts, &temp_path).await;

        if let Err(e) = assembled {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        fs::rename(&temp_path, &path).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort_multipart(&self, key: &str, upload_handle: &str) -> StorageResult<()> {
        let dir = self.staged_upload(key, upload_handle).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(backend = "filesystem", count = keys.len()))]
    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            let path = self.object_path(key)?;
            match fs::remove_file(&path).await {
                Ok(()) => self.prune_empty_dirs(&path).await,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self, cursor), fields(backend = "filesystem"))]
    async fn list_objects(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> StorageResult<Page<ObjectEntry>> {
        let keys = self.object_keys(prefix).await?;
        let mut remaining = keys
            .into_iter()
            .filter(|(key, _)| cursor.as_ref().is_none_or(|after| key > after))
            .peekable();

        let mut items = Vec::new();
        while items.len() < limit.max(1) {
            let Some((key, path)) = remaining.next() else {
                break;
            };
            items.push(ObjectEntry {
                key,
                last_modified: modified_at(&path).await,
            });
        }

        let next = match remaining.peek() {
            Some(_) => items.last().map(|e: &ObjectEntry| e.key.clone()),
            None => None,
        };
        Ok(Page { items, next })
    }

    #[instrument(skip(self, cursor), fields(backend = "filesystem"))]
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        cursor: Option<MultipartCursor>,
        limit: usize,
    ) -> StorageResult<Page<MultipartEntry, MultipartCursor>> {
        let mut uploads = Vec::new();
        let mut entries = fs::read_dir(self.root.join(UPLOADS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let key_file = entry.path().join(UPLOAD_KEY_FILE);
            let key = match fs::read_to_string(&key_file).await {
                Ok(key) => key,
                // Raced with complete/abort
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            if key.starts_with(prefix) {
                uploads.push(MultipartEntry {
                    key,
                    upload_handle: entry.file_name().to_string_lossy().to_string(),
                    initiated: modified_at(&key_file).await,
                });
            }
        }
        uploads.sort_by(|a, b| (&a.key, &a.upload_handle).cmp(&(&b.key, &b.upload_handle)));

        let mut remaining = uploads
            .into_iter()
            .filter(|u| {
                cursor.as_ref().is_none_or(|c| {
                    (&u.key, &u.upload_handle) > (&c.key_marker, &c.upload_id_marker)
                })
            })
            .peekable();

        let items: Vec<MultipartEntry> = remaining.by_ref().take(limit.max(1)).collect();
        let next = match (remaining.peek(), items.last()) {
            (Some(_), Some(last)) => Some(MultipartCursor {
                key_marker: last.key.clone(),
                upload_id_marker: last.upload_handle.clone(),
            }),
            _ => None,
        };
        Ok(Page { items, next })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn presign_get(
        &self,
        key: &str,
        _content_disposition: &str,
        _expires_in: Duration,
    ) -> StorageResult<String> {
        let path = self.object_path(key)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(file_url(&path))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.object_path(key)?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn health_check(&self) -> StorageResult<()> {
        fs::metadata(self.root.join(OBJECTS_DIR)).await?;
        Ok(())
    }
}
