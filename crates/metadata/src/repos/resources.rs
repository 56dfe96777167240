//! File and folder records.

use crate::error::MetadataResult;
use crate::gate::{Access, Admission};
use crate::hierarchy::PathRewrite;
use crate::models::{PartRow, ResourceRow};
use async_trait::async_trait;
use cabinet_core::{RepositoryId, ResourceId, ResourceKind, UserId};
use time::OffsetDateTime;

/// One resource with the actor's access and its acknowledged parts, read in
/// a single snapshot.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub resource: ResourceRow,
    pub access: Access,
    pub parts: Vec<PartRow>,
}

/// A folder with itself and all descendants, read in a single snapshot.
#[derive(Debug, Clone)]
pub struct SubtreeSnapshot {
    pub folder: ResourceRow,
    pub access: Access,
    /// The folder record and every record below it.
    pub records: Vec<ResourceRow>,
}

/// Repository for resource records.
#[async_trait]
pub trait ResourceRepo: Send + Sync {
    /// Run the admission gate in a read-only snapshot without writing.
    async fn check_admission(&self, admission: &Admission<'_>) -> MetadataResult<()>;

    /// Allocate a resource identifier ahead of the insert.
    ///
    /// The identifier names the blob key before any record exists. It is
    /// never handed out twice, whether or not a record is ever inserted.
    async fn reserve_resource_id(&self) -> MetadataResult<ResourceId>;

    /// Run the gate and insert an in-progress file under a reserved
    /// identifier, holding `upload_handle`.
    async fn insert_file(
        &self,
        admission: &Admission<'_>,
        resource_id: ResourceId,
        upload_handle: &str,
    ) -> MetadataResult<ResourceRow>;

    /// Run the gate (without quota) and insert a folder.
    async fn insert_folder(&self, admission: &Admission<'_>) -> MetadataResult<ResourceRow>;

    /// Get a resource by ID.
    async fn get_resource(&self, resource_id: ResourceId) -> MetadataResult<Option<ResourceRow>>;

    /// Get a resource by its path within a repository.
    async fn find_resource(
        &self,
        repository_id: RepositoryId,
        path: &str,
    ) -> MetadataResult<Option<ResourceRow>>;

    /// All resources of a repository ordered by path.
    async fn list_resources(&self, repository_id: RepositoryId)
    -> MetadataResult<Vec<ResourceRow>>;

    /// Snapshot a resource with the actor's access and its parts.
    async fn resource_snapshot(
        &self,
        actor: Option<UserId>,
        resource_id: ResourceId,
    ) -> MetadataResult<ResourceSnapshot>;

    /// Snapshot a folder and every record below it.
    async fn subtree_snapshot(
        &self,
        actor: UserId,
        folder_id: ResourceId,
    ) -> MetadataResult<SubtreeSnapshot>;

    /// Rename a file or folder to `new_name` within its current parent.
    ///
    /// For folders every descendant path is rewritten in the same
    /// transaction. Returns the rewrites applied, the record itself first.
    async fn rename_resource(
        &self,
        actor: UserId,
        resource_id: ResourceId,
        kind: ResourceKind,
        new_name: &str,
    ) -> MetadataResult<Vec<PathRewrite>>;

    /// Mark an upload completed and clear its handle.
    ///
    /// Succeeds without change when the upload is already completed.
    async fn complete_upload(
        &self,
        actor: UserId,
        resource_id: ResourceId,
        upload_handle: &str,
        completed_at: OffsetDateTime,
    ) -> MetadataResult<ResourceRow>;

    /// Remove an in-progress upload record whose handle matches.
    ///
    /// When `actor` is set it must be the uploader.
    async fn remove_upload(
        &self,
        actor: Option<UserId>,
        resource_id: ResourceId,
        upload_handle: &str,
    ) -> MetadataResult<ResourceRow>;

    /// Delete a file record. The actor needs modify access.
    async fn delete_file(&self, actor: UserId, resource_id: ResourceId)
    -> MetadataResult<ResourceRow>;

    /// Delete a folder and everything currently below it.
    ///
    /// The subtree is resolved from the folder's path at write time, so the
    /// result can differ from an earlier snapshot.
    async fn delete_subtree(
        &self,
        actor: UserId,
        folder_id: ResourceId,
    ) -> MetadataResult<Vec<ResourceRow>>;
}
