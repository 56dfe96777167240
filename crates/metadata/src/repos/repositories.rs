//! Repository (the tenant container) records.

use crate::error::MetadataResult;
use crate::gate::Access;
use crate::models::{RepositoryRow, RepositorySummary};
use async_trait::async_trait;
use cabinet_core::{RepositoryId, UserId, Visibility};

/// Repository for repository records.
#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    /// Create a repository owned by `owner`.
    ///
    /// Fails with insufficient permission for guests and with already-exists
    /// when the owner has a repository of that name.
    async fn create_repository(
        &self,
        owner: UserId,
        name: &str,
        visibility: Visibility,
    ) -> MetadataResult<RepositoryRow>;

    /// Get a repository by ID.
    async fn get_repository(
        &self,
        repository_id: RepositoryId,
    ) -> MetadataResult<Option<RepositoryRow>>;

    /// Repositories a user owns or is a member of, ordered by name, each
    /// with the size of that user's files in it.
    async fn list_repositories(&self, user_id: UserId) -> MetadataResult<Vec<RepositorySummary>>;

    /// Rename a repository. Only the owner may, and the name must be free
    /// among the owner's repositories.
    async fn rename_repository(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
        name: &str,
    ) -> MetadataResult<RepositoryRow>;

    /// Change who may read a repository. Only the owner may.
    async fn set_visibility(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
        visibility: Visibility,
    ) -> MetadataResult<RepositoryRow>;

    /// Resolve what `actor` may do in a repository (anonymous when `None`).
    async fn access(
        &self,
        actor: Option<UserId>,
        repository_id: RepositoryId,
    ) -> MetadataResult<Access>;

    /// Delete a repository. Ownership is re-checked inside the transaction.
    async fn delete_repository(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
    ) -> MetadataResult<RepositoryRow>;
}
