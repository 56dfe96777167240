//! Repository membership records.

use crate::error::MetadataResult;
use crate::gate::Access;
use crate::models::{MemberRow, ResourceRow};
use async_trait::async_trait;
use cabinet_core::{MemberId, Permission, RepositoryId, UserId};

/// Read-only view of a membership about to be removed.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub member: MemberRow,
    pub access: Access,
    /// Files the member uploaded into the repository.
    pub files: Vec<ResourceRow>,
}

/// What a member delete actually removed.
#[derive(Debug, Clone, Default)]
pub struct MemberRemoval {
    pub files: Vec<ResourceRow>,
    pub reassigned_folders: u64,
}

/// Repository for memberships.
#[async_trait]
pub trait MemberRepo: Send + Sync {
    /// Grant `user_id` access to a repository. Only the owner may do this.
    async fn add_member(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
        user_id: UserId,
        permission: Permission,
    ) -> MetadataResult<MemberRow>;

    /// Get a membership by ID.
    async fn get_member(&self, member_id: MemberId) -> MetadataResult<Option<MemberRow>>;

    /// List memberships of a repository.
    async fn list_members(&self, repository_id: RepositoryId) -> MetadataResult<Vec<MemberRow>>;

    /// Snapshot a membership for removal. The actor must be the repository
    /// owner or the member themself.
    async fn member_snapshot(
        &self,
        actor: UserId,
        member_id: MemberId,
    ) -> MetadataResult<MemberSnapshot>;

    /// Remove a membership along with the member's files in the repository.
    /// The member's folders are handed to the repository owner.
    async fn delete_member(
        &self,
        actor: UserId,
        member_id: MemberId,
    ) -> MetadataResult<MemberRemoval>;
}
