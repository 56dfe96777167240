//! User account repository.

use crate::error::MetadataResult;
use crate::models::{RepositoryRow, ResourceRow, UserRow};
use async_trait::async_trait;
use cabinet_core::{Role, UserId};

/// What deleting an account touches, read before any blob work.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub user: UserRow,
    /// Repositories the user owns; removed wholesale.
    pub owned_repositories: Vec<RepositoryRow>,
    /// Files the user uploaded into other users' repositories.
    pub foreign_files: Vec<ResourceRow>,
}

/// What the account delete actually removed.
#[derive(Debug, Clone, Default)]
pub struct AccountRemoval {
    pub foreign_files: Vec<ResourceRow>,
    /// Folders in other users' repositories handed to those owners.
    pub reassigned_folders: u64,
}

/// Repository for user accounts and the derived quota ledger.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Provision a user.
    async fn create_user(
        &self,
        username: &str,
        role: Role,
        space_quota: i64,
    ) -> MetadataResult<UserRow>;

    /// Get a user by ID.
    async fn get_user(&self, user_id: UserId) -> MetadataResult<Option<UserRow>>;

    /// Change a user's quota.
    async fn set_space_quota(&self, user_id: UserId, space_quota: i64) -> MetadataResult<()>;

    /// Sum of sizes over every file the user owns, computed live.
    async fn consumed_space(&self, user_id: UserId) -> MetadataResult<i64>;

    /// Read-only snapshot of everything an account delete must reconcile.
    async fn account_snapshot(&self, user_id: UserId) -> MetadataResult<AccountSnapshot>;

    /// Delete the account.
    ///
    /// Removes the user's files in other users' repositories, hands the
    /// user's folders there to the repository owners, then deletes the user
    /// row. Owned repositories, their resources and memberships cascade.
    async fn delete_account(&self, user_id: UserId) -> MetadataResult<AccountRemoval>;
}
