//! Metadata store wrapper that fails chosen writes with serialization conflicts.
//!
//! A failed attempt never reaches the wrapped store, matching a transaction
//! that was rolled back before it could commit.

use async_trait::async_trait;
use cabinet_core::{
    MemberId, Permission, RepositoryId, ResourceId, ResourceKind, Role, UserId, Visibility,
};
use cabinet_metadata::models::{
    MemberRow, PartRow, RepositoryRow, RepositorySummary, ResourceRow, UserRow,
};
use cabinet_metadata::repos::{
    AccountRemoval, AccountSnapshot, MemberRemoval, MemberRepo, MemberSnapshot, PartRepo,
    ReconcileRepo, RepositoryRepo, ResourceRepo, ResourceSnapshot, SubtreeSnapshot, UserRepo,
};
use cabinet_metadata::{
    Access, Admission, MetadataError, MetadataResult, MetadataStore, PathRewrite,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

#[allow(dead_code)]
pub struct FlakyMetadata {
    inner: Arc<dyn MetadataStore>,
    failures: Mutex<HashMap<&'static str, u32>>,
    calls: Mutex<HashMap<&'static str, u32>>,
}

#[allow(dead_code)]
impl FlakyMetadata {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` calls of the write `method`.
    pub fn fail_next(&self, method: &'static str, times: u32) {
        self.failures.lock().unwrap().insert(method, times);
    }

    /// Attempts made for `method`, failed ones included.
    pub fn calls(&self, method: &'static str) -> u32 {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    fn attempt(&self, method: &'static str) -> MetadataResult<()> {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(MetadataError::SerializationFailure(format!(
                    "injected conflict in {method}"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl UserRepo for FlakyMetadata {
    async fn create_user(
        &self,
        username: &str,
        role: Role,
        space_quota: i64,
    ) -> MetadataResult<UserRow> {
        self.attempt("create_user")?;
        self.inner.create_user(username, role, space_quota).await
    }

    async fn get_user(&self, user_id: UserId) -> MetadataResult<Option<UserRow>> {
        self.inner.get_user(user_id).await
    }

    async fn set_space_quota(&self, user_id: UserId, space_quota: i64) -> MetadataResult<()> {
        self.attempt("set_space_quota")?;
        self.inner.set_space_quota(user_id, space_quota).await
    }

    async fn consumed_space(&self, user_id: UserId) -> MetadataResult<i64> {
        self.inner.consumed_space(user_id).await
    }

    async fn account_snapshot(&self, user_id: UserId) -> MetadataResult<AccountSnapshot> {
        self.inner.account_snapshot(user_id).await
    }

    async fn delete_account(&self, user_id: UserId) -> MetadataResult<AccountRemoval> {
        self.attempt("delete_account")?;
        self.inner.delete_account(user_id).await
    }
}

#[async_trait]
impl RepositoryRepo for FlakyMetadata {
    async fn create_repository(
        &self,
        owner: UserId,
        name: &str,
        visibility: Visibility,
    ) -> MetadataResult<RepositoryRow> {
        self.attempt("create_repository")?;
        self.inner.create_repository(owner, name, visibility).await
    }

    async fn get_repository(
        &self,
        repository_id: RepositoryId,
    ) -> MetadataResult<Option<RepositoryRow>> {
        self.inner.get_repository(repository_id).await
    }

    async fn list_repositories(&self, user_id: UserId) -> MetadataResult<Vec<RepositorySummary>> {
        self.inner.list_repositories(user_id).await
    }

    async fn rename_repository(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
        name: &str,
    ) -> MetadataResult<RepositoryRow> {
        self.attempt("rename_repository")?;
        self.inner.rename_repository(actor, repository_id, name).await
    }

    async fn set_visibility(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
        visibility: Visibility,
    ) -> MetadataResult<RepositoryRow> {
        self.attempt("set_visibility")?;
        self.inner.set_visibility(actor, repository_id, visibility).await
    }

    async fn access(
        &self,
        actor: Option<UserId>,
        repository_id: RepositoryId,
    ) -> MetadataResult<Access> {
        self.inner.access(actor, repository_id).await
    }

    async fn delete_repository(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
    ) -> MetadataResult<RepositoryRow> {
        self.attempt("delete_repository")?;
        self.inner.delete_repository(actor, repository_id).await
    }
}

#[async_trait]
impl MemberRepo for FlakyMetadata {
    async fn add_member(
        &self,
        actor: UserId,
        repository_id: RepositoryId,
        user_id: UserId,
        permission: Permission,
    ) -> MetadataResult<MemberRow> {
        self.attempt("add_member")?;
        self.inner
            .add_member(actor, repository_id, user_id, permission)
            .await
    }

    async fn get_member(&self, member_id: MemberId) -> MetadataResult<Option<MemberRow>> {
        self.inner.get_member(member_id).await
    }

    async fn list_members(&self, repository_id: RepositoryId) -> MetadataResult<Vec<MemberRow>> {
        self.inner.list_members(repository_id).await
    }

    async fn member_snapshot(
        &self,
        actor: UserId,
        member_id: MemberId,
    ) -> MetadataResult<MemberSnapshot> {
        self.inner.member_snapshot(actor, member_id).await
    }

    async fn delete_member(
        &self,
        actor: UserId,
        member_id: MemberId,
    ) -> MetadataResult<MemberRemoval> {
        self.attempt("delete_member")?;
        self.inner.delete_member(actor, member_id).await
    }
}

#[async_trait]
impl ResourceRepo for FlakyMetadata {
    async fn check_admission(&self, admission: &Admission<'_>) -> MetadataResult<()> {
        self.inner.check_admission(admission).await
    }

    async fn reserve_resource_id(&self) -> MetadataResult<ResourceId> {
        self.inner.reserve_resource_id().await
    }

    async fn insert_file(
        &self,
        admission: &Admission<'_>,
        resource_id: ResourceId,
        upload_handle: &str,
    ) -> MetadataResult<ResourceRow> {
        self.attempt("insert_file")?;
        self.inner
            .insert_file(admission, resource_id, upload_handle)
            .await
    }

    async fn insert_folder(&self, admission: &Admission<'_>) -> MetadataResult<ResourceRow> {
        self.attempt("insert_folder")?;
        self.inner.insert_folder(admission).await
    }

    async fn get_resource(&self, resource_id: ResourceId) -> MetadataResult<Option<ResourceRow>> {
        self.inner.get_resource(resource_id).await
    }

    async fn find_resource(
        &self,
        repository_id: RepositoryId,
        path: &str,
    ) -> MetadataResult<Option<ResourceRow>> {
        self.inner.find_resource(repository_id, path).await
    }

    async fn list_resources(
        &self,
        repository_id: RepositoryId,
    ) -> MetadataResult<Vec<ResourceRow>> {
        self.inner.list_resources(repository_id).await
    }

    async fn resource_snapshot(
        &self,
        actor: Option<UserId>,
        resource_id: ResourceId,
    ) -> MetadataResult<ResourceSnapshot> {
        self.inner.resource_snapshot(actor, resource_id).await
    }

    async fn subtree_snapshot(
        &self,
        actor: UserId,
        folder_id: ResourceId,
    ) -> MetadataResult<SubtreeSnapshot> {
        self.inner.subtree_snapshot(actor, folder_id).await
    }

    async fn rename_resource(
        &self,
        actor: UserId,
        resource_id: ResourceId,
        kind: ResourceKind,
        new_name: &str,
    ) -> MetadataResult<Vec<PathRewrite>> {
        self.attempt("rename_resource")?;
        self.inner
            .rename_resource(actor, resource_id, kind, new_name)
            .await
    }

    async fn complete_upload(
        &self,
        actor: UserId,
        resource_id: ResourceId,
        upload_handle: &str,
        completed_at: OffsetDateTime,
    ) -> MetadataResult<ResourceRow> {
        self.attempt("complete_upload")?;
        self.inner
            .complete_upload(actor, resource_id, upload_handle, completed_at)
            .await
    }

    async fn remove_upload(
        &self,
        actor: Option<UserId>,
        resource_id: ResourceId,
        upload_handle: &str,
    ) -> MetadataResult<ResourceRow> {
        self.attempt("remove_upload")?;
        self.inner
            .remove_upload(actor, resource_id, upload_handle)
            .await
    }

    async fn delete_file(
        &self,
        actor: UserId,
        resource_id: ResourceId,
    ) -> MetadataResult<ResourceRow> {
        self.attempt("delete_file")?;
        self.inner.delete_file(actor, resource_id).await
    }

    async fn delete_subtree(
        &self,
        actor: UserId,
        folder_id: ResourceId,
    ) -> MetadataResult<Vec<ResourceRow>> {
        self.attempt("delete_subtree")?;
        self.inner.delete_subtree(actor, folder_id).await
    }
}

#[async_trait]
impl PartRepo for FlakyMetadata {
    async fn record_part(
        &self,
        actor: UserId,
        resource_id: ResourceId,
        part_number: u32,
        integrity_token: &str,
    ) -> MetadataResult<PartRow> {
        self.attempt("record_part")?;
        self.inner
            .record_part(actor, resource_id, part_number, integrity_token)
            .await
    }

    async fn list_parts(&self, resource_id: ResourceId) -> MetadataResult<Vec<PartRow>> {
        self.inner.list_parts(resource_id).await
    }
}

#[async_trait]
impl ReconcileRepo for FlakyMetadata {
    async fn stale_uploads(
        &self,
        created_before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ResourceRow>> {
        self.inner.stale_uploads(created_before, limit).await
    }

    async fn resources_by_ids(&self, resource_ids: &[i64]) -> MetadataResult<Vec<ResourceRow>> {
        self.inner.resources_by_ids(resource_ids).await
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadata {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
