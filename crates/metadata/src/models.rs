//! Database models mapping to the metadata schema.

use cabinet_core::{
    Permission, RepositoryId, ResourceId, ResourceKind, Role, UploadState, UserId, Visibility,
    blob_key,
};
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::error::{MetadataError, MetadataResult};

fn parse_column<T>(
    parsed: cabinet_core::Result<T>,
    column: &'static str,
) -> MetadataResult<T> {
    parsed.map_err(|e| MetadataError::Internal(format!("corrupt {column} column: {e}")))
}

// =============================================================================
// Users
// =============================================================================

/// User account record.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub user_id: i64,
    pub username: String,
    pub role: String,
    /// Maximum total size of files the user may own, in bytes.
    pub space_quota: i64,
    pub created_at: OffsetDateTime,
}

impl UserRow {
    pub fn id(&self) -> UserId {
        UserId::new(self.user_id)
    }

    pub fn role(&self) -> MetadataResult<Role> {
        parse_column(Role::parse(&self.role), "users.role")
    }
}

// =============================================================================
// Repositories and members
// =============================================================================

/// Repository record.
#[derive(Debug, Clone, FromRow)]
pub struct RepositoryRow {
    pub repository_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub visibility: String,
    pub created_at: OffsetDateTime,
}

impl RepositoryRow {
    pub fn id(&self) -> RepositoryId {
        RepositoryId::new(self.repository_id)
    }

    pub fn owner(&self) -> UserId {
        UserId::new(self.owner_id)
    }

    pub fn visibility(&self) -> MetadataResult<Visibility> {
        parse_column(Visibility::parse(&self.visibility), "repositories.visibility")
    }
}

/// A repository as listed for one user: owned or joined as a member.
#[derive(Debug, Clone, FromRow)]
pub struct RepositorySummary {
    pub repository_id: i64,
    pub name: String,
    pub visibility: String,
    pub owner_username: String,
    /// `None` when the user owns the repository.
    pub member_permission: Option<String>,
    /// Total size of the user's own files in the repository, in bytes.
    pub uploaded_bytes: i64,
}

impl RepositorySummary {
    pub fn id(&self) -> RepositoryId {
        RepositoryId::new(self.repository_id)
    }

    pub fn visibility(&self) -> MetadataResult<Visibility> {
        parse_column(Visibility::parse(&self.visibility), "repositories.visibility")
    }
}

/// Membership record granting a non-owner access to a repository.
#[derive(Debug, Clone, FromRow)]
pub struct MemberRow {
    pub member_id: i64,
    pub repository_id: i64,
    pub user_id: i64,
    pub permission: String,
    pub created_at: OffsetDateTime,
}

impl MemberRow {
    pub fn permission(&self) -> MetadataResult<Permission> {
        parse_column(Permission::parse(&self.permission), "members.permission")
    }
}

/// Repository ownership joined with the actor's membership, if any.
#[derive(Debug, Clone, FromRow)]
pub struct AccessRow {
    pub repository_id: i64,
    pub owner_id: i64,
    pub visibility: String,
    pub member_permission: Option<String>,
}

// =============================================================================
// Resources (files and folders)
// =============================================================================

/// File or folder record.
///
/// `upload_completed_at` is null while the file's bytes are not yet
/// committed to the blob store; that null is the authoritative in-progress
/// flag. Folders are inserted already completed and never carry a handle.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ResourceRow {
    pub resource_id: i64,
    pub repository_id: i64,
    pub owner_id: i64,
    pub path: String,
    pub kind: String,
    pub size: i64,
    pub upload_handle: Option<String>,
    pub upload_completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl ResourceRow {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.resource_id)
    }

    pub fn repository(&self) -> RepositoryId {
        RepositoryId::new(self.repository_id)
    }

    pub fn owner(&self) -> UserId {
        UserId::new(self.owner_id)
    }

    pub fn kind(&self) -> MetadataResult<ResourceKind> {
        parse_column(ResourceKind::parse(&self.kind), "resources.kind")
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ResourceKind::Folder.as_str()
    }

    pub fn is_file(&self) -> bool {
        self.kind == ResourceKind::File.as_str()
    }

    pub fn upload_state(&self) -> UploadState {
        UploadState::from_completed_at(self.upload_completed_at.as_ref())
    }

    /// Blob-store key holding this resource's bytes.
    pub fn blob_key(&self) -> String {
        blob_key(self.repository(), self.id())
    }

    /// Declared size as an unsigned byte count.
    pub fn byte_size(&self) -> MetadataResult<u64> {
        u64::try_from(self.size).map_err(|_| {
            MetadataError::Internal(format!(
                "resource {} has negative size {}",
                self.resource_id, self.size
            ))
        })
    }
}

/// One acknowledged part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PartRow {
    pub resource_id: i64,
    pub part_number: i32,
    /// Opaque integrity tag (ETag) returned by the blob store for the part.
    pub integrity_token: String,
    pub created_at: OffsetDateTime,
}
