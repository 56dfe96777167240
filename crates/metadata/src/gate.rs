//! Quota and permission gate.
//!
//! The store loads [`GateFacts`] as the first reads of a write transaction
//! and [`admit`] decides on them before the insert runs in that same
//! transaction. Quota is summed live on every call: two concurrent
//! admissions either serialize or one of them aborts.

use cabinet_core::{Permission, RepositoryId, ResourceKind, UserId, Visibility};

use crate::error::{MetadataError, MetadataResult};
use crate::models::AccessRow;

/// What an actor may do in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub actor: Option<UserId>,
    pub repository_id: RepositoryId,
    pub owner_id: UserId,
    pub visibility: Visibility,
    pub member_permission: Option<Permission>,
}

impl Access {
    /// Build from the joined repository/member row.
    pub fn from_row(actor: Option<UserId>, row: &AccessRow) -> MetadataResult<Self> {
        let visibility = Visibility::parse(&row.visibility)?;
        let member_permission = row
            .member_permission
            .as_deref()
            .map(Permission::parse)
            .transpose()?;
        Ok(Self {
            actor,
            repository_id: RepositoryId::new(row.repository_id),
            owner_id: UserId::new(row.owner_id),
            visibility,
            member_permission,
        })
    }

    pub fn is_owner(&self) -> bool {
        self.actor == Some(self.owner_id)
    }

    /// Owner or member with `full` permission.
    pub fn can_modify(&self) -> bool {
        self.is_owner() || self.member_permission == Some(Permission::Full)
    }

    pub fn can_read(&self) -> bool {
        self.visibility == Visibility::Public
            || self.is_owner()
            || self.member_permission.is_some()
    }

    pub fn require_modify(&self) -> MetadataResult<()> {
        if self.can_modify() {
            Ok(())
        } else {
            Err(MetadataError::InsufficientPermission(format!(
                "modify access to repository {} required",
                self.repository_id
            )))
        }
    }

    pub fn require_owner(&self) -> MetadataResult<()> {
        if self.is_owner() {
            Ok(())
        } else {
            Err(MetadataError::InsufficientPermission(format!(
                "only the owner of repository {} may do this",
                self.repository_id
            )))
        }
    }
}

/// A prospective new resource record.
#[derive(Debug, Clone, Copy)]
pub struct Admission<'a> {
    pub actor: UserId,
    pub repository_id: RepositoryId,
    /// Normalized path of the new record.
    pub path: &'a str,
    pub kind: ResourceKind,
    /// Declared size; 0 for folders.
    pub size: i64,
}

impl Admission<'_> {
    /// Parent folder path, or `None` at the repository root.
    pub fn parent(&self) -> Option<&str> {
        cabinet_core::path::parent(self.path)
    }
}

/// What exists at the new record's parent path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentState {
    /// The record sits at the repository root.
    Root,
    Folder,
    /// Something exists at the parent path, but it is a file.
    NotFolder,
    Missing,
}

impl ParentState {
    /// Classify from the kind stored at the parent path.
    pub fn from_kind(parent: Option<&str>, stored_kind: Option<&str>) -> Self {
        match (parent, stored_kind) {
            (None, _) => Self::Root,
            (Some(_), None) => Self::Missing,
            (Some(_), Some(kind)) if kind == ResourceKind::Folder.as_str() => Self::Folder,
            (Some(_), Some(_)) => Self::NotFolder,
        }
    }
}

/// Facts read inside the write transaction.
#[derive(Debug, Clone, Copy)]
pub struct GateFacts {
    pub access: Access,
    pub space_quota: i64,
    /// Sum of sizes over files the actor owns.
    pub consumed: i64,
    pub path_taken: bool,
    pub parent: ParentState,
}

/// Decide an admission. Checks run in order and the first failure wins.
pub fn admit(admission: &Admission<'_>, facts: &GateFacts) -> MetadataResult<()> {
    facts.access.require_modify()?;

    if admission.kind == ResourceKind::File {
        let projected = facts.consumed.checked_add(admission.size);
        if projected.is_none_or(|total| total > facts.space_quota) {
            return Err(MetadataError::QuotaExceeded {
                quota: facts.space_quota,
                consumed: facts.consumed,
                requested: admission.size,
            });
        }
    }

    if facts.path_taken {
        return Err(MetadataError::AlreadyExists(format!(
            "{} already exists in repository {}",
            admission.path, admission.repository_id
        )));
    }

    match facts.parent {
        ParentState::Root | ParentState::Folder => Ok(()),
        ParentState::NotFolder | ParentState::Missing => Err(MetadataError::ParentMissing(
            admission.parent().unwrap_or_default().to_string(),
        )),
    }
}
