//! Core domain types and shared logic for cabinet.
//!
//! This crate defines the data model used by the other crates:
//! - Store-assigned identifiers and blob key layout
//! - Resource kinds, visibility, permissions and roles
//! - Path cleaning and prefix rules for the folder hierarchy
//! - The size-tiered multipart partition policy
//! - Shared configuration

pub mod config;
pub mod error;
pub mod ids;
pub mod partition;
pub mod path;
pub mod resource;

pub use error::{Error, Result};
pub use ids::{MemberId, RepositoryId, ResourceId, UserId, blob_key, parse_blob_key, repository_prefix};
pub use partition::Partition;
pub use resource::{Permission, ResourceKind, Role, UploadState, Visibility};
