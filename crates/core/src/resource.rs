//! Resource, repository and membership enums.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! text_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string used in the relational store.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Parse the stored string form.
            pub fn parse(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidEnum {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Whether a record is a file or a folder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    File,
    Folder,
}

text_enum!(ResourceKind, "resource kind", { File => "file", Folder => "folder" });

/// Repository visibility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

text_enum!(Visibility, "visibility", { Public => "public", Private => "private" });

/// Permission granted to a repository member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// May create, rename and delete resources.
    Full,
    /// May only read.
    Read,
}

text_enum!(Permission, "permission", { Full => "full", Read => "read" });

/// Account role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Cannot own repositories.
    Guest,
    #[default]
    User,
    Admin,
}

text_enum!(Role, "role", { Guest => "guest", User => "user", Admin => "admin" });

impl Role {
    /// Check if the role may create repositories.
    pub fn can_own_repositories(&self) -> bool {
        !matches!(self, Self::Guest)
    }
}

/// Upload state of a file, derived from its completion timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Multipart upload outstanding; bytes not yet committed.
    Uploading,
    /// Bytes committed to the blob store.
    Completed,
}

impl UploadState {
    /// Derive the state from the nullable completion timestamp.
    pub fn from_completed_at<T>(completed_at: Option<&T>) -> Self {
        if completed_at.is_some() {
            Self::Completed
        } else {
            Self::Uploading
        }
    }

    /// Check if the upload still accepts parts.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Uploading)
    }
}
