//! Store-assigned identifiers.
//!
//! Every identifier is a positive 64-bit integer allocated by the relational
//! store. The newtypes keep a repository id from being passed where a
//! resource id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! store_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw store identifier.
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Get the raw store identifier.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

store_id!(
    /// Identifier of a user account.
    UserId
);
store_id!(
    /// Identifier of a repository.
    RepositoryId
);
store_id!(
    /// Identifier of a file or folder record.
    ResourceId
);
store_id!(
    /// Identifier of a repository membership.
    MemberId
);

/// Blob-store key for a resource's bytes.
///
/// Keys are derived from identifiers only, so renaming a file or folder
/// never moves blob objects.
pub fn blob_key(repository_id: RepositoryId, resource_id: ResourceId) -> String {
    format!("{repository_id}/{resource_id}")
}

/// Key prefix shared by every object of a repository.
pub fn repository_prefix(repository_id: RepositoryId) -> String {
    format!("{repository_id}/")
}

/// Parse a blob key produced by [`blob_key`].
pub fn parse_blob_key(key: &str) -> Option<(RepositoryId, ResourceId)> {
    let (repository, resource) = key.split_once('/')?;
    let repository = repository.parse::<i64>().ok().filter(|v| *v > 0)?;
    let resource = resource.parse::<i64>().ok().filter(|v| *v > 0)?;
    Some((RepositoryId(repository), ResourceId(resource)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_key_format() {
        let key = blob_key(RepositoryId::new(12), ResourceId::new(345));
        assert_eq!(key, "12/345");
        assert_eq!(
            parse_blob_key(&key),
            Some((RepositoryId::new(12), ResourceId::new(345)))
        );
    }

    #[test]
    fn test_repository_prefix_has_boundary() {
        let prefix = repository_prefix(RepositoryId::new(1));
        assert!(blob_key(RepositoryId::new(1), ResourceId::new(9)).starts_with(&prefix));
        assert!(!blob_key(RepositoryId::new(12), ResourceId::new(9)).starts_with(&prefix));
    }

    #[test]
    fn test_parse_blob_key_rejects_foreign_keys() {
        assert_eq!(parse_blob_key("12"), None);
        assert_eq!(parse_blob_key("12/abc"), None);
        assert_eq!(parse_blob_key("12/3/4"), None);
        assert_eq!(parse_blob_key("0/3"), None);
        assert_eq!(parse_blob_key("tmp/upload"), None);
    }

    #[test]
    fn test_id_serializes_as_integer() {
        let json = serde_json::to_string(&ResourceId::new(7)).unwrap();
        assert_eq!(json, "7");
        assert_eq!(format!("{:?}", UserId::new(3)), "UserId(3)");
    }
}
