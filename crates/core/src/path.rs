//! Resource path rules.
//!
//! Paths are `/`-separated and relative to the repository root. Folders are
//! implicit prefixes: `docs/img/a.png` lives under `docs/img`, which lives
//! under `docs`. Everything here is lexical; nothing touches a store.

use crate::error::{Error, Result};

/// Maximum byte length of a full resource path.
pub const MAX_PATH_BYTES: usize = 1024;

/// Maximum byte length of a single path segment.
pub const MAX_SEGMENT_BYTES: usize = 255;

/// Lexically clean a path.
///
/// Repeated separators collapse, `.` segments are dropped and `..` removes
/// the preceding segment. A rooted input stays rooted. An empty result is
/// returned as `"."`.
pub fn clean(raw: &str) -> String {
    let rooted = raw.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let joined = segments.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Clean and validate a resource path supplied by a caller.
pub fn normalize(raw: &str) -> Result<String> {
    let cleaned = clean(raw);

    if cleaned == "." {
        return Err(Error::InvalidPath("path is empty".to_string()));
    }
    if cleaned.starts_with('/') {
        return Err(Error::InvalidPath(format!("path must be relative: {raw}")));
    }
    if cleaned.len() > MAX_PATH_BYTES {
        return Err(Error::InvalidPath(format!(
            "path exceeds {MAX_PATH_BYTES} bytes"
        )));
    }
    for segment in cleaned.split('/') {
        if segment == ".." {
            return Err(Error::InvalidPath(format!(
                "path escapes the repository root: {raw}"
            )));
        }
        if segment.len() > MAX_SEGMENT_BYTES {
            return Err(Error::InvalidPath(format!(
                "path segment exceeds {MAX_SEGMENT_BYTES} bytes"
            )));
        }
    }

    Ok(cleaned)
}

/// Validate a new name for a rename. The name must be one segment.
pub fn normalize_name(raw: &str) -> Result<String> {
    let cleaned = clean(raw);

    if cleaned == "." || cleaned == ".." {
        return Err(Error::InvalidName(format!("not a usable name: {raw:?}")));
    }
    if cleaned.starts_with('/') {
        return Err(Error::InvalidName(format!("name must not be absolute: {raw}")));
    }
    if cleaned.contains('/') {
        return Err(Error::InvalidName(format!(
            "name must be a single path segment: {raw}"
        )));
    }
    if cleaned.len() > MAX_SEGMENT_BYTES {
        return Err(Error::InvalidName(format!(
            "name exceeds {MAX_SEGMENT_BYTES} bytes"
        )));
    }

    Ok(cleaned)
}

/// Parent folder of a path, or `None` for resources at the repository root.
pub fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Last segment of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

/// Path of a sibling that replaces the last segment of `path` with `name`.
pub fn with_name(path: &str, name: &str) -> String {
    match parent(path) {
        Some(parent) => format!("{parent}/{name}"),
        None => name.to_string(),
    }
}

/// Check if `path` lies strictly below `folder` (with a `/` boundary).
pub fn is_descendant(path: &str, folder: &str) -> bool {
    path.strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Replace the leading `old` folder prefix of `path` with `new`.
///
/// Only the leading occurrence is substituted; later text in the suffix that
/// happens to equal `old` is preserved. Returns `None` when `path` is neither
/// `old` itself nor one of its descendants.
pub fn rewrite_prefix(path: &str, old: &str, new: &str) -> Option<String> {
    if path == old {
        return Some(new.to_string());
    }
    let rest = path.strip_prefix(old)?;
    rest.starts_with('/').then(|| format!("{new}{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_matches_lexical_rules() {
        assert_eq!(clean(""), ".");
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("a/b/../c"), "a/c");
        assert_eq!(clean("../a"), "../a");
        assert_eq!(clean("/../a"), "/a");
        assert_eq!(clean("a/.."), ".");
        assert_eq!(clean("/"), "/");
    }

    #[test]
    fn test_normalize_rejects_structural_errors() {
        assert!(normalize("").is_err());
        assert!(normalize("./").is_err());
        assert!(normalize("/etc/passwd").is_err());
        assert!(normalize("../outside").is_err());
        assert!(normalize(&"a".repeat(MAX_PATH_BYTES + 1)).is_err());
        assert!(normalize(&format!("dir/{}", "b".repeat(MAX_SEGMENT_BYTES + 1))).is_err());
        assert_eq!(normalize("docs//img/./a.png").unwrap(), "docs/img/a.png");
    }

    #[test]
    fn test_normalize_name_requires_single_segment() {
        assert_eq!(normalize_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(normalize_name("folder/").unwrap(), "folder");
        assert!(normalize_name("a/b").is_err());
        assert!(normalize_name("/abs").is_err());
        assert!(normalize_name("").is_err());
        assert!(normalize_name("..").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("docs/img/a.png"), Some("docs/img"));
        assert_eq!(parent("a.png"), None);
        assert_eq!(file_name("docs/img/a.png"), "a.png");
        assert_eq!(file_name("a.png"), "a.png");
        assert_eq!(with_name("docs/img", "pictures"), "docs/pictures");
        assert_eq!(with_name("docs", "documents"), "documents");
    }

    #[test]
    fn test_descendant_requires_separator_boundary() {
        assert!(is_descendant("docs/a", "docs"));
        assert!(is_descendant("docs/img/a", "docs"));
        assert!(!is_descendant("docs", "docs"));
        assert!(!is_descendant("docsx/a", "docs"));
    }

    #[test]
    fn test_rewrite_prefix_only_touches_leading_occurrence() {
        assert_eq!(
            rewrite_prefix("docs/img/a.png", "docs", "documents").unwrap(),
            "documents/img/a.png"
        );
        assert_eq!(
            rewrite_prefix("docs/docs/docs.txt", "docs", "documents").unwrap(),
            "documents/docs/docs.txt"
        );
        assert_eq!(rewrite_prefix("docs", "docs", "documents").unwrap(), "documents");
        assert_eq!(rewrite_prefix("docsx/a", "docs", "documents"), None);
        assert_eq!(rewrite_prefix("other/docs/a", "docs", "documents"), None);
    }
}
