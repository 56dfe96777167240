//! Folder-prefix hierarchy over flat, path-keyed resource records.
//!
//! Everything here works on rows already loaded inside a transaction. The
//! stores load a coarse candidate set (the folder plus everything sharing
//! its prefix) and these functions decide membership with the exact `/`
//! boundary rule.

use cabinet_core::path;

use crate::models::ResourceRow;

/// Records strictly below `folder_path`.
pub fn descendants_of<'a>(records: &'a [ResourceRow], folder_path: &str) -> Vec<&'a ResourceRow> {
    records
        .iter()
        .filter(|r| path::is_descendant(&r.path, folder_path))
        .collect()
}

/// A single path change produced by a folder rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    pub resource_id: i64,
    pub old_path: String,
    pub new_path: String,
}

/// Compute the path changes for renaming `folder_path` to `new_folder_path`.
///
/// The folder's own record comes first, followed by every descendant with
/// its leading prefix replaced and the suffix left exactly as it was.
pub fn rename(
    records: &[ResourceRow],
    folder_path: &str,
    new_folder_path: &str,
) -> Vec<PathRewrite> {
    let folder = records.iter().filter(|r| r.path == folder_path);
    let descendants = records
        .iter()
        .filter(|r| path::is_descendant(&r.path, folder_path));

    folder
        .chain(descendants)
        .filter_map(|r| {
            path::rewrite_prefix(&r.path, folder_path, new_folder_path).map(|new_path| {
                PathRewrite {
                    resource_id: r.resource_id,
                    old_path: r.path.clone(),
                    new_path,
                }
            })
        })
        .collect()
}

/// Records removed by a delete, split by what the blob store must do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSet {
    /// Files whose bytes are committed; their objects are hard-deleted.
    pub uploaded: Vec<ResourceRow>,
    /// Files with an outstanding multipart upload; those uploads are aborted.
    pub in_progress: Vec<ResourceRow>,
    /// Folders carry no blob state.
    pub folders: Vec<ResourceRow>,
}

impl DeleteSet {
    /// The folder itself plus every descendant.
    pub fn for_folder(records: &[ResourceRow], folder_path: &str) -> Self {
        Self::partition(
            records
                .iter()
                .filter(|r| r.path == folder_path || path::is_descendant(&r.path, folder_path))
                .cloned(),
        )
    }

    /// Partition arbitrary records by upload state.
    pub fn partition(records: impl IntoIterator<Item = ResourceRow>) -> Self {
        let mut set = Self::default();
        for record in records {
            if record.is_folder() {
                set.folders.push(record);
            } else if record.upload_completed_at.is_some() {
                set.uploaded.push(record);
            } else {
                set.in_progress.push(record);
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.uploaded.len() + self.in_progress.len() + self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of every record in the set.
    pub fn resource_ids(&self) -> Vec<i64> {
        self.uploaded
            .iter()
            .chain(&self.in_progress)
            .chain(&self.folders)
            .map(|r| r.resource_id)
            .collect()
    }

    /// Blob keys of committed objects.
    pub fn uploaded_keys(&self) -> Vec<String> {
        self.uploaded.iter().map(ResourceRow::blob_key).collect()
    }

    /// `(key, upload handle)` pairs of outstanding multipart uploads.
    ///
    /// Records without a handle never reached the blob store and are skipped.
    pub fn pending_uploads(&self) -> Vec<(String, String)> {
        self.in_progress
            .iter()
            .filter_map(|r| r.upload_handle.clone().map(|h| (r.blob_key(), h)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn row(id: i64, path: &str, kind: &str, completed: bool) -> ResourceRow {
        ResourceRow {
            resource_id: id,
            repository_id: 1,
            owner_id: 1,
            path: path.to_string(),
            kind: kind.to_string(),
            size: if kind == "folder" { 0 } else { 10 },
            upload_handle: (!completed).then(|| format!("handle-{id}")),
            upload_completed_at: completed.then(OffsetDateTime::now_utc),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn tree() -> Vec<ResourceRow> {
        vec![
            row(1, "docs", "folder", true),
            row(2, "docs/img", "folder", true),
            row(3, "docs/img/a.png", "file", true),
            row(4, "docs/docs", "folder", true),
            row(5, "docs/docs/docs.txt", "file", false),
            row(6, "docsx", "folder", true),
            row(7, "docsx/b.txt", "file", true),
            row(8, "readme.md", "file", true),
        ]
    }

    #[test]
    fn test_descendants_respect_separator() {
        let records = tree();
        let ids: Vec<i64> = descendants_of(&records, "docs")
            .iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
        assert!(descendants_of(&records, "readme.md").is_empty());
    }

    #[test]
    fn test_rename_rewrites_folder_then_descendants() {
        let records = tree();
        let rewrites = rename(&records, "docs", "documents");

        assert_eq!(rewrites[0].resource_id, 1);
        assert_eq!(rewrites[0].new_path, "documents");

        let paths: Vec<&str> = rewrites.iter().map(|r| r.new_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "documents",
                "documents/img",
                "documents/img/a.png",
                "documents/docs",
                "documents/docs/docs.txt",
            ]
        );
    }

    #[test]
    fn test_rename_leaves_no_old_prefix() {
        let records = tree();
        let rewrites = rename(&records, "docs", "documents");
        for rewrite in &rewrites {
            assert!(!path::is_descendant(&rewrite.new_path, "docs"));
            assert_ne!(rewrite.new_path, "docs");
            let suffix = rewrite.old_path.strip_prefix("docs").unwrap();
            assert_eq!(rewrite.new_path, format!("documents{suffix}"));
        }
    }

    #[test]
    fn test_delete_set_partitions_by_upload_state() {
        let set = DeleteSet::for_folder(&tree(), "docs");
        assert_eq!(set.len(), 5);
        assert_eq!(set.folders.len(), 3);
        assert_eq!(set.uploaded_keys(), vec!["1/3".to_string()]);
        assert_eq!(
            set.pending_uploads(),
            vec![("1/5".to_string(), "handle-5".to_string())]
        );

        let mut ids = set.resource_ids();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_delete_set_for_missing_folder_is_empty() {
        assert!(DeleteSet::for_folder(&tree(), "nothing").is_empty());
    }
}
