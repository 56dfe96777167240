//! End-to-end multipart uploads through the filesystem backend.

mod common;

use cabinet_storage::backends::filesystem::integrity_token;
use cabinet_storage::{BlobStore, BlobStoreListExt, CompletedPart, FilesystemBackend};
use common::coordinator;
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn write_target(url: &str, data: &[u8]) -> String {
    let path = PathBuf::from(url.strip_prefix("file://").unwrap());
    std::fs::write(path, data).unwrap();
    integrity_token(data)
}

#[tokio::test]
async fn test_coordinated_upload_roundtrip() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
    let coord = coordinator(store.clone());

    let data = b"cabinet multipart payload";
    let started = coord.start("3/7", data.len() as u64).await.unwrap();
    assert_eq!(started.targets.len(), 1);

    let token = write_target(&started.targets[0].url, data);
    coord
        .complete(
            "3/7",
            &started.upload_handle,
            data.len() as u64,
            &[CompletedPart {
                part_number: 1,
                integrity_token: token,
            }],
        )
        .await
        .unwrap();

    assert!(store.exists("3/7").await.unwrap());
    let url = coord.download_url("3/7", "notes.txt").await.unwrap();
    let path = PathBuf::from(url.strip_prefix("file://").unwrap());
    assert_eq!(std::fs::read(path).unwrap(), data);
}

#[tokio::test]
async fn test_delete_all_clears_prefix() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
    let coord = coordinator(store.clone());

    for id in 1..=3 {
        let key = format!("8/{id}");
        let started = coord.start(&key, 4).await.unwrap();
        let token = write_target(&started.targets[0].url, b"abcd");
        coord
            .complete(
                &key,
                &started.upload_handle,
                4,
                &[CompletedPart {
                    part_number: 1,
                    integrity_token: token,
                }],
            )
            .await
            .unwrap();
    }
    let pending = coord.start("8/4", 4).await.unwrap();
    let other = coord.start("80/1", 4).await.unwrap();

    let stats = coord.delete_all("8/").await.unwrap();
    assert_eq!(stats.objects_deleted, 3);
    assert_eq!(stats.uploads_aborted, 1);

    let objects: Vec<_> = store.object_pages("", 100).try_collect().await.unwrap();
    assert!(objects.concat().is_empty());

    let uploads: Vec<_> = store.multipart_pages("", 100).try_collect().await.unwrap();
    let uploads = uploads.concat();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].key, "80/1");
    assert_eq!(uploads[0].upload_handle, other.upload_handle);
    assert_ne!(uploads[0].upload_handle, pending.upload_handle);
}
