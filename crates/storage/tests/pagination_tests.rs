//! Listing streams must walk every page the store reports.

use cabinet_storage::{BlobStoreListExt, MemoryBackend};
use cabinet_storage::backends::memory::BlobOp;
use futures::StreamExt;
use std::collections::HashSet;
use time::OffsetDateTime;

#[tokio::test]
async fn test_object_pages_walks_all_pages() {
    let store = MemoryBackend::with_page_limit(100);
    let now = OffsetDateTime::now_utc();
    for i in 0..1050 {
        store.insert_object(&format!("1/{i:05}"), now);
    }

    let mut stream = store.object_pages("1/", 1000);
    let mut seen = HashSet::new();
    let mut pages = 0;
    while let Some(page) = stream.next().await {
        let page = page.unwrap();
        assert!(page.len() <= 100);
        for entry in page {
            assert!(seen.insert(entry.key), "duplicate key across pages");
        }
        pages += 1;
    }

    assert_eq!(seen.len(), 1050);
    assert_eq!(pages, 11);
    assert_eq!(store.calls(BlobOp::ListObjects), 11);
}

#[tokio::test]
async fn test_multipart_pages_resume_with_markers() {
    let store = MemoryBackend::with_page_limit(3);
    let now = OffsetDateTime::now_utc();
    // Several uploads for the same key exercise the upload-id marker
    for handle in ["a", "b", "c", "d"] {
        store.insert_upload("2/1", handle, now);
    }
    store.insert_upload("2/2", "a", now);

    let mut stream = store.multipart_pages("2/", 1000);
    let mut seen = Vec::new();
    while let Some(page) = stream.next().await {
        for entry in page.unwrap() {
            seen.push((entry.key, entry.upload_handle));
        }
    }

    assert_eq!(seen.len(), 5);
    assert_eq!(seen[3], ("2/1".to_string(), "d".to_string()));
    assert_eq!(seen[4], ("2/2".to_string(), "a".to_string()));
}

#[tokio::test]
async fn test_empty_prefix_yields_no_pages() {
    let store = MemoryBackend::new();
    let mut stream = store.object_pages("nothing/", 10);
    assert!(stream.next().await.is_none());
}
