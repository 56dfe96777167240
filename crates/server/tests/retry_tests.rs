//! Serialization conflicts injected under the lifecycle operations.

mod common;

use cabinet_core::{Visibility, blob_key};
use cabinet_server::Outcome;
use cabinet_server::lifecycle::{repositories, resources, uploads};
use cabinet_storage::backends::memory::BlobOp;
use common::TestEngine;

const QUOTA: i64 = 1_000_000_000;

#[tokio::test]
async fn test_completion_retries_without_repeating_blob_calls() {
    let (engine, flaky) = TestEngine::flaky().await;
    let (_, alice) = engine.user("alice", QUOTA).await;
    let repo = engine.repository(&alice, "docs", Visibility::Private).await;
    let ticket = uploads::start_upload(&engine.state, &alice, repo, "a.txt", 100)
        .await
        .unwrap();
    engine.acknowledge_all(&alice, &ticket).await;

    flaky.fail_next("complete_upload", 2);
    let file = uploads::complete_upload(&engine.state, &alice, ticket.file_id)
        .await
        .unwrap();

    assert!(file.upload_completed_at.is_some());
    assert_eq!(flaky.calls("complete_upload"), 3);
    assert_eq!(engine.blobs.calls(BlobOp::CompleteMultipart), 1);
}

#[tokio::test]
async fn test_exhausted_completion_recovers_on_next_call() {
    let (engine, flaky) = TestEngine::flaky().await;
    let (_, alice) = engine.user("alice", QUOTA).await;
    let repo = engine.repository(&alice, "docs", Visibility::Private).await;
    let ticket = uploads::start_upload(&engine.state, &alice, repo, "a.txt", 100)
        .await
        .unwrap();
    engine.acknowledge_all(&alice, &ticket).await;

    flaky.fail_next("complete_upload", 3);
    let err = uploads::complete_upload(&engine.state, &alice, ticket.file_id)
        .await
        .unwrap_err();
    assert_eq!(err.outcome(), Outcome::Internal);
    assert_eq!(err.code(), "retries_exhausted");
    assert!(!err.public_message().contains("complete upload"));

    // The object is finalized but the record still says in progress
    let key = blob_key(repo, ticket.file_id);
    assert_eq!(engine.blobs.object_keys(), vec![key]);
    let record = resources::get_resource(&engine.state, &alice, ticket.file_id)
        .await
        .unwrap();
    assert!(record.upload_completed_at.is_none());

    let file = uploads::complete_upload(&engine.state, &alice, ticket.file_id)
        .await
        .unwrap();
    assert!(file.upload_completed_at.is_some());
    assert_eq!(flaky.calls("complete_upload"), 4);
}

#[tokio::test]
async fn test_failed_start_leaves_upload_for_the_sweep() {
    let (engine, flaky) = TestEngine::flaky().await;
    let (_, alice) = engine.user("alice", QUOTA).await;
    let repo = engine.repository(&alice, "docs", Visibility::Private).await;

    flaky.fail_next("insert_file", 3);
    let err = uploads::start_upload(&engine.state, &alice, repo, "a.txt", 100)
        .await
        .unwrap_err();
    assert_eq!(err.outcome(), Outcome::Internal);

    assert_eq!(engine.blobs.calls(BlobOp::CreateMultipart), 1);
    assert_eq!(engine.blobs.calls(BlobOp::AbortMultipart), 0);
    assert_eq!(engine.blobs.open_uploads().len(), 1);
    let records = resources::list_resources(&engine.state, &alice, repo)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_part_acknowledgement_retries_to_one_row() {
    let (engine, flaky) = TestEngine::flaky().await;
    let (_, alice) = engine.user("alice", QUOTA).await;
    let repo = engine.repository(&alice, "docs", Visibility::Private).await;
    let ticket = uploads::start_upload(&engine.state, &alice, repo, "a.txt", 100)
        .await
        .unwrap();

    flaky.fail_next("record_part", 2);
    uploads::acknowledge_part(&engine.state, &alice, ticket.file_id, 1, "\"etag-1\"")
        .await
        .unwrap();

    let parts = uploads::list_parts(&engine.state, &alice, ticket.file_id)
        .await
        .unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(flaky.calls("record_part"), 3);
}

#[tokio::test]
async fn test_folder_delete_retry_aborts_uploads_once() {
    let (engine, flaky) = TestEngine::flaky().await;
    let (_, alice) = engine.user("alice", QUOTA).await;
    let repo = engine.repository(&alice, "docs", Visibility::Private).await;
    let folder = resources::create_folder(&engine.state, &alice, repo, "tmp")
        .await
        .unwrap();
    uploads::start_upload(&engine.state, &alice, repo, "tmp/a.txt", 100)
        .await
        .unwrap();
    uploads::start_upload(&engine.state, &alice, repo, "tmp/b.txt", 100)
        .await
        .unwrap();

    flaky.fail_next("delete_subtree", 1);
    let stats = resources::delete_folder(&engine.state, &alice, folder.id())
        .await
        .unwrap();

    assert_eq!(stats.uploads_aborted, 2);
    assert_eq!(engine.blobs.calls(BlobOp::AbortMultipart), 2);
    assert_eq!(flaky.calls("delete_subtree"), 2);
    assert!(
        resources::list_resources(&engine.state, &alice, repo)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_repository_rename_and_visibility_retry() {
    let (engine, flaky) = TestEngine::flaky().await;
    let (_, alice) = engine.user("alice", QUOTA).await;
    let repo = engine.repository(&alice, "docs", Visibility::Private).await;

    flaky.fail_next("rename_repository", 2);
    let renamed = repositories::rename_repository(&engine.state, &alice, repo, "papers")
        .await
        .unwrap();
    assert_eq!(renamed.name, "papers");
    assert_eq!(flaky.calls("rename_repository"), 3);

    flaky.fail_next("set_visibility", 3);
    let err = repositories::set_visibility(&engine.state, &alice, repo, Visibility::Public)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "retries_exhausted");
    let unchanged = repositories::get_repository(&engine.state, &alice, repo)
        .await
        .unwrap();
    assert_eq!(unchanged.visibility().unwrap(), Visibility::Private);
}
