//! PostgreSQL integration tests using testcontainers.
//!
//! These run the lifecycle against real serializable transactions, where
//! concurrent writers abort instead of queueing. They require Docker to be
//! running. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use cabinet_core::{Role, Visibility};
use cabinet_metadata::MetadataError;
use cabinet_server::lifecycle::{accounts, repositories, resources, uploads};
use cabinet_server::{AppState, RequestContext, run_sweep};
use cabinet_storage::{BlobStore, MemoryBackend};
use common::{PostgresTestMetadata, postgres_or_skip, sweep_config, test_config};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const MB: u64 = 1_000_000;

struct PostgresEngine {
    state: AppState,
    blobs: Arc<MemoryBackend>,
    metadata: PostgresTestMetadata,
}

impl PostgresEngine {
    /// Wire application state to a fresh container, or `None` when Docker
    /// is unavailable.
    async fn start(retry_max_attempts: u32) -> Option<Self> {
        let metadata = postgres_or_skip().await?;
        let blobs = Arc::new(MemoryBackend::new());
        let mut config = test_config();
        config.engine.retry_max_attempts = retry_max_attempts;
        let state = AppState::new(
            config,
            metadata.store(),
            blobs.clone() as Arc<dyn BlobStore>,
        );
        Some(Self {
            state,
            blobs,
            metadata,
        })
    }

    async fn user(&self, name: &str, quota: i64) -> RequestContext {
        let user = accounts::create_user(&self.state, name, Role::User, Some(quota))
            .await
            .expect("Failed to create user");
        RequestContext::user(user.id())
    }
}

#[tokio::test]
async fn test_postgres_upload_lifecycle() {
    let Some(engine) = PostgresEngine::start(3).await else {
        return;
    };
    let state = &engine.state;
    let alice = engine.user("alice", 1_000_000_000).await;
    let repo = repositories::create_repository(state, &alice, "docs", Visibility::Public)
        .await
        .unwrap()
        .id();

    let folder = resources::create_folder(state, &alice, repo, "reports")
        .await
        .unwrap();
    let ticket = uploads::start_upload(state, &alice, repo, "reports/q3.bin", 25 * MB)
        .await
        .unwrap();
    assert!(ticket.partition.part_count > 1);

    for target in &ticket.part_targets {
        uploads::acknowledge_part(
            state,
            &alice,
            ticket.file_id,
            target.part_number,
            &common::etag(target.part_number),
        )
        .await
        .unwrap();
    }
    let file = uploads::complete_upload(state, &alice, ticket.file_id)
        .await
        .unwrap();
    assert!(file.upload_completed_at.is_some());

    let rewrites = resources::rename_folder(state, &alice, folder.id(), "archive")
        .await
        .unwrap();
    assert_eq!(rewrites.len(), 2);
    let renamed = resources::get_resource(state, &RequestContext::anonymous(), ticket.file_id)
        .await
        .unwrap();
    assert_eq!(renamed.path, "archive/q3.bin");

    let url = resources::get_download(state, &RequestContext::anonymous(), ticket.file_id)
        .await
        .unwrap();
    assert!(url.contains(&file.blob_key()));

    let stats = resources::delete_folder(state, &alice, folder.id())
        .await
        .unwrap();
    assert_eq!(stats.objects_deleted, 1);
    assert!(engine.blobs.object_keys().is_empty());
    assert!(
        resources::list_resources(state, &alice, repo)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_quota_race_never_overcommits() {
    let Some(engine) = PostgresEngine::start(20).await else {
        return;
    };
    let alice = engine.user("alice", (25 * MB) as i64).await;
    let repo = repositories::create_repository(&engine.state, &alice, "docs", Visibility::Private)
        .await
        .unwrap()
        .id();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let state = engine.state.clone();
            let ctx = alice.clone();
            tokio::spawn(async move {
                uploads::start_upload(&state, &ctx, repo, &format!("f{i}.bin"), 10 * MB).await
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(err) => assert!(
                matches!(err.code(), "quota_exceeded" | "retries_exhausted"),
                "unexpected error: {err}"
            ),
        }
    }

    assert!((1..=2).contains(&admitted), "admitted {admitted}");
    let user_id = alice.actor.unwrap();
    let consumed = accounts::consumed_space(&engine.state, &alice, user_id)
        .await
        .unwrap();
    assert_eq!(consumed, admitted * (10 * MB) as i64);
    assert!(consumed <= (25 * MB) as i64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_same_path_is_admitted_once() {
    let Some(engine) = PostgresEngine::start(20).await else {
        return;
    };
    let alice = engine.user("alice", 1_000_000_000).await;
    let repo = repositories::create_repository(&engine.state, &alice, "docs", Visibility::Private)
        .await
        .unwrap()
        .id();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let state = engine.state.clone();
            let ctx = alice.clone();
            tokio::spawn(async move { resources::create_folder(&state, &ctx, repo, "shared").await })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(err) => assert_eq!(err.code(), "already_exists", "unexpected error: {err}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(
        resources::list_resources(&engine.state, &alice, repo)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_postgres_write_skew_is_classified_retryable() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let pool = metadata.pool();

    // Two transactions each read the whole table, then insert a row the other
    // would have seen. Serializable isolation must abort one of them.
    let mut first = pool.begin().await.unwrap();
    let mut second = pool.begin().await.unwrap();
    for tx in [&mut first, &mut second] {
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut **tx)
            .await
            .unwrap();
        let _: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&mut **tx)
            .await
            .unwrap();
    }

    const INSERT: &str =
        "INSERT INTO users (username, role, space_quota, created_at) VALUES ($1, 'user', 0, $2)";
    let now = OffsetDateTime::now_utc();
    sqlx::query(INSERT)
        .bind("left")
        .bind(now)
        .execute(&mut *first)
        .await
        .unwrap();

    // The conflict may surface at the insert or at commit
    let losing = async {
        sqlx::query(INSERT)
            .bind("right")
            .bind(now)
            .execute(&mut *second)
            .await?;
        first.commit().await?;
        second.commit().await
    }
    .await;

    let err = MetadataError::from(losing.unwrap_err());
    assert!(err.is_serialization_failure(), "unexpected error: {err}");
    assert!(!err.is_unique_violation());
}

#[tokio::test]
async fn test_postgres_sweep_removes_stale_upload() {
    let Some(engine) = PostgresEngine::start(3).await else {
        return;
    };
    let alice = engine.user("alice", 1_000_000_000).await;
    let repo = repositories::create_repository(&engine.state, &alice, "docs", Visibility::Private)
        .await
        .unwrap()
        .id();
    let ticket = uploads::start_upload(&engine.state, &alice, repo, "old.bin", 100)
        .await
        .unwrap();

    sqlx::query("UPDATE resources SET created_at = $1 WHERE resource_id = $2")
        .bind(OffsetDateTime::now_utc() - Duration::days(8))
        .bind(ticket.file_id.get())
        .execute(engine.metadata.pool())
        .await
        .unwrap();

    let stats = run_sweep(&engine.state, &sweep_config()).await.unwrap();
    assert_eq!(stats.stale_uploads_removed, 1);
    assert!(engine.blobs.open_uploads().is_empty());
    assert!(
        engine
            .metadata
            .store()
            .get_resource(ticket.file_id)
            .await
            .unwrap()
            .is_none()
    );
}
