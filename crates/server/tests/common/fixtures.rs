//! Engine fixtures: application state over SQLite and an in-memory blob store.

use super::flaky::FlakyMetadata;
use super::metadata::TestMetadata;
use cabinet_core::config::{AppConfig, SweepConfig};
use cabinet_core::{RepositoryId, Role, UserId, Visibility};
use cabinet_metadata::MetadataStore;
use cabinet_metadata::models::ResourceRow;
use cabinet_server::lifecycle::{accounts, repositories, uploads};
use cabinet_server::{AppState, RequestContext, UploadTicket};
use cabinet_storage::{BlobStore, MemoryBackend};
use std::sync::Arc;
use time::OffsetDateTime;

/// Synthetic integrity token for a part, shaped like an S3 ETag.
#[allow(dead_code)]
pub fn etag(part_number: u32) -> String {
    format!("\"etag-{part_number}\"")
}

/// Application configuration for tests. Stores are injected, so only the
/// engine section matters.
#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.blob_timeout_ms = 1_000;
    config
}

/// Sweep settings with the default thresholds, sized for tests.
#[allow(dead_code)]
pub fn sweep_config() -> SweepConfig {
    SweepConfig {
        enabled: false,
        batch_size: 100,
        ..SweepConfig::default()
    }
}

/// Application state wired to a recording blob store.
#[allow(dead_code)]
pub struct TestEngine {
    pub state: AppState,
    pub blobs: Arc<MemoryBackend>,
    pub metadata: TestMetadata,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn new() -> Self {
        let metadata = TestMetadata::new()
            .await
            .expect("Failed to create metadata");
        let store = metadata.store();
        Self::assemble(metadata, store)
    }

    /// Route metadata calls through a fault-injecting wrapper.
    pub async fn flaky() -> (Self, Arc<FlakyMetadata>) {
        let metadata = TestMetadata::new()
            .await
            .expect("Failed to create metadata");
        let flaky = Arc::new(FlakyMetadata::new(metadata.store()));
        let engine = Self::assemble(metadata, flaky.clone());
        (engine, flaky)
    }

    fn assemble(metadata: TestMetadata, store: Arc<dyn MetadataStore>) -> Self {
        let blobs = Arc::new(MemoryBackend::new());
        let config = test_config();
        let state = AppState::new(config, store, blobs.clone() as Arc<dyn BlobStore>);
        Self {
            state,
            blobs,
            metadata,
        }
    }

    /// Provision a user and return a context acting as them.
    pub async fn user(&self, name: &str, quota: i64) -> (UserId, RequestContext) {
        let user = accounts::create_user(&self.state, name, Role::User, Some(quota))
            .await
            .expect("Failed to create user");
        (user.id(), RequestContext::user(user.id()))
    }

    pub async fn repository(
        &self,
        ctx: &RequestContext,
        name: &str,
        visibility: Visibility,
    ) -> RepositoryId {
        repositories::create_repository(&self.state, ctx, name, visibility)
            .await
            .expect("Failed to create repository")
            .id()
    }

    /// Acknowledge every part of a ticket.
    pub async fn acknowledge_all(&self, ctx: &RequestContext, ticket: &UploadTicket) {
        for target in &ticket.part_targets {
            uploads::acknowledge_part(
                &self.state,
                ctx,
                ticket.file_id,
                target.part_number,
                &etag(target.part_number),
            )
            .await
            .expect("Failed to acknowledge part");
        }
    }

    /// Start, acknowledge and complete an upload.
    pub async fn upload(
        &self,
        ctx: &RequestContext,
        repository_id: RepositoryId,
        path: &str,
        size: u64,
    ) -> ResourceRow {
        let ticket = uploads::start_upload(&self.state, ctx, repository_id, path, size)
            .await
            .expect("Failed to start upload");
        self.acknowledge_all(ctx, &ticket).await;
        uploads::complete_upload(&self.state, ctx, ticket.file_id)
            .await
            .expect("Failed to complete upload")
    }

    /// Move a record's creation time into the past.
    pub async fn backdate(&self, resource_id: i64, created_at: OffsetDateTime) {
        sqlx::query("UPDATE resources SET created_at = ? WHERE resource_id = ?")
            .bind(created_at)
            .bind(resource_id)
            .execute(self.metadata.pool())
            .await
            .expect("Failed to backdate resource");
    }
}
