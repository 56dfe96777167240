//! Shared fixtures for storage tests.

use cabinet_core::config::EngineConfig;
use cabinet_storage::{BlobStore, CompletedPart, PartTarget, UploadCoordinator};
use std::sync::Arc;

/// Engine settings with short call timeouts.
#[allow(dead_code)]
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        blob_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

#[allow(dead_code)]
pub fn coordinator(store: Arc<dyn BlobStore>) -> UploadCoordinator {
    UploadCoordinator::new(store, &test_engine_config())
}

/// Pretend every target was uploaded and acknowledged with a synthetic tag.
#[allow(dead_code)]
pub fn acknowledge(targets: &[PartTarget]) -> Vec<CompletedPart> {
    targets
        .iter()
        .map(|t| CompletedPart {
            part_number: t.part_number,
            integrity_token: format!("\"etag-{}\"", t.part_number),
        })
        .collect()
}
