//! Queries used by the reconciliation sweep.

use crate::error::MetadataResult;
use crate::models::ResourceRow;
use async_trait::async_trait;
use time::OffsetDateTime;

#[async_trait]
pub trait ReconcileRepo: Send + Sync {
    /// In-progress uploads created before `created_before`, oldest first.
    async fn stale_uploads(
        &self,
        created_before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ResourceRow>>;

    /// Look up many resources at once. Missing IDs are simply absent.
    async fn resources_by_ids(&self, resource_ids: &[i64]) -> MetadataResult<Vec<ResourceRow>>;
}
