//! Multipart part acknowledgements.

use crate::error::MetadataResult;
use crate::models::PartRow;
use async_trait::async_trait;
use cabinet_core::{ResourceId, UserId};

/// Repository for acknowledged upload parts.
#[async_trait]
pub trait PartRepo: Send + Sync {
    /// Record an acknowledged part.
    ///
    /// The actor must be the uploader, the upload must be in progress and the
    /// part number must belong to the size-derived partition. A part that is
    /// already recorded fails with already-exists.
    async fn record_part(
        &self,
        actor: UserId,
        resource_id: ResourceId,
        part_number: u32,
        integrity_token: &str,
    ) -> MetadataResult<PartRow>;

    /// Acknowledged parts ordered by part number.
    async fn list_parts(&self, resource_id: ResourceId) -> MetadataResult<Vec<PartRow>>;
}
