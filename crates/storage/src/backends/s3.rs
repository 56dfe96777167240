//! S3-compatible blob store using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BlobStore, CompletedPart, MultipartCursor, MultipartEntry, ObjectEntry, Page,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, Delete, ObjectIdentifier,
};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Marker included in lazy-credentials initialization errors so we can map them
/// to actionable storage config errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "cabinet-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "cabinet-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root initialization)
/// in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

fn is_not_found<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    matches!(
        err,
        aws_sdk_s3::error::SdkError::ServiceError(service_err)
            if service_err.raw().status().as_u16() == 404
    )
}

fn presigning_config(expires_in: Duration) -> StorageResult<PresigningConfig> {
    PresigningConfig::expires_in(expires_in)
        .map_err(|e| StorageError::Config(format!("invalid presign expiry: {e}")))
}

fn to_offset(dt: &aws_sdk_s3::primitives::DateTime) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(dt.secs()).ok()
}

fn part_number_i32(part_number: u32) -> StorageResult<i32> {
    i32::try_from(part_number)
        .map_err(|_| StorageError::InvalidPart(format!("part number {part_number} out of range")))
}

/// S3-compatible blob store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`) instead of
    ///   virtual-hosted style (`bucket.endpoint/key`). Required for MinIO and some
    ///   S3-compatible services.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                None, // session token
                None, // expiration
                "cabinet-config",
            );
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region));
        }

        if let Some(endpoint_url) = endpoint.as_ref().map(|e| normalize_endpoint(e)) {
            s3_config_builder = s3_config_builder.endpoint_url(&endpoint_url);

            // Plain HTTP endpoints (local MinIO) don't need native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        // Strip trailing slashes to avoid double-slash keys like "prefix//key"
        let prefix = prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix,
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    // Bare host:port endpoints (e.g., "minio:9000") default to http
    let lower = endpoint.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

#[async_trait]
impl BlobStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_handle: &str,
        part_number: u32,
        content_length: u64,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let content_length = i64::try_from(content_length).map_err(|_| {
            StorageError::InvalidPart(format!("part length {content_length} out of range"))
        })?;

        let request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_handle)
            .part_number(part_number_i32(part_number)?)
            .content_length(content_length)
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(map_s3_operation_error)?;

        Ok(request.uri().to_string())
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_handle: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let mut completed = Vec::with_capacity(parts.len());
        for part in parts {
            completed.push(
                S3CompletedPart::builder()
                    .part_number(part_number_i32(part.part_number)?)
                    .e_tag(&part.integrity_token)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_handle)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    StorageError::UploadNotFound(upload_handle.to_string())
                } else {
                    map_s3_operation_error(e)
                }
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart(&self, key: &str, upload_handle: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_handle)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    StorageError::UploadNotFound(upload_handle.to_string())
                } else {
                    map_s3_operation_error(e)
                }
            })?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(backend = "s3", count = keys.len()))]
    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            objects.push(
                ObjectIdentifier::builder()
                    .key(self.full_key(key))
                    .build()
                    .map_err(|e| StorageError::InvalidKey(format!("{key}: {e}")))?,
            );
        }
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| StorageError::Config(format!("invalid delete request: {e}")))?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        // Quiet mode only reports failures
        if let Some(first) = output.errors().first() {
            return Err(StorageError::S3(
                format!(
                    "{} of {} deletes failed, first: {} ({})",
                    output.errors().len(),
                    keys.len(),
                    first.key().unwrap_or("<unknown>"),
                    first.message().unwrap_or("no message"),
                )
                .into(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, cursor), fields(backend = "s3"))]
    async fn list_objects(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> StorageResult<Page<ObjectEntry>> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .max_keys(limit.min(crate::traits::DEFAULT_PAGE_SIZE) as i32)
            .set_continuation_token(cursor)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let items = output
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|k| ObjectEntry {
                    key: self.strip_prefix(k),
                    last_modified: obj.last_modified().and_then(to_offset),
                })
            })
            .collect();

        let next = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(Page { items, next })
    }

    #[instrument(skip(self, cursor), fields(backend = "s3"))]
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        cursor: Option<MultipartCursor>,
        limit: usize,
    ) -> StorageResult<Page<MultipartEntry, MultipartCursor>> {
        let (key_marker, upload_id_marker) = match cursor {
            Some(c) => (Some(c.key_marker), Some(c.upload_id_marker)),
            None => (None, None),
        };

        let output = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .max_uploads(limit.min(crate::traits::DEFAULT_PAGE_SIZE) as i32)
            .set_key_marker(key_marker)
            .set_upload_id_marker(upload_id_marker)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let items = output
            .uploads()
            .iter()
            .filter_map(|upload| {
                Some(MultipartEntry {
                    key: self.strip_prefix(upload.key()?),
                    upload_handle: upload.upload_id()?.to_string(),
                    initiated: upload.initiated().and_then(to_offset),
                })
            })
            .collect();

        let next = match (
            output.is_truncated(),
            output.next_key_marker(),
            output.next_upload_id_marker(),
        ) {
            (Some(true), Some(key), Some(upload_id)) => Some(MultipartCursor {
                key_marker: key.to_string(),
                upload_id_marker: upload_id.to_string(),
            }),
            _ => None,
        };

        Ok(Page { items, next })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_get(
        &self,
        key: &str,
        content_disposition: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .response_content_disposition(content_disposition)
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(map_s3_operation_error)?;

        Ok(request.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let marker_key = self.full_key(".cabinet-health-check");

        let health_check_future = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(map_s3_operation_error(e)),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, health_check_future)
            .await
            .map_err(|_| StorageError::Timeout("S3 health check after 10 seconds".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(prefix: Option<String>) -> S3Backend {
        S3Backend::new(
            "test-bucket",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            prefix,
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn test_full_key_and_strip_prefix() {
        let backend = make_backend(Some("prefix/".to_string())).await;
        assert_eq!(backend.full_key("7/42"), "prefix/7/42");
        assert_eq!(backend.strip_prefix("prefix/7/42"), "7/42");
        assert_eq!(backend.strip_prefix("other/7/42"), "other/7/42");

        let backend = make_backend(None).await;
        assert_eq!(backend.full_key("7/42"), "7/42");
        assert_eq!(backend.strip_prefix("7/42"), "7/42");
    }

    #[tokio::test]
    async fn test_presign_upload_part_carries_upload_and_part() {
        let backend = make_backend(None).await;
        let url = backend
            .presign_upload_part("7/42", "abc123", 3, 6_000_000, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(url.starts_with("http://s3.test/test-bucket/7/42?"), "{url}");
        assert!(url.contains("partNumber=3"), "{url}");
        assert!(url.contains("uploadId=abc123"), "{url}");
        assert!(url.contains("X-Amz-Expires=3600"), "{url}");
    }

    #[tokio::test]
    async fn test_presign_get_sets_content_disposition() {
        let backend = make_backend(Some("tenant".to_string())).await;
        let url = backend
            .presign_get(
                "7/42",
                "attachment; filename=\"download\"",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(url.contains("/tenant/7/42?"), "{url}");
        assert!(url.contains("response-content-disposition="), "{url}");
        assert!(url.contains("X-Amz-Expires=60"), "{url}");
    }

    #[tokio::test]
    async fn test_presign_rejects_expiry_beyond_a_week() {
        let backend = make_backend(None).await;
        let err = backend
            .presign_get("7/42", "attachment", Duration::from_secs(8 * 24 * 3600))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_s3_new_requires_complete_credentials() {
        let err = S3Backend::new(
            "bucket",
            None,
            Some("us-east-1".to_string()),
            None,
            Some("access".to_string()),
            None,
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("minio:9000"), "http://minio:9000");
        assert_eq!(normalize_endpoint("https://s3.local"), "https://s3.local");
        assert_eq!(normalize_endpoint("HTTP://s3.local"), "HTTP://s3.local");
    }
}
