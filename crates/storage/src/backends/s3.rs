//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult, is_transient_status};
use crate::traits::{CompletedPart, MultipartId, ObjectMeta, ObjectStore, PartReceipt, PutOptions};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use tarlift_core::config::{StorageClass, StorageConfig};
use tarlift_core::hash::{Digest, DigestAlgorithm, RemoteDigest};
use tokio::sync::OnceCell;
use tracing::instrument;

/// Marker included in lazy-credentials initialization errors so we can map them
/// to actionable storage config errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "tarlift-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "tarlift-s3-lazy-credentials-resolve";

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

/// Classify an S3 service error response.
fn classify_service_failure(status: u16, code: Option<&str>, message: String) -> StorageError {
    match code {
        Some("NoSuchUpload") => return StorageError::NoSuchUpload(message),
        Some("InvalidPart") | Some("InvalidPartOrder") | Some("EntityTooSmall") => {
            return StorageError::InvalidPart(message);
        }
        Some("BadDigest") | Some("InvalidDigest") => {
            return StorageError::DigestMismatch {
                expected: "Content-MD5".to_string(),
                actual: message,
            };
        }
        Some("RequestTimeout") | Some("SlowDown") | Some("InternalError") => {
            return StorageError::Transient(message);
        }
        _ => {}
    }

    if status == 404 {
        return StorageError::NotFound(message);
    }
    if is_transient_status(status) {
        return StorageError::Transient(format!("status {status}: {message}"));
    }
    StorageError::Rejected { status, message }
}

/// Convert an AWS SDK error to a classified StorageError.
fn map_s3_operation_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let err_text = DisplayErrorContext(&err).to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    if let SdkError::ServiceError(service_err) = &err {
        let status = service_err.raw().status().as_u16();
        let inner = service_err.err();
        let message = match inner.message() {
            Some(message) => format!("{key}: {message}"),
            None => key.to_string(),
        };
        return classify_service_failure(status, inner.code(), message);
    }

    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(err_text)
        }
        SdkError::ConstructionFailure(_) => StorageError::Config(err_text),
        other => StorageError::S3(Box::new(other)),
    }
}

fn sdk_storage_class(class: StorageClass) -> aws_sdk_s3::types::StorageClass {
    match class {
        StorageClass::Standard => aws_sdk_s3::types::StorageClass::Standard,
        StorageClass::ReducedRedundancy => aws_sdk_s3::types::StorageClass::ReducedRedundancy,
        StorageClass::StandardIa => aws_sdk_s3::types::StorageClass::StandardIa,
    }
}

/// Content-MD5 header value, when the digest is an MD5.
fn content_md5(digest: &Digest) -> Option<String> {
    (digest.algorithm() == DigestAlgorithm::Md5).then(|| digest.to_base64())
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Normalized endpoint, for logging.
    endpoint: String,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// No request is made here; credentials from the default chain are
    /// resolved on the first signed request.
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        config
            .validate()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        // Build S3 client config directly and defer ambient credentials chain
        // initialization until first signed request.
        let resolved_region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                None, // session token
                None, // expiration
                "tarlift-config",
            );
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        let normalized_endpoint = config.endpoint.as_ref().map(|endpoint_url| {
            // Handle bare host:port endpoints (e.g., "minio:9000") by prepending http://
            let endpoint_lower = endpoint_url.to_lowercase();
            if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
                endpoint_url.clone()
            } else {
                format!("http://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // For explicit HTTP endpoints (e.g. local MinIO), use an HTTP-only client
            // so SDK initialization doesn't depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        let endpoint = match &normalized_endpoint {
            Some(url) => url.clone(),
            None => format!("s3.{resolved_region}.amazonaws.com"),
        };

        // Normalize prefix: strip slashes to avoid double-slash keys like "prefix//key"
        let prefix = config
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Ok(Self {
            client,
            bucket: config.bucket_name().to_string(),
            prefix,
            endpoint,
            region: resolved_region,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self, data, digest, options), fields(backend = "s3", size = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        digest: &Digest,
        options: &PutOptions,
    ) -> StorageResult<RemoteDigest> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .storage_class(sdk_storage_class(options.storage_class))
            .set_content_type(options.content_type.clone())
            .set_content_md5(content_md5(digest))
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_s3_operation_error(e, key))?;

        let etag = output.e_tag().unwrap_or_default();
        Ok(RemoteDigest::from_etag(digest.algorithm(), etag))
    }

    #[instrument(skip(self, options), fields(backend = "s3"))]
    async fn create_multipart(
        &self,
        key: &str,
        options: &PutOptions,
    ) -> StorageResult<MultipartId> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .storage_class(sdk_storage_class(options.storage_class))
            .set_content_type(options.content_type.clone())
            .send()
            .await
            .map_err(|e| map_s3_operation_error(e, key))?;

        let upload_id = output.upload_id().ok_or_else(|| {
            StorageError::S3("S3 did not return upload_id for multipart upload".into())
        })?;
        tracing::debug!(key = %key, upload_id = %upload_id, "Opened multipart upload");
        Ok(MultipartId(upload_id.to_string()))
    }

    #[instrument(skip(self, data, digest), fields(backend = "s3", size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload: &MultipartId,
        part_number: u32,
        data: Bytes,
        digest: &Digest,
    ) -> StorageResult<PartReceipt> {
        let full_key = self.full_key(key);
        let part_number_i32 = i32::try_from(part_number)
            .map_err(|_| StorageError::InvalidPart(format!("part number {part_number}")))?;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(upload.as_str())
            .part_number(part_number_i32)
            .set_content_md5(content_md5(digest))
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_s3_operation_error(e, key))?;

        let etag = output.e_tag().ok_or_else(|| {
            StorageError::S3(format!("S3 did not return an ETag for part {part_number}").into())
        })?;

        Ok(PartReceipt {
            part_number,
            etag: etag.to_string(),
        })
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload: &MultipartId,
        parts: &[CompletedPart],
    ) -> StorageResult<RemoteDigest> {
        let full_key = self.full_key(key);
        let mut completed = Vec::with_capacity(parts.len());
        for part in parts {
            let part_number = i32::try_from(part.part_number).map_err(|_| {
                StorageError::InvalidPart(format!("part number {}", part.part_number))
            })?;
            completed.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part_number)
                    .build(),
            );
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(upload.as_str())
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| map_s3_operation_error(e, key))?;

        let etag = output.e_tag().unwrap_or_default();
        Ok(RemoteDigest::from_etag(self.digest_algorithm(), etag))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart(&self, key: &str, upload: &MultipartId) -> StorageResult<()> {
        let full_key = self.full_key(key);
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(upload.as_str())
            .send()
            .await
            .map_err(|e| map_s3_operation_error(e, key))
        {
            Ok(_) | Err(StorageError::NoSuchUpload(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_parts(
        &self,
        key: &str,
        upload: &MultipartId,
    ) -> StorageResult<Vec<CompletedPart>> {
        let full_key = self.full_key(key);
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&full_key)
                .upload_id(upload.as_str())
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| map_s3_operation_error(e, key))?;

            for part in output.parts() {
                if let (Some(number), Some(etag)) = (part.part_number(), part.e_tag())
                    && let Ok(part_number) = u32::try_from(number)
                {
                    parts.push(CompletedPart {
                        part_number,
                        etag: etag.to_string(),
                    });
                }
            }

            if output.is_truncated() == Some(true)
                && let Some(next) = output.next_part_number_marker()
            {
                marker = Some(next.to_string());
            } else {
                break;
            }
        }

        Ok(parts)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| map_s3_operation_error(e, key))?;

        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(
                        key = %key,
                        timestamp = dt.secs(),
                        error = %e,
                        "Failed to convert S3 timestamp"
                    );
                })
                .ok()
        });

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            digest: RemoteDigest::from_etag(
                self.digest_algorithm(),
                output.e_tag().unwrap_or_default(),
            ),
            storage_class: output.storage_class().map(|c| c.as_str().to_string()),
            last_modified,
        })
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn target_id(&self, key: &str) -> String {
        let host = self.endpoint.rsplit("://").next().unwrap_or(&self.endpoint);
        format!("s3://{host}/{}/{}", self.bucket, self.full_key(key))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

        let request = self.client.head_bucket().bucket(&self.bucket).send();
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, request)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
            .map_err(|e| map_s3_operation_error(e, &self.bucket))?;
        Ok(())
    }
}
