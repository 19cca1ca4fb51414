use super::{classify_service_error, ItemStore, StorageError};
use crate::config::{ConfigError, StorageBackend, StorageConfig};
use crate::models::{EnrichedItem, StorageKey};
use async_trait::async_trait;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};

const CONTENT_TYPE_JSON: &str = "application/json";

/// Object-store backend: one JSON document per item
pub struct S3ItemStore {
    client: S3Client,
    bucket: String,
}

impl S3ItemStore {
    /// Create a new S3 item store
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        config: &StorageConfig,
    ) -> Result<Self, ConfigError> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::MissingField("S3_BUCKET is required for the s3 backend".to_string())
            })?;

        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %bucket,
            region = %config.region,
            "S3 item store initialized"
        );

        Ok(Self { client, bucket })
    }

    /// Create from a pre-built client
    pub fn from_client(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Read a stored document back.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn fetch(&self, key: &StorageKey) -> Result<EnrichedItem, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| map_s3_error(e, key.as_str()))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Network(format!("Failed to read '{}': {}", key, e)))?;

        Ok(decode_document(&body.into_bytes())?)
    }
}

#[async_trait]
impl ItemStore for S3ItemStore {
    #[instrument(skip(self, item), fields(item_id = %item.id, bucket = %self.bucket))]
    async fn put(&self, item: &EnrichedItem) -> Result<StorageKey, StorageError> {
        let key = object_key(item);
        let body = encode_document(item)?;

        debug!(s3_key = %key, size_bytes = body.len(), "Writing item to S3");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type(CONTENT_TYPE_JSON)
            .send()
            .await
            .map_err(|e| map_s3_error(e, &key))?;

        info!(s3_key = %key, "Item stored in S3");

        Ok(StorageKey::new(key))
    }
}

/// Object path for an item: `items/{id}-{received_at}.json`.
///
/// Two items with the same id and `received_at` map to the same path; the
/// later write replaces the earlier one.
pub fn object_key(item: &EnrichedItem) -> String {
    format!("items/{}-{}.json", item.id, item.sk)
}

/// Serialize an item as the stored JSON document
pub fn encode_document(item: &EnrichedItem) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(item)
}

/// Parse a stored JSON document
pub fn decode_document(bytes: &[u8]) -> Result<EnrichedItem, serde_json::Error> {
    serde_json::from_slice(bytes)
}

fn map_s3_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!(
        "S3 request for key '{}' failed: {}",
        key,
        DisplayErrorContext(&err)
    );

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => StorageError::Network(detail),
        _ => classify_service_error(
            StorageBackend::S3,
            err.raw_response().map(|r| r.status().as_u16()),
            err.as_service_error().and_then(|e| e.code()),
            detail,
        ),
    }
}
