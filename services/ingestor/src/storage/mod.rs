//! Persistence of enriched items.
//!
//! Both backends implement [`ItemStore`]; which one is used is decided once at
//! startup by [`StorageBackend`]. Writes are a direct pass-through to the
//! managed store: no retries beyond the SDK defaults, no batching.

pub mod dynamodb;
pub mod s3;

use crate::config::{ConfigError, StorageBackend, StorageConfig};
use crate::models::{EnrichedItem, StorageKey};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use dynamodb::DynamoItemStore;
pub use s3::S3ItemStore;

/// Errors from a single storage write
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to serialize item: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("{backend} error: {message}")]
    Backend {
        backend: StorageBackend,
        message: String,
    },
}

impl StorageError {
    pub fn backend(backend: StorageBackend, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Whether the store rejected the write for capacity reasons
    pub fn is_throttled(&self) -> bool {
        matches!(self, StorageError::Throttled(_))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Serialization(_) => "serialization",
            StorageError::AccessDenied(_) => "access_denied",
            StorageError::NotFound(_) => "not_found",
            StorageError::Throttled(_) => "throttled",
            StorageError::Network(_) => "network",
            StorageError::Backend { .. } => "backend",
        }
    }
}

/// A store that persists one enriched item and reports where it went.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn put(&self, item: &EnrichedItem) -> Result<StorageKey, StorageError>;
}

/// Load the shared AWS SDK configuration for the configured region.
async fn load_sdk_config(config: &StorageConfig) -> aws_config::SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await
}

/// Build the store selected by `config.backend`.
pub async fn build_store(config: &StorageConfig) -> Result<Arc<dyn ItemStore>, ConfigError> {
    let sdk_config = load_sdk_config(config).await;

    let store: Arc<dyn ItemStore> = match config.backend {
        StorageBackend::S3 => Arc::new(S3ItemStore::new(&sdk_config, config)?),
        StorageBackend::DynamoDb => Arc::new(DynamoItemStore::new(&sdk_config, config)?),
    };

    info!(
        backend = %config.backend,
        region = %config.region,
        "Storage backend initialized"
    );

    Ok(store)
}

/// Map an HTTP status and service error code onto a [`StorageError`].
///
/// Shared by both backends; each passes whatever the SDK exposed.
pub(crate) fn classify_service_error(
    backend: StorageBackend,
    status: Option<u16>,
    code: Option<&str>,
    detail: String,
) -> StorageError {
    match (status, code) {
        (
            _,
            Some(
                "ThrottlingException"
                | "ProvisionedThroughputExceededException"
                | "RequestLimitExceeded"
                | "SlowDown",
            ),
        )
        | (Some(429) | Some(503), _) => StorageError::Throttled(detail),
        (_, Some("AccessDenied" | "AccessDeniedException" | "UnrecognizedClientException"))
        | (Some(401) | Some(403), _) => StorageError::AccessDenied(detail),
        (_, Some("NoSuchBucket" | "ResourceNotFoundException")) | (Some(404), _) => {
            StorageError::NotFound(detail)
        }
        _ => StorageError::backend(backend, detail),
    }
}
