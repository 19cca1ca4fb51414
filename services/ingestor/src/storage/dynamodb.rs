use super::{classify_service_error, ItemStore, StorageError};
use crate::config::{ConfigError, StorageBackend, StorageConfig};
use crate::models::{EnrichedItem, StorageKey};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Partition key attribute (item id)
pub const ATTR_PK: &str = "PK";
/// Sort key attribute (`sk`)
pub const ATTR_SK: &str = "SK";

/// Key-value backend: one table entry per item, partitioned by id and
/// sorted by receipt time
pub struct DynamoItemStore {
    client: DynamoClient,
    table: String,
}

impl std::fmt::Debug for DynamoItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoItemStore")
            .field("table", &self.table)
            .finish()
    }
}

impl DynamoItemStore {
    /// Create a new DynamoDB item store
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        config: &StorageConfig,
    ) -> Result<Self, ConfigError> {
        let table = config
            .table
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::MissingField(
                    "DDB_TABLE is required for the dynamodb backend".to_string(),
                )
            })?;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

        // Apply endpoint override if configured (e.g. LocalStack)
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        let client = DynamoClient::from_conf(builder.build());

        info!(
            table = %table,
            region = %config.region,
            "DynamoDB item store initialized"
        );

        Ok(Self { client, table })
    }

    /// Create from a pre-built client
    pub fn from_client(client: DynamoClient, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl ItemStore for DynamoItemStore {
    #[instrument(skip(self, item), fields(item_id = %item.id, table = %self.table))]
    async fn put(&self, item: &EnrichedItem) -> Result<StorageKey, StorageError> {
        let key = composite_key(item);
        let attributes = item_attributes(item)?;

        debug!(key = %key, attributes = attributes.len(), "Writing item to DynamoDB");

        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(attributes))
            .send()
            .await
            .map_err(|e| map_dynamodb_error(e, &key))?;

        info!(key = %key, "Item stored in DynamoDB");

        Ok(StorageKey::new(key))
    }
}

/// Composite key for an item: `PK#{id}#SK#{sk}`
pub fn composite_key(item: &EnrichedItem) -> String {
    format!("PK#{}#SK#{}", item.id, item.sk)
}

/// Every field of the item as a DynamoDB attribute, plus the `PK`/`SK` keys.
pub fn item_attributes(
    item: &EnrichedItem,
) -> Result<HashMap<String, AttributeValue>, StorageError> {
    let Value::Object(fields) = serde_json::to_value(item)? else {
        return Err(StorageError::backend(
            StorageBackend::DynamoDb,
            "enriched item did not serialize to an object",
        ));
    };

    let mut attributes: HashMap<String, AttributeValue> = fields
        .into_iter()
        .map(|(name, value)| (name, to_attribute(value)))
        .collect();

    attributes.insert(ATTR_PK.to_string(), AttributeValue::S(item.id.clone()));
    attributes.insert(ATTR_SK.to_string(), AttributeValue::S(item.sk.clone()));

    Ok(attributes)
}

/// Convert a JSON value to the matching DynamoDB attribute type.
/// Numbers keep their textual form so no precision is lost.
fn to_attribute(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s),
        Value::Array(values) => AttributeValue::L(values.into_iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.into_iter()
                .map(|(k, v)| (k, to_attribute(v)))
                .collect(),
        ),
    }
}

fn map_dynamodb_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!(
        "DynamoDB PutItem for '{}' failed: {}",
        key,
        DisplayErrorContext(&err)
    );

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => StorageError::Network(detail),
        _ => classify_service_error(
            StorageBackend::DynamoDb,
            err.raw_response().map(|r| r.status().as_u16()),
            err.as_service_error().and_then(|e| e.code()),
            detail,
        ),
    }
}
