use crate::models::{IngestItem, IngestSummary, StorageKey};
use crate::storage::{ItemStore, StorageError};
use crate::transform::{enrich, Clock};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Per-request context carried explicitly through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller-supplied or generated correlation id
    pub request_id: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

/// A storage write failed part way through a batch.
///
/// Writes that completed before the failure are not rolled back; their keys
/// are reported here.
#[derive(Debug, Error)]
#[error("storage write failed for item {failed_id} after {stored} item(s) were stored: {source}")]
pub struct PartialWriteError {
    /// Number of items persisted before the failure
    pub stored: usize,
    /// Keys of the persisted items, in input order
    pub keys: Vec<StorageKey>,
    /// Id of the item whose write failed
    pub failed_id: String,
    #[source]
    pub source: StorageError,
}

/// Transforms and persists validated batches
pub struct Ingestor {
    store: Arc<dyn ItemStore>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn ItemStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Transform and store each item in order.
    ///
    /// Stops at the first storage failure; the remaining items are not
    /// attempted.
    #[instrument(skip(self, items, ctx), fields(request_id = %ctx.request_id, items = items.len()))]
    pub async fn ingest(
        &self,
        items: Vec<IngestItem>,
        ctx: &RequestContext,
    ) -> Result<IngestSummary, PartialWriteError> {
        let mut keys = Vec::with_capacity(items.len());

        for item in items {
            let enriched = enrich(item, self.clock.as_ref());

            let started = Instant::now();
            let result = self.store.put(&enriched).await;
            histogram!("ingest_storage_put_seconds").record(started.elapsed().as_secs_f64());

            match result {
                Ok(key) => {
                    counter!("ingest_items_stored_total").increment(1);
                    keys.push(key);
                }
                Err(e) => {
                    counter!("ingest_storage_errors_total", "kind" => e.kind()).increment(1);
                    error!(
                        request_id = %ctx.request_id,
                        item_id = %enriched.id,
                        stored = keys.len(),
                        error = %e,
                        "Storage write failed; aborting remainder of batch"
                    );
                    return Err(PartialWriteError {
                        stored: keys.len(),
                        keys,
                        failed_id: enriched.id,
                        source: e,
                    });
                }
            }
        }

        info!(
            request_id = %ctx.request_id,
            stored = keys.len(),
            "Batch ingested"
        );

        Ok(IngestSummary {
            stored: keys.len(),
            keys,
        })
    }
}
