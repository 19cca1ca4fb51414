//! Ingestor Service
//!
//! Batch JSON ingestion endpoint. Each request carries a list of items; the
//! service validates the whole batch, enriches every item with derived fields
//! and writes it to the configured store, either one JSON object per item in
//! S3 or one entry per item in a DynamoDB table.
//!
//! ## Features
//!
//! - **Batch validation**: every violation in a request is reported with its
//!   location, and nothing is written unless the whole batch is valid
//! - **Enrichment**: slug, uppercase name, doubled value and a server-side
//!   receipt timestamp that doubles as the DynamoDB sort key
//! - **Pluggable storage**: S3 or DynamoDB behind one [`ItemStore`] trait,
//!   selected once at startup
//! - **Request correlation**: `X-Request-ID` is echoed on every response and
//!   attached to every log line of the request
//!
//! ## Architecture
//!
//! ```text
//! POST /ingest
//!      │
//!      ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Validation   │──▶│ Transform    │──▶│ ItemStore    │
//! │ (whole batch)│   │ (per item)   │   │ put()        │
//! └──────────────┘   └──────────────┘   └──────────────┘
//!                                          │        │
//!                                          ▼        ▼
//!                                   ┌──────────┐ ┌──────────┐
//!                                   │ S3       │ │ DynamoDB │
//!                                   │ items/   │ │ PK / SK  │
//!                                   └──────────┘ └──────────┘
//! ```

pub mod api;
pub mod config;
pub mod ingest;
pub mod models;
pub mod storage;
pub mod transform;
pub mod validation;

pub use api::{create_router, AppState};
pub use config::{Config, ConfigError, StorageBackend};
pub use ingest::{Ingestor, PartialWriteError, RequestContext};
pub use models::{EnrichedItem, IngestItem, IngestSummary, StorageKey};
pub use storage::{build_store, DynamoItemStore, ItemStore, S3ItemStore, StorageError};
pub use transform::{slugify, transform_item, Clock, SystemClock};
pub use validation::{parse_batch, FieldError, ValidationErrors};
