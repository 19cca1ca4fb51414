use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated inbound item, built by [`crate::validation::parse_batch`]
#[derive(Debug, Clone, PartialEq)]
pub struct IngestItem {
    /// Caller-supplied identifier
    pub id: String,
    /// Free-text name
    pub name: String,
    /// Numeric value
    pub value: f64,
    /// Optional caller-supplied timestamp
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-form metadata
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// An item after enrichment, as persisted by every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedItem {
    pub id: String,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// URL-safe form of `name`
    pub slug: String,
    /// Uppercase form of `name`
    pub name_upper: String,
    /// `value * 2`
    pub value_times_two: f64,
    /// Server time at transform, microsecond precision
    #[serde(with = "micros_rfc3339")]
    pub received_at: DateTime<Utc>,
    /// Sort key; always equal to the rendered `received_at`
    pub sk: String,
}

/// Where a record was persisted. Opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a fully stored batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub stored: usize,
    pub keys: Vec<StorageKey>,
}

/// Render a timestamp as fixed-width RFC 3339 with microseconds,
/// e.g. `2024-01-15T10:30:45.000123Z`. Lexicographic order matches time order.
pub fn format_micros(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Serde adapter keeping `received_at` in the same rendering as `sk`.
pub mod micros_rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_micros(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}
