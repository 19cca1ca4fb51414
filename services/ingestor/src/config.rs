use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the ingestor service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for log tagging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which store enriched items are written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageBackend {
    #[default]
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "dynamodb")]
    DynamoDb,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::S3 => "s3",
            StorageBackend::DynamoDb => "dynamodb",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend selector
    #[serde(default)]
    pub backend: StorageBackend,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// S3 bucket name (required for the s3 backend)
    pub bucket: Option<String>,
    /// DynamoDB table name (required for the dynamodb backend)
    pub table: Option<String>,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "ingestor-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

/// Flat environment variable names and the nested keys they populate.
const FLAT_ENV_KEYS: &[(&str, &str)] = &[
    ("STORAGE_BACKEND", "STORAGE__BACKEND"),
    ("AWS_REGION", "STORAGE__REGION"),
    ("S3_BUCKET", "STORAGE__BUCKET"),
    ("DDB_TABLE", "STORAGE__TABLE"),
    ("LOG_LEVEL", "SERVICE__LOG_LEVEL"),
    ("SERVICE_NAME", "SERVICE__NAME"),
];

impl Config {
    /// Load configuration from config files and the process environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config/ingestor` and `/etc/ingestor/ingestor` (optional)
    /// 2. Flat variables (`STORAGE_BACKEND`, `S3_BUCKET`, `DDB_TABLE`, ...)
    /// 3. Prefixed variables (`INGESTOR__API__PORT` -> api.port)
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(std::env::vars().collect(), true)
    }

    /// Build configuration from an explicit set of variables, ignoring the
    /// process environment and config files.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(vars, false)
    }

    fn build(vars: HashMap<String, String>, with_files: bool) -> Result<Self, ConfigError> {
        let flat: HashMap<String, String> = FLAT_ENV_KEYS
            .iter()
            .filter_map(|(flat, nested)| {
                vars.get(*flat)
                    .filter(|v| !v.is_empty())
                    .map(|v| (nested.to_string(), v.clone()))
            })
            .collect();

        let mut builder = config::Config::builder();
        if with_files {
            builder = builder
                .add_source(config::File::with_name("config/ingestor").required(false))
                .add_source(config::File::with_name("/etc/ingestor/ingestor").required(false));
        }

        let config = builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .source(Some(flat)),
            )
            // INGESTOR__STORAGE__BUCKET -> storage.bucket
            .add_source(
                config::Environment::with_prefix("INGESTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("api.cors_origins")
                    .source(Some(vars)),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for the selected backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.backend {
            StorageBackend::S3 => {
                if is_blank(&self.storage.bucket) {
                    return Err(ConfigError::MissingField(
                        "S3_BUCKET is required for the s3 backend".to_string(),
                    ));
                }
            }
            StorageBackend::DynamoDb => {
                if is_blank(&self.storage.table) {
                    return Err(ConfigError::MissingField(
                        "DDB_TABLE is required for the dynamodb backend".to_string(),
                    ));
                }
            }
        }

        if self.storage.region.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.region".to_string(),
                message: "region must not be empty".to_string(),
            });
        }

        if self.api.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.port".to_string(),
                message: "port must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            region: default_region(),
            bucket: None,
            table: None,
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}
