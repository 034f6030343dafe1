//! Configuration module for kumofs
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and comprehensive validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Smallest chunk the resumable protocol accepts for non-final requests (256 KiB)
pub const MIN_CHUNK_SIZE: usize = 256 * 1024;

/// Largest payload sent in a single request (100 MiB)
pub const MAX_REQUEST_SIZE: usize = 100 * 1024 * 1024;

/// Most sub-requests a single batch call may carry
pub const MAX_DELETE_BATCH_SIZE: usize = 100;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

fn deserialize_option_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|v| expand_env_vars(&v)).filter(|v| !v.is_empty()))
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        ConfigLoader::parse(content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.storage.endpoint) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid storage endpoint '{}': must start with http:// or https://",
                self.storage.endpoint
            )));
        }

        if self.storage.requester_pays && self.storage.project.is_none() {
            return Err(ConfigError::ValidationError(
                "requester_pays requires a project to bill".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.transfer.block_size == 0 {
            return Err(ConfigError::ValidationError(
                "transfer.block_size must be greater than zero".into(),
            ));
        }

        if self.transfer.max_request_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "transfer.max_request_size must be at least {} bytes",
                MIN_CHUNK_SIZE
            )));
        }

        match self.transfer.consistency.as_str() {
            "none" | "size" | "md5" | "crc32c" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid consistency '{}': must be 'none', 'size', 'md5' or 'crc32c'",
                    other
                )))
            }
        }

        if self.batch.delete_batch_size == 0 || self.batch.delete_batch_size > MAX_DELETE_BATCH_SIZE
        {
            return Err(ConfigError::ValidationError(format!(
                "batch.delete_batch_size must be between 1 and {}",
                MAX_DELETE_BATCH_SIZE
            )));
        }

        if self.batch.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "batch.max_concurrency must be at least 1".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level '{}'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Backend endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_endpoint", deserialize_with = "deserialize_with_env")]
    pub endpoint: String,
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub project: Option<String>,
    #[serde(default)]
    pub requester_pays: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            project: None,
            requester_pays: false,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl StorageConfig {
    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Project billed for requester-pays buckets, if configured
    pub fn user_project(&self) -> Option<&str> {
        if self.requester_pays {
            self.project.as_deref()
        } else {
            None
        }
    }
}

fn default_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_timeout_seconds() -> u64 {
    60
}

/// Directory listing cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_use_listings_cache")]
    pub use_listings_cache: bool,
    /// `None` caches until invalidated, `Some(0)` disables caching
    #[serde(default)]
    pub listings_expiry_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_listings_cache: default_use_listings_cache(),
            listings_expiry_seconds: None,
        }
    }
}

impl CacheConfig {
    /// Effective time-to-live for cached listings
    pub fn ttl(&self) -> Option<Duration> {
        if !self.use_listings_cache {
            return Some(Duration::ZERO);
        }
        self.listings_expiry_seconds.map(Duration::from_secs)
    }
}

fn default_use_listings_cache() -> bool {
    true
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_unit_millis")]
    pub backoff_unit_millis: u64,
    #[serde(default = "default_max_backoff_units")]
    pub max_backoff_units: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_unit_millis: default_backoff_unit_millis(),
            max_backoff_units: default_max_backoff_units(),
        }
    }
}

fn default_max_attempts() -> usize {
    6
}

fn default_backoff_unit_millis() -> u64 {
    1000
}

fn default_max_backoff_units() -> f64 {
    32.0
}

/// Read and write transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_block_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_consistency")]
    pub consistency: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            chunk_size: default_block_size(),
            max_request_size: default_max_request_size(),
            consistency: default_consistency(),
        }
    }
}

impl TransferConfig {
    /// Upload chunk size: at least 256 KiB, aligned to 256 KiB, at most
    /// `max_request_size`
    pub fn effective_chunk_size(&self) -> usize {
        let capped = self.chunk_size.min(self.max_request_size);
        let aligned = capped - capped % MIN_CHUNK_SIZE;
        aligned.max(MIN_CHUNK_SIZE)
    }
}

fn default_block_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_request_size() -> usize {
    MAX_REQUEST_SIZE
}

fn default_consistency() -> String {
    "none".to_string()
}

/// Batch operation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            delete_batch_size: default_delete_batch_size(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_delete_batch_size() -> usize {
    20
}

fn default_max_concurrency() -> usize {
    32
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
