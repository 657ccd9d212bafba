//! Configuration management for the uploader.
//!
//! Endpoints, account identity and transfer tuning are loaded once at the
//! process entry point and passed down explicitly.

use capture_sequencer::AnomalyConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// 2 MiB
pub const MIN_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
/// 16 MiB
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Main configuration for the uploader.
#[derive(Debug, Clone, Deserialize)]
pub struct UploaderConfig {
    /// Remote endpoints
    #[serde(default)]
    pub api: ApiConfig,

    /// Account and project scoping
    #[serde(default)]
    pub account: AccountConfig,

    /// Chunked transfer tuning
    #[serde(default)]
    pub upload: UploadConfig,

    /// Local directories
    #[serde(default)]
    pub storage: StorageConfig,

    /// Plausibility checks re-run before upload
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Chunked archive upload endpoint
    #[serde(default = "default_upload_endpoint")]
    pub upload_endpoint: String,

    /// Sequence description endpoint
    #[serde(default = "default_description_endpoint")]
    pub description_endpoint: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Account identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountConfig {
    /// Account email sent with every chunk
    #[serde(default)]
    pub email: String,

    /// Bearer token for the description endpoint
    #[serde(default)]
    pub token: String,

    /// Name of the per-account backup directory, defaults to the email
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub organization_key: Option<String>,

    #[serde(default)]
    pub project_key: Option<String>,
}

/// Chunked transfer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Smallest chunk in bytes
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,

    /// Largest chunk in bytes
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Consecutive retryable failures after which an upload fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in seconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    /// Retry delay cap in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Archive file name prefix
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,

    /// Write chunks to a local directory instead of the network
    #[serde(default)]
    pub dry_run: bool,
}

/// Local directories.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Where archives are built before upload
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Where outgoing description payloads are copied
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Where dry runs write their chunks
    #[serde(default = "default_dry_run_dir")]
    pub dry_run_dir: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_upload_endpoint() -> String {
    "https://upload.capture-kit.local/api/upload".to_string()
}
fn default_description_endpoint() -> String {
    "https://api.capture-kit.local/api/sequences/description".to_string()
}
fn default_request_timeout() -> u64 {
    300
}
fn default_min_chunk_size() -> u64 {
    MIN_CHUNK_SIZE
}
fn default_max_chunk_size() -> u64 {
    MAX_CHUNK_SIZE
}
fn default_max_retries() -> u32 {
    200
}
fn default_initial_backoff() -> u64 {
    2
}
fn default_max_backoff() -> u64 {
    16
}
fn default_archive_prefix() -> String {
    "capture_kit".to_string()
}
fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("capture-kit")
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("capture_kit_backup")
}
fn default_dry_run_dir() -> PathBuf {
    PathBuf::from("capture_kit_dry_run")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            upload_endpoint: default_upload_endpoint(),
            description_endpoint: default_description_endpoint(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            archive_prefix: default_archive_prefix(),
            dry_run: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            backup_dir: default_backup_dir(),
            dry_run_dir: default_dry_run_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            account: AccountConfig::default(),
            upload: UploadConfig::default(),
            storage: StorageConfig::default(),
            anomaly: AnomalyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl UploaderConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. /etc/capture-kit/uploader.{toml,yaml,json}
    /// 2. config/uploader.{toml,yaml,json}
    /// 3. Environment variables (e.g. UPLOADER__ACCOUNT__EMAIL)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("/etc/capture-kit/uploader").required(false))
            .add_source(File::with_name("config/uploader").required(false))
            .add_source(
                Environment::with_prefix("UPLOADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.upload.dry_run {
            for (field, endpoint) in [
                ("api.upload_endpoint", &self.api.upload_endpoint),
                ("api.description_endpoint", &self.api.description_endpoint),
            ] {
                if endpoint.is_empty() {
                    return Err(ConfigValidationError::MissingField(field.to_string()));
                }
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    return Err(ConfigValidationError::InvalidValue {
                        field: field.to_string(),
                        message: "URL must start with http:// or https://".to_string(),
                    });
                }
            }

            if self.account.email.is_empty() {
                return Err(ConfigValidationError::MissingField("account.email".to_string()));
            }
        }

        if self.upload.min_chunk_size == 0 || self.upload.min_chunk_size > self.upload.max_chunk_size {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.min_chunk_size".to_string(),
                message: "must be positive and not above upload.max_chunk_size".to_string(),
            });
        }

        if self.upload.max_retries == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.max_retries".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.upload.archive_prefix.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "upload.archive_prefix".to_string(),
            ));
        }

        Ok(())
    }
}

impl ApiConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AccountConfig {
    /// Directory name for this account's payload backups.
    pub fn backup_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }
}

impl UploadConfig {
    /// Get the first retry delay as Duration.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    /// Get the retry delay cap as Duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
