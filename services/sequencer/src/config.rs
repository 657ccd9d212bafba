//! Configuration management for the sequencing pass.
//!
//! This module handles loading and validating configuration from
//! configuration files and environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration for the sequencer.
#[derive(Debug, Clone, Deserialize)]
pub struct SequencerConfig {
    /// Sequence splitting configuration
    #[serde(default)]
    pub sequence: SequenceConfig,

    /// Anomaly and duplicate detection thresholds
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Telemetry noise filtering for library callers holding raw GPS tracks;
    /// description-file processing does not use it
    #[serde(default)]
    pub noise: NoiseFilterConfig,

    /// Account used to derive photo identifiers
    #[serde(default)]
    pub account: AccountConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Keep going when some images failed instead of exiting non-zero
    #[serde(default = "default_skip_process_errors")]
    pub skip_process_errors: bool,
}

/// Sequence splitting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
    /// Distance in meters between consecutive images that starts a new sequence
    #[serde(default = "default_cutoff_distance")]
    pub cutoff_distance_m: f64,

    /// Time in seconds between consecutive images that starts a new sequence
    #[serde(default = "default_cutoff_time")]
    pub cutoff_time_secs: f64,

    /// Recompute every heading from the track instead of only missing ones
    #[serde(default)]
    pub interpolate_directions: bool,

    /// Treat all images as one stream instead of one stream per directory
    #[serde(default)]
    pub skip_subfolders: bool,

    /// Maximum number of images per sequence
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
}

/// Plausibility bounds for accepted images.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Images closer than this to the previous kept image are duplicates
    #[serde(default = "default_duplicate_distance")]
    pub duplicate_distance_m: f64,

    /// Largest plausible jump between consecutive images of a sequence
    #[serde(default = "default_max_jump_distance")]
    pub max_jump_distance_m: f64,

    /// Largest plausible heading change between consecutive images
    #[serde(default = "default_max_heading_delta")]
    pub max_heading_delta_deg: f64,

    /// Altitude above which a fix is rejected
    #[serde(default = "default_altitude_ceiling")]
    pub altitude_ceiling_m: f64,
}

/// Telemetry track noise filtering.
///
/// Read by [`crate::point_stream::cleanse_noisy_points`].
#[derive(Debug, Clone, Deserialize)]
pub struct NoiseFilterConfig {
    /// Nominal GPS precision in meters
    #[serde(default = "default_gps_precision")]
    pub gps_precision_m: f64,

    /// Dilution of precision ceiling, multiplied by 100
    #[serde(default = "default_max_dop100")]
    pub max_dop100: f64,

    /// Accepted raw GPS fix codes
    #[serde(default = "default_allowed_fixes")]
    pub allowed_fixes: Vec<u8>,
}

/// Account identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountConfig {
    /// Account email, used to derive photo identifiers
    #[serde(default)]
    pub email: Option<String>,
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
fn default_skip_process_errors() -> bool {
    true
}
fn default_cutoff_distance() -> f64 {
    600.0
}
fn default_cutoff_time() -> f64 {
    60.0
}
fn default_max_sequence_length() -> usize {
    crate::sequence_builder::MAX_SEQUENCE_LENGTH
}
fn default_duplicate_distance() -> f64 {
    0.1
}
fn default_max_jump_distance() -> f64 {
    300.0
}
fn default_max_heading_delta() -> f64 {
    150.0
}
fn default_altitude_ceiling() -> f64 {
    9000.0
}
fn default_gps_precision() -> f64 {
    15.0
}
fn default_max_dop100() -> f64 {
    1000.0
}
fn default_allowed_fixes() -> Vec<u8> {
    vec![0, 2, 3]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            sequence: SequenceConfig::default(),
            anomaly: AnomalyConfig::default(),
            noise: NoiseFilterConfig::default(),
            account: AccountConfig::default(),
            logging: LoggingConfig::default(),
            skip_process_errors: default_skip_process_errors(),
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            cutoff_distance_m: default_cutoff_distance(),
            cutoff_time_secs: default_cutoff_time(),
            interpolate_directions: false,
            skip_subfolders: false,
            max_sequence_length: default_max_sequence_length(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            duplicate_distance_m: default_duplicate_distance(),
            max_jump_distance_m: default_max_jump_distance(),
            max_heading_delta_deg: default_max_heading_delta(),
            altitude_ceiling_m: default_altitude_ceiling(),
        }
    }
}

impl Default for NoiseFilterConfig {
    fn default() -> Self {
        Self {
            gps_precision_m: default_gps_precision(),
            max_dop100: default_max_dop100(),
            allowed_fixes: default_allowed_fixes(),
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

impl SequencerConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. /etc/capture-kit/sequencer.{toml,yaml,json}
    /// 2. config/sequencer.{toml,yaml,json}
    /// 3. Environment variables (e.g. SEQUENCER__SEQUENCE__CUTOFF_TIME_SECS)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("/etc/capture-kit/sequencer").required(false))
            .add_source(File::with_name("config/sequencer").required(false))
            .add_source(
                Environment::with_prefix("SEQUENCER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.sequence.cutoff_distance_m <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sequence.cutoff_distance_m".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.sequence.cutoff_time_secs <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sequence.cutoff_time_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let max = crate::sequence_builder::MAX_SEQUENCE_LENGTH;
        if self.sequence.max_sequence_length == 0 || self.sequence.max_sequence_length > max {
            return Err(ConfigValidationError::InvalidValue {
                field: "sequence.max_sequence_length".to_string(),
                message: format!("must be between 1 and {}", max),
            });
        }

        if self.anomaly.duplicate_distance_m < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "anomaly.duplicate_distance_m".to_string(),
                message: "must not be negative".to_string(),
            });
        }

        if !(0.0..=180.0).contains(&self.anomaly.max_heading_delta_deg) {
            return Err(ConfigValidationError::InvalidValue {
                field: "anomaly.max_heading_delta_deg".to_string(),
                message: "must be within [0, 180]".to_string(),
            });
        }

        if self.noise.allowed_fixes.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "noise.allowed_fixes".to_string(),
            ));
        }

        Ok(())
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
