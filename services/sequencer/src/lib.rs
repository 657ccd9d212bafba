//! Capture Sequencer
//!
//! Turns geotagged street-level imagery into capture sequences ready for
//! upload. It handles:
//!
//! - WGS84 distance and bearing math
//! - Noise and outlier filtering over ordered point streams
//! - Splitting image streams into sequences by distance and time gaps,
//!   with heading interpolation and bounded sequence size
//! - Duplicate and anomaly detection with reconciled run summaries
//! - The description file that carries per-image records between passes
//!
//! # Example
//!
//! ```rust,no_run
//! use capture_sequencer::prelude::*;
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SequencerConfig::load()?;
//!     let input = read_description_file(Path::new("capture_description.json"))?;
//!     let outcome = process_description_file(input, &config);
//!     write_description_file(Path::new("capture_description.json"), &outcome.file)?;
//!     Ok(())
//! }
//! ```

pub mod anomaly;
pub mod config;
pub mod description;
pub mod geodesy;
pub mod point;
pub mod point_stream;
pub mod process;
pub mod sequence_builder;

// Re-export main types
pub use anomaly::{AnomalyFilter, AnomalyPoint, AnomalyReason, AnomalyReport};
pub use config::{
    AccountConfig, AnomalyConfig, ConfigValidationError, LoggingConfig, NoiseFilterConfig,
    SequenceConfig, SequencerConfig,
};
pub use description::{
    merge_records, read_description_file, read_image_descriptions, write_description_file,
    DescriptionError, DescriptionFile, FailedEntry, GeotagRecord, ImageDescription, ImageFailure,
    MetadataRecord, SequenceRecord, Summary,
};
pub use point::{GeoPoint, GpsFix, Located, PointWithFix};
pub use point_stream::{
    calculate_upper_limit, cleanse_noisy_points, cluster_merge, divide_if, generate_pairs,
    purge_outliers, StatisticsError,
};
pub use process::{process_description_file, SequencingOutcome};
pub use sequence_builder::{
    group_by_sequence, split_sequences, Sequence, SequenceBuilder, MAX_SEQUENCE_LENGTH,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::SequencerConfig;
    pub use crate::description::{
        read_description_file, write_description_file, DescriptionFile, ImageDescription, Summary,
    };
    pub use crate::process::{process_description_file, SequencingOutcome};
    pub use crate::sequence_builder::{SequenceBuilder, MAX_SEQUENCE_LENGTH};
}
