//! Capture Uploader
//!
//! Ships sequenced imagery to the server:
//!
//! - Content-addressed zip archives per sequence
//! - Resumable chunked upload with server-side offsets and bounded retries
//! - Per-sequence description upload with local payload backups
//! - Batch orchestration where one failing sequence never stops the others
//!
//! # Example
//!
//! ```rust,no_run
//! use capture_uploader::{BatchUploader, UploaderConfig};
//! use capture_sequencer::read_image_descriptions;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = UploaderConfig::load()?;
//!     let import_path = Path::new("/data/capture");
//!     let file = read_image_descriptions(&import_path.join("capture_description.json"))?;
//!
//!     let report = BatchUploader::from_config(config)?
//!         .upload_image_dir_and_descriptions(import_path, file)
//!         .await?;
//!     println!("{} of {} sequences uploaded", report.succeeded(), report.total());
//!     Ok(())
//! }
//! ```

pub mod archiver;
pub mod batch;
pub mod chunked_uploader;
pub mod config;
pub mod description_upload;
pub mod progress;
pub mod transport;

// Re-export main types
pub use archiver::{
    archive_sequence, find_root_dir, session_key, zip_sequence, ArchiveError, ArchivedSequence, ImageReader,
    RawImageReader,
};
pub use batch::{prepare_descriptions, zip_image_dir, BatchError, BatchUploader, SequenceError, UploadReport};
pub use chunked_uploader::{chunk_size, ChunkedUploader, UploadError, UploadJob, UploadState};
pub use config::{ConfigValidationError, UploaderConfig, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use description_upload::{
    description_payload, sequence_summary, DescriptionApi, DescriptionUploadError, DescriptionUploader,
    HttpDescriptionApi, SequenceStats,
};
pub use progress::{LoggingObserver, ProgressEvent, ProgressObserver, ProgressObservers, SequenceProgress};
pub use transport::{Chunk, ChunkReceipt, DryRunTransport, HttpTransport, TransportError, UploadTransport};
