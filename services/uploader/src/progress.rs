//! Upload progress notifications.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{info, warn};

/// Which sequence an upload belongs to.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SequenceProgress {
    pub sequence_path: String,
    pub sequence_uuid: String,
    pub total_bytes: u64,
    pub sequence_idx: usize,
    pub total_sequences: usize,
}

/// Sent after every accepted non-empty chunk.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent {
    /// Bytes in the chunk just accepted
    pub chunk_size: u64,
    /// Bytes the server holds after this chunk
    pub uploaded_bytes: u64,
    #[serde(flatten)]
    pub sequence: SequenceProgress,
}

impl ProgressEvent {
    pub fn percent(&self) -> f64 {
        if self.sequence.total_bytes == 0 {
            return 100.0;
        }
        self.uploaded_bytes as f64 * 100.0 / self.sequence.total_bytes as f64
    }
}

/// Receives progress events.
pub trait ProgressObserver: Send + Sync {
    fn on_chunk(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}

/// Logs one line per chunk.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_chunk(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        info!(
            sequence = %event.sequence.sequence_uuid,
            sequence_idx = event.sequence.sequence_idx + 1,
            total_sequences = event.sequence.total_sequences,
            uploaded_bytes = event.uploaded_bytes,
            total_bytes = event.sequence.total_bytes,
            percent = format!("{:.1}", event.percent()),
            "Upload progress"
        );
        Ok(())
    }
}

/// Fan-out to every registered observer.
///
/// An observer that fails or panics is logged and skipped; it never stops
/// the upload.
#[derive(Clone, Default)]
pub struct ProgressObservers {
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl ProgressObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn with(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.register(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&self, event: &ProgressEvent) {
        for observer in &self.observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_chunk(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    sequence = %event.sequence.sequence_uuid,
                    error = %e,
                    "Progress observer failed"
                ),
                Err(_) => warn!(
                    sequence = %event.sequence.sequence_uuid,
                    "Progress observer panicked"
                ),
            }
        }
    }
}
