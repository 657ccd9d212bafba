//! Resumable chunked upload of one archive.
//!
//! The server is the source of truth for how much of a session it holds, so
//! every attempt starts by asking for the offset and streams from there.
//! Killing the process mid-upload is safe; the next run resumes.

use crate::config::UploadConfig;
use crate::progress::{ProgressEvent, ProgressObservers, SequenceProgress};
use crate::transport::{Chunk, TransportError, UploadTransport};
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{debug, error, info, instrument, warn};

/// Terminal upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload of {session_key} rejected: {source}")]
    Rejected {
        session_key: String,
        #[source]
        source: TransportError,
    },

    #[error("gave up on {session_key} after {attempts} consecutive failures: {source}")]
    RetriesExhausted {
        session_key: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("server offset {offset} is past the end of {session_key} ({total_size} bytes)")]
    OffsetOutOfRange {
        session_key: String,
        offset: u64,
        total_size: u64,
    },

    #[error("server did not confirm a content hash for {0}")]
    MissingHash(String),

    #[error("failed to read archive: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an upload stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    FetchingOffset,
    Streaming { offset: u64 },
    Completed { hash: String },
    Failed,
}

/// Result of one pass from offset fetch to end of stream
enum AttemptOutcome {
    Completed(String),
    Retryable(TransportError),
    Fatal(UploadError),
}

/// Chunk size for an archive of `total_size` bytes holding `file_count` files.
///
/// The average file size, clamped to `[min, max]`.
pub fn chunk_size(total_size: u64, file_count: usize, min: u64, max: u64) -> u64 {
    let count = file_count.max(1) as u64;
    (total_size / count).clamp(min, max)
}

/// One archive to upload.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub session_key: String,
    pub file_count: usize,
    pub sequence: SequenceProgress,
}

impl UploadJob {
    pub fn new(session_key: impl Into<String>, total_size: u64, file_count: usize) -> Self {
        Self {
            session_key: session_key.into(),
            file_count,
            sequence: SequenceProgress {
                total_bytes: total_size,
                total_sequences: 1,
                ..Default::default()
            },
        }
    }

    /// Attach the sequence this archive was built from.
    pub fn for_sequence(
        mut self,
        sequence_path: impl Into<String>,
        sequence_uuid: impl Into<String>,
        sequence_idx: usize,
        total_sequences: usize,
    ) -> Self {
        self.sequence.sequence_path = sequence_path.into();
        self.sequence.sequence_uuid = sequence_uuid.into();
        self.sequence.sequence_idx = sequence_idx;
        self.sequence.total_sequences = total_sequences;
        self
    }

    pub fn total_size(&self) -> u64 {
        self.sequence.total_bytes
    }
}

/// Drives one archive through the resumable upload protocol.
pub struct ChunkedUploader {
    transport: Arc<dyn UploadTransport>,
    observers: ProgressObservers,
    min_chunk_size: u64,
    max_chunk_size: u64,
    max_retries: u32,
    backoff: ExponentialBackoff,
    state: UploadState,
    retries: u32,
}

impl ChunkedUploader {
    pub fn new(transport: Arc<dyn UploadTransport>, config: &UploadConfig, observers: ProgressObservers) -> Self {
        let backoff = ExponentialBackoff {
            current_interval: config.initial_backoff(),
            initial_interval: config.initial_backoff(),
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: config.max_backoff(),
            max_elapsed_time: None, // the retry counter bounds the loop
            ..Default::default()
        };

        Self {
            transport,
            observers,
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
            max_retries: config.max_retries,
            backoff,
            state: UploadState::Idle,
            retries: 0,
        }
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    /// Consecutive retryable failures since the last accepted chunk.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Upload an archive file.
    pub async fn upload_file(&mut self, path: &Path, job: &UploadJob) -> Result<String, UploadError> {
        let file = tokio::fs::File::open(path).await?;
        self.upload(file, job).await
    }

    /// Upload `source` and return the content hash the server confirmed.
    #[instrument(skip(self, source, job), fields(session_key = %job.session_key, total_size = job.total_size()))]
    pub async fn upload<R>(&mut self, mut source: R, job: &UploadJob) -> Result<String, UploadError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let chunk_size = chunk_size(job.total_size(), job.file_count, self.min_chunk_size, self.max_chunk_size);
        debug!(chunk_size = chunk_size, file_count = job.file_count, "Starting upload");

        self.retries = 0;
        self.backoff.reset();

        loop {
            match self.attempt(&mut source, job, chunk_size).await {
                AttemptOutcome::Completed(hash) => {
                    info!(hash = %hash, "Upload completed");
                    self.state = UploadState::Completed { hash: hash.clone() };
                    return Ok(hash);
                }
                AttemptOutcome::Fatal(e) => {
                    error!(error = %e, "Upload failed");
                    self.state = UploadState::Failed;
                    return Err(e);
                }
                AttemptOutcome::Retryable(e) => {
                    self.retries += 1;

                    if self.retries >= self.max_retries {
                        error!(attempts = self.retries, error = %e, "Retry budget exhausted");
                        self.state = UploadState::Failed;
                        return Err(UploadError::RetriesExhausted {
                            session_key: job.session_key.clone(),
                            attempts: self.retries,
                            source: e,
                        });
                    }

                    let delay = self
                        .backoff
                        .next_backoff()
                        .unwrap_or(self.backoff.max_interval);
                    warn!(
                        attempt = self.retries,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Upload interrupted, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<R>(&mut self, source: &mut R, job: &UploadJob, chunk_size: u64) -> AttemptOutcome
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        self.state = UploadState::FetchingOffset;
        let mut offset = match self.transport.fetch_offset(&job.session_key).await {
            Ok(offset) => offset,
            Err(e) => return self.classify(e, job),
        };

        let total_size = job.total_size();
        if offset > total_size {
            return AttemptOutcome::Fatal(UploadError::OffsetOutOfRange {
                session_key: job.session_key.clone(),
                offset,
                total_size,
            });
        }
        if let Err(e) = source.seek(SeekFrom::Start(offset)).await {
            return AttemptOutcome::Fatal(e.into());
        }

        self.state = UploadState::Streaming { offset };
        let mut buffer = vec![0u8; chunk_size as usize];

        loop {
            let read = match read_chunk(source, &mut buffer).await {
                Ok(read) => read,
                Err(e) => return AttemptOutcome::Fatal(e.into()),
            };

            let chunk = Chunk {
                session_key: job.session_key.clone(),
                offset,
                total_size,
                data: Bytes::copy_from_slice(&buffer[..read]),
            };

            let receipt = match self.transport.send_chunk(chunk).await {
                Ok(receipt) => receipt,
                Err(e) => return self.classify(e, job),
            };

            if read == 0 {
                return match receipt.hash {
                    Some(hash) => AttemptOutcome::Completed(hash),
                    None => AttemptOutcome::Fatal(UploadError::MissingHash(job.session_key.clone())),
                };
            }

            offset += read as u64;
            self.retries = 0;
            self.backoff.reset();
            self.state = UploadState::Streaming { offset };

            self.observers.notify(&ProgressEvent {
                chunk_size: read as u64,
                uploaded_bytes: offset,
                sequence: job.sequence.clone(),
            });
        }
    }

    fn classify(&self, error: TransportError, job: &UploadJob) -> AttemptOutcome {
        if error.is_retryable() {
            AttemptOutcome::Retryable(error)
        } else {
            AttemptOutcome::Fatal(UploadError::Rejected {
                session_key: job.session_key.clone(),
                source: error,
            })
        }
    }
}

/// Fill `buffer` from `source`, stopping early only at end of input.
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = source.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
