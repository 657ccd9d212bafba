//! Batch upload of an image directory.
//!
//! Descriptions are filtered once more, grouped into sequences and uploaded
//! one sequence at a time. A failing sequence is logged and skipped; the
//! rest of the batch carries on.

use crate::archiver::{
    archive_sequence, find_root_dir, zip_entry_count, ArchiveError, ArchivedSequence, ImageReader, RawImageReader,
};
use crate::chunked_uploader::{ChunkedUploader, UploadError, UploadJob};
use crate::config::UploaderConfig;
use crate::description_upload::{
    sequence_summary, DescriptionUploadError, DescriptionUploader, HttpDescriptionApi, SequenceStats,
};
use crate::progress::{ProgressObserver, ProgressObservers};
use crate::transport::{DryRunTransport, HttpTransport, TransportError, UploadTransport};
use capture_sequencer::description::{assign_photo_uuids, validate_image_files};
use capture_sequencer::{group_by_sequence, AnomalyFilter, DescriptionError, DescriptionFile, Sequence, Summary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Errors that stop a whole batch
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("invalid descriptions: {0}")]
    Description(#[from] DescriptionError),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("description client setup failed: {0}")]
    DescriptionClient(#[from] DescriptionUploadError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("invalid zip path {0}")]
    InvalidZipPath(PathBuf),
}

/// Errors confined to one sequence
#[derive(Error, Debug)]
pub enum SequenceError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Description(#[from] DescriptionUploadError),

    #[error("archiving task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// How one sequence went
#[derive(Debug)]
pub struct SequenceReport {
    pub sequence_uuid: String,
    pub image_count: usize,
    pub result: Result<String, SequenceError>,
}

/// Outcome of a batch upload
#[derive(Debug, Default)]
pub struct UploadReport {
    pub sequences: Vec<SequenceReport>,
}

impl UploadReport {
    pub fn total(&self) -> usize {
        self.sequences.len()
    }

    pub fn succeeded(&self) -> usize {
        self.sequences.iter().filter(|s| s.result.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &SequenceReport> {
        self.sequences.iter().filter(|s| s.result.is_err())
    }
}

/// Filter descriptions before upload.
///
/// Keeps images that passed sequencing (they carry a heading), re-runs the
/// anomaly checks and stamps photo identifiers when an email is known.
pub fn prepare_descriptions(file: DescriptionFile, config: &UploaderConfig) -> DescriptionFile {
    let mut images: Vec<_> = file.images.into_iter().filter(|image| image.heading.is_some()).collect();
    if !config.account.email.is_empty() {
        assign_photo_uuids(&mut images, &config.account.email);
    }
    let report = AnomalyFilter::new(config.anomaly.clone()).detect(images, file.information.as_ref());

    let mut failures = file.failures;
    failures.extend(report.duplicates.iter().map(|d| d.to_entry()));
    failures.extend(report.anomaly_points.iter().map(|a| a.to_entry()));

    DescriptionFile {
        images: report.descriptions,
        failures,
        information: Some(report.summary),
    }
}

/// Zip every sequence of `file` into `zip_dir`.
#[instrument(skip(file, reader), fields(images = file.images.len()))]
pub fn zip_image_dir(
    import_path: &Path,
    file: &DescriptionFile,
    zip_dir: &Path,
    prefix: &str,
    reader: &dyn ImageReader,
) -> Result<Vec<ArchivedSequence>, BatchError> {
    let images: Vec<_> = file
        .images
        .iter()
        .filter(|image| image.heading.is_some())
        .cloned()
        .collect();
    validate_image_files(&images, import_path)?;

    let mut archives = Vec::new();
    for sequence in group_by_sequence(images) {
        archives.push(archive_sequence(
            import_path,
            &sequence.uuid,
            &sequence.images,
            zip_dir,
            prefix,
            reader,
        )?);
    }

    info!(archives = archives.len(), zip_dir = %zip_dir.display(), "Sequences zipped");
    Ok(archives)
}

/// Uploads sequences one after another.
pub struct BatchUploader {
    config: UploaderConfig,
    transport: Arc<dyn UploadTransport>,
    descriptions: Option<DescriptionUploader>,
    observers: ProgressObservers,
    reader: Arc<dyn ImageReader>,
}

impl BatchUploader {
    pub fn new(
        config: UploaderConfig,
        transport: Arc<dyn UploadTransport>,
        descriptions: Option<DescriptionUploader>,
    ) -> Self {
        Self {
            config,
            transport,
            descriptions,
            observers: ProgressObservers::new(),
            reader: Arc::new(RawImageReader),
        }
    }

    /// HTTP transport and description client, or the local sink for dry runs.
    pub fn from_config(config: UploaderConfig) -> Result<Self, BatchError> {
        if config.upload.dry_run {
            let transport = Arc::new(DryRunTransport::new(&config.storage.dry_run_dir));
            return Ok(Self::new(config, transport, None));
        }

        let transport = Arc::new(HttpTransport::new(&config.api, config.account.clone())?);
        let api = Arc::new(HttpDescriptionApi::new(&config.api, &config.account)?);
        let descriptions = DescriptionUploader::new(api, &config.storage.backup_dir, &config.account);
        Ok(Self::new(config, transport, Some(descriptions)))
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.register(observer);
        self
    }

    pub fn with_image_reader(mut self, reader: Arc<dyn ImageReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Upload every sequence in `file` and its description.
    ///
    /// Only validation problems fail the whole call. An empty description
    /// list gives an empty report.
    #[instrument(skip(self, import_path, file), fields(import_path = %import_path.display()))]
    pub async fn upload_image_dir_and_descriptions(
        &self,
        import_path: &Path,
        file: DescriptionFile,
    ) -> Result<UploadReport, BatchError> {
        let file = prepare_descriptions(file, &self.config);
        if file.images.is_empty() {
            warn!("No images left to upload");
            return Ok(UploadReport::default());
        }
        validate_image_files(&file.images, import_path)?;

        let base = file
            .information
            .clone()
            .unwrap_or_else(|| Summary::new(file.images.len(), 0, 0));
        let sequences = group_by_sequence(file.images);
        let total = sequences.len();
        info!(sequences = total, "Upload started");

        let mut report = UploadReport::default();
        for (idx, sequence) in sequences.into_iter().enumerate() {
            let result = self.upload_sequence(import_path, &sequence, idx, total, &base).await;
            match &result {
                Ok(hash) => info!(sequence = %sequence.uuid, hash = %hash, "Sequence uploaded"),
                Err(e) => error!(sequence = %sequence.uuid, error = %e, "Sequence upload failed"),
            }
            report.sequences.push(SequenceReport {
                sequence_uuid: sequence.uuid,
                image_count: sequence.images.len(),
                result,
            });
        }

        info!(
            succeeded = report.succeeded(),
            total = report.total(),
            "{} out of {} sequences uploaded",
            report.succeeded(),
            report.total()
        );
        Ok(report)
    }

    async fn upload_sequence(
        &self,
        import_path: &Path,
        sequence: &Sequence,
        idx: usize,
        total: usize,
        base: &Summary,
    ) -> Result<String, SequenceError> {
        let archive = {
            let import_path = import_path.to_path_buf();
            let sequence = sequence.clone();
            let work_dir = self.config.storage.work_dir.clone();
            let prefix = self.config.upload.archive_prefix.clone();
            let reader = self.reader.clone();
            tokio::task::spawn_blocking(move || {
                archive_sequence(
                    &import_path,
                    &sequence.uuid,
                    &sequence.images,
                    &work_dir,
                    &prefix,
                    reader.as_ref(),
                )
            })
            .await??
        };

        let image_paths: Vec<PathBuf> = sequence.images.iter().map(|i| i.image_path(import_path)).collect();
        let sequence_path = find_root_dir(&image_paths).unwrap_or_else(|| import_path.to_path_buf());
        let job = UploadJob::new(&archive.session_key, archive.size_bytes, archive.image_count).for_sequence(
            sequence_path.display().to_string(),
            &sequence.uuid,
            idx,
            total,
        );
        let mut uploader = ChunkedUploader::new(self.transport.clone(), &self.config.upload, self.observers.clone());
        let uploaded = uploader.upload_file(&archive.path, &job).await;

        // the retry loop is over either way
        if let Err(e) = tokio::fs::remove_file(&archive.path).await {
            warn!(archive = %archive.path.display(), error = %e, "Failed to remove archive");
        }
        let hash = uploaded?;

        if let Some(descriptions) = &self.descriptions {
            // the server's hash, not the local one
            let stats = SequenceStats {
                count: archive.image_count,
                size: archive.size_mib(),
                hash: hash.clone(),
            };
            let summary = sequence_summary(base, &sequence.uuid, &stats);
            descriptions.upload(&sequence.uuid, &sequence.images, &summary).await?;
        }

        Ok(hash)
    }

    /// Upload an existing archive; its file name is the session key.
    #[instrument(skip(self))]
    pub async fn upload_zip_file(&self, zip_path: &Path) -> Result<String, BatchError> {
        let session_key = zip_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| BatchError::InvalidZipPath(zip_path.to_path_buf()))?;
        let file_count = zip_entry_count(zip_path)?;
        let size = tokio::fs::metadata(zip_path)
            .await
            .map_err(UploadError::Io)?
            .len();

        let job = UploadJob::new(session_key, size, file_count);
        let mut uploader = ChunkedUploader::new(self.transport.clone(), &self.config.upload, self.observers.clone());
        Ok(uploader.upload_file(zip_path, &job).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description_upload::MockDescriptionApi;
    use crate::progress::ProgressEvent;
    use crate::transport::{Chunk, ChunkReceipt};
    use async_trait::async_trait;
    use capture_sequencer::description::parse_descriptions;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Stores chunks in memory and confirms every upload with its own hash.
    #[derive(Default)]
    struct ConfirmingServer {
        stored: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl UploadTransport for ConfirmingServer {
        async fn fetch_offset(&self, _session_key: &str) -> Result<u64, TransportError> {
            Ok(self.stored.lock().unwrap().len() as u64)
        }

        async fn send_chunk(&self, chunk: Chunk) -> Result<ChunkReceipt, TransportError> {
            let mut stored = self.stored.lock().unwrap();
            if chunk.is_final() {
                stored.clear();
                return Ok(ChunkReceipt {
                    hash: Some("server-confirmed".into()),
                });
            }
            stored.extend_from_slice(&chunk.data);
            Ok(ChunkReceipt::default())
        }
    }

    #[derive(Default)]
    struct PathRecorder(Mutex<Vec<String>>);

    impl ProgressObserver for PathRecorder {
        fn on_chunk(&self, event: &ProgressEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.sequence.sequence_path.clone());
            Ok(())
        }
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("capture-batch-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Two sequences of two images; the unsequenced third one is dropped.
    fn fixture(dir: &Path) -> DescriptionFile {
        for name in ["a1.jpg", "a2.jpg", "b1.jpg", "b2.jpg", "c1.jpg"] {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
        parse_descriptions(
            r#"[
                {"path": "", "filename": "a1.jpg", "latitude": 41.0, "longitude": 29.0,
                 "captureTime": "2023-05-01 10:00:00", "heading": 0.0, "sequenceUuid": "seq-a"},
                {"path": "", "filename": "a2.jpg", "latitude": 41.0001, "longitude": 29.0,
                 "captureTime": "2023-05-01 10:00:02", "heading": 0.0, "sequenceUuid": "seq-a"},
                {"path": "", "filename": "b1.jpg", "latitude": 41.1, "longitude": 29.0,
                 "captureTime": "2023-05-01 11:00:00", "heading": 0.0, "sequenceUuid": "seq-b"},
                {"path": "", "filename": "b2.jpg", "latitude": 41.1001, "longitude": 29.0,
                 "captureTime": "2023-05-01 11:00:02", "heading": 0.0, "sequenceUuid": "seq-b"},
                {"path": "", "filename": "c1.jpg", "latitude": 41.2, "longitude": 29.0,
                 "captureTime": "2023-05-01 12:00:00"},
                {"Information": {"total_images": 5, "processed_images": 5, "failed_images": 0,
                 "duplicated_images": 0, "id": "run-1"}}
            ]"#
            .as_bytes(),
            "test",
        )
        .unwrap()
    }

    fn config(dir: &Path) -> UploaderConfig {
        let mut config = UploaderConfig::default();
        config.account.email = "user@example.com".into();
        config.storage.work_dir = dir.join("work");
        config.storage.backup_dir = dir.join("backup");
        config.storage.dry_run_dir = dir.join("dry_run");
        config
    }

    #[test]
    fn test_prepare_descriptions() {
        let dir = temp_dir();
        let prepared = prepare_descriptions(fixture(&dir), &config(&dir));

        assert_eq!(prepared.images.len(), 4);
        assert!(prepared.images.iter().all(|i| i.photo_uuid.is_some()));
        assert!(prepared.images.iter().all(|i| i.anomaly == Some(0)));
        assert_eq!(prepared.information.unwrap().id, "run-1");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_zip_image_dir() {
        let dir = temp_dir();
        let file = fixture(&dir);
        let zip_dir = dir.join("zips");

        let archives = zip_image_dir(&dir, &file, &zip_dir, "capture_kit", &RawImageReader).unwrap();

        assert_eq!(archives.len(), 2);
        for archive in &archives {
            assert!(zip_dir.join(&archive.session_key).is_file());
            assert_eq!(zip_entry_count(&archive.path).unwrap(), 2);
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_image_is_fatal() {
        let dir = temp_dir();
        let file = fixture(&dir);
        std::fs::remove_file(dir.join("b2.jpg")).unwrap();

        let uploader = BatchUploader::from_config({
            let mut config = config(&dir);
            config.upload.dry_run = true;
            config
        })
        .unwrap();
        let result = uploader.upload_image_dir_and_descriptions(&dir, file).await;

        assert!(matches!(result, Err(BatchError::Description(DescriptionError::MissingImage(_)))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_description_failure_only_affects_its_sequence() {
        let dir = temp_dir();
        let config = config(&dir);

        let mut api = MockDescriptionApi::new();
        api.expect_post_description()
            .times(2)
            .returning(|payload| {
                let sequence = &payload["options"]["parameters"]["summary"]["Information"]["sequence_uuid"];
                if sequence == "seq-a" {
                    Err(DescriptionUploadError::Status {
                        status: 400,
                        body: "bad".into(),
                    })
                } else {
                    Ok(())
                }
            });
        let descriptions = DescriptionUploader::new(Arc::new(api), &config.storage.backup_dir, &config.account);
        let transport = Arc::new(DryRunTransport::new(&config.storage.dry_run_dir));

        let uploader = BatchUploader::new(config, transport, Some(descriptions));
        let report = uploader
            .upload_image_dir_and_descriptions(&dir, fixture(&dir))
            .await
            .unwrap();

        assert_eq!(report.total(), 2);
        assert_eq!(report.succeeded(), 1);
        let failed: Vec<&str> = report.failed().map(|s| s.sequence_uuid.as_str()).collect();
        assert_eq!(failed, vec!["seq-a"]);

        // archives are removed once their upload is over
        let leftovers = std::fs::read_dir(dir.join("work")).unwrap().count();
        assert_eq!(leftovers, 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_summary_carries_server_hash() {
        let dir = temp_dir();
        let config = config(&dir);

        let mut api = MockDescriptionApi::new();
        api.expect_post_description()
            .withf(|payload| payload["options"]["parameters"]["summary"]["Information"]["hash"] == "server-confirmed")
            .times(2)
            .returning(|_| Ok(()));
        let descriptions = DescriptionUploader::new(Arc::new(api), &config.storage.backup_dir, &config.account);

        let uploader = BatchUploader::new(config, Arc::new(ConfirmingServer::default()), Some(descriptions));
        let report = uploader
            .upload_image_dir_and_descriptions(&dir, fixture(&dir))
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 2);
        assert!(report
            .sequences
            .iter()
            .all(|s| s.result.as_deref().ok() == Some("server-confirmed")));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_progress_reports_sequence_directory() {
        let dir = temp_dir();
        std::fs::create_dir_all(dir.join("cam/front")).unwrap();
        for name in ["1.jpg", "2.jpg"] {
            std::fs::write(dir.join("cam/front").join(name), name.as_bytes()).unwrap();
        }
        let file = parse_descriptions(
            r#"[
                {"path": "cam/front", "filename": "1.jpg", "latitude": 41.0, "longitude": 29.0,
                 "captureTime": "2023-05-01 10:00:00", "heading": 0.0, "sequenceUuid": "seq-a"},
                {"path": "cam/front", "filename": "2.jpg", "latitude": 41.0001, "longitude": 29.0,
                 "captureTime": "2023-05-01 10:00:02", "heading": 0.0, "sequenceUuid": "seq-a"}
            ]"#
            .as_bytes(),
            "test",
        )
        .unwrap();

        let config = config(&dir);
        let recorder = Arc::new(PathRecorder::default());
        let transport = Arc::new(DryRunTransport::new(&config.storage.dry_run_dir));
        let report = BatchUploader::new(config, transport, None)
            .with_observer(recorder.clone())
            .upload_image_dir_and_descriptions(&dir, file)
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 1);
        let paths = recorder.0.lock().unwrap().clone();
        assert!(!paths.is_empty());
        assert!(paths.iter().all(|p| *p == dir.join("cam/front").display().to_string()));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
