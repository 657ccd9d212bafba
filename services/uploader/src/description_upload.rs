//! Per-sequence description upload.
//!
//! After an archive is accepted its image records and a per-sequence summary
//! are posted to the description endpoint. Every payload is first copied to
//! the account's backup directory, whatever the request outcome.

use crate::config::{AccountConfig, ApiConfig};
use async_trait::async_trait;
use capture_sequencer::{ImageDescription, Summary};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the description upload
#[derive(Error, Debug)]
pub enum DescriptionUploadError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write backup {path}: {source}")]
    Backup {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("description endpoint responded {status}: {body}")]
    Status { status: u16, body: String },
}

/// What the archive upload produced for one sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceStats {
    pub count: usize,
    /// Archive size in MiB
    pub size: f64,
    pub hash: String,
}

/// Summary for one sequence, built from the run-wide one.
///
/// Everything not in the sequence counts as failed from its point of view.
pub fn sequence_summary(base: &Summary, sequence_uuid: &str, stats: &SequenceStats) -> Summary {
    let mut summary = base.clone();
    summary.failed_images = base.total_images.saturating_sub(stats.count);
    summary.total_images = stats.count;
    summary.processed_images = stats.count;

    summary.extra.insert("sequence_uuid".into(), json!(sequence_uuid));
    summary.extra.insert("count".into(), json!(stats.count));
    summary.extra.insert("size".into(), json!(stats.size));
    summary.extra.insert("hash".into(), json!(stats.hash));
    summary
}

#[derive(Serialize)]
struct Payload<'a> {
    options: Options<'a>,
}

#[derive(Serialize)]
struct Options<'a> {
    parameters: Parameters<'a>,
}

#[derive(Serialize)]
struct Parameters<'a> {
    organization_key: &'a str,
    project_key: &'a str,
    json_data: &'a [ImageDescription],
    summary: InformationEntry<'a>,
}

#[derive(Serialize)]
struct InformationEntry<'a> {
    #[serde(rename = "Information")]
    information: &'a Summary,
}

/// Request body for one sequence.
pub fn description_payload(
    organization_key: Option<&str>,
    project_key: Option<&str>,
    images: &[ImageDescription],
    summary: &Summary,
) -> Result<Value, serde_json::Error> {
    serde_json::to_value(Payload {
        options: Options {
            parameters: Parameters {
                organization_key: organization_key.unwrap_or(""),
                project_key: project_key.unwrap_or(""),
                json_data: images,
                summary: InformationEntry { information: summary },
            },
        },
    })
}

/// Endpoint accepting description payloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DescriptionApi: Send + Sync {
    async fn post_description(&self, payload: &Value) -> Result<(), DescriptionUploadError>;
}

/// Posts payloads over HTTP with bearer authentication.
pub struct HttpDescriptionApi {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpDescriptionApi {
    pub fn new(api: &ApiConfig, account: &AccountConfig) -> Result<Self, DescriptionUploadError> {
        let client = reqwest::Client::builder()
            .timeout(api.request_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: api.description_endpoint.clone(),
            token: account.token.clone(),
        })
    }
}

#[async_trait]
impl DescriptionApi for HttpDescriptionApi {
    async fn post_description(&self, payload: &Value) -> Result<(), DescriptionUploadError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DescriptionUploadError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Sends sequence descriptions and keeps a local copy of each payload.
pub struct DescriptionUploader {
    api: Arc<dyn DescriptionApi>,
    backup_dir: PathBuf,
    organization_key: Option<String>,
    project_key: Option<String>,
}

impl DescriptionUploader {
    /// `backup_root/<account backup name>` holds the payload copies.
    pub fn new(api: Arc<dyn DescriptionApi>, backup_root: &Path, account: &AccountConfig) -> Self {
        Self {
            api,
            backup_dir: backup_root.join(account.backup_name()),
            organization_key: account.organization_key.clone(),
            project_key: account.project_key.clone(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Back up then post the description of one sequence.
    pub async fn upload(
        &self,
        sequence_uuid: &str,
        images: &[ImageDescription],
        summary: &Summary,
    ) -> Result<(), DescriptionUploadError> {
        let payload = description_payload(
            self.organization_key.as_deref(),
            self.project_key.as_deref(),
            images,
            summary,
        )?;

        let backup = self.write_backup(sequence_uuid, &payload)?;
        debug!(backup = %backup.display(), "Saved description payload");

        self.api.post_description(&payload).await?;
        info!(sequence = %sequence_uuid, images = images.len(), "Description uploaded");
        Ok(())
    }

    fn write_backup(&self, sequence_uuid: &str, payload: &Value) -> Result<PathBuf, DescriptionUploadError> {
        let backup_error = |path: &Path, source| DescriptionUploadError::Backup {
            path: path.display().to_string(),
            source,
        };

        std::fs::create_dir_all(&self.backup_dir).map_err(|e| backup_error(&self.backup_dir, e))?;

        let path = self.backup_dir.join(format!(
            "{}_backup_request_{}_{}_{}.json",
            chrono::Local::now().format("%Y_%m_%d_%H_%M_%S"),
            self.organization_key.as_deref().unwrap_or("none"),
            self.project_key.as_deref().unwrap_or("none"),
            sequence_uuid
        ));
        let bytes = serde_json::to_vec(payload)?;
        std::fs::write(&path, bytes).map_err(|e| backup_error(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_sequencer::description::parse_descriptions;
    use uuid::Uuid;

    fn images() -> Vec<ImageDescription> {
        parse_descriptions(
            r#"[
                {"path": "", "filename": "1.jpg", "latitude": 41.0, "longitude": 29.0,
                 "captureTime": "2023-05-01 10:00:00", "heading": 0.0, "sequenceUuid": "seq-1"},
                {"path": "", "filename": "2.jpg", "latitude": 41.0001, "longitude": 29.0,
                 "captureTime": "2023-05-01 10:00:01", "heading": 0.0, "sequenceUuid": "seq-1"}
            ]"#
            .as_bytes(),
            "test",
        )
        .unwrap()
        .images
    }

    fn account() -> AccountConfig {
        AccountConfig {
            email: "user@example.com".into(),
            token: "secret".into(),
            username: Some("user".into()),
            organization_key: Some("org".into()),
            project_key: None,
        }
    }

    fn stats() -> SequenceStats {
        SequenceStats {
            count: 2,
            size: 1.5,
            hash: "abc".into(),
        }
    }

    #[test]
    fn test_sequence_summary() {
        let base = Summary::new(10, 3, 1);
        let summary = sequence_summary(&base, "seq-1", &stats());

        assert_eq!(summary.total_images, 2);
        assert_eq!(summary.processed_images, 2);
        assert_eq!(summary.failed_images, 8);
        assert_eq!(summary.id, base.id);
        assert_eq!(summary.extra["sequence_uuid"], "seq-1");
        assert_eq!(summary.extra["hash"], "abc");
        assert_eq!(summary.extra["size"], 1.5);
    }

    #[test]
    fn test_payload_shape() {
        let images = images();
        let summary = sequence_summary(&Summary::new(2, 0, 0), "seq-1", &stats());
        let payload = description_payload(Some("org"), None, &images, &summary).unwrap();

        let parameters = &payload["options"]["parameters"];
        assert_eq!(parameters["organization_key"], "org");
        assert_eq!(parameters["project_key"], "");
        assert_eq!(parameters["json_data"].as_array().unwrap().len(), 2);
        assert_eq!(parameters["json_data"][0]["sequenceUuid"], "seq-1");
        assert_eq!(parameters["summary"]["Information"]["total_images"], 2);
        assert_eq!(parameters["summary"]["Information"]["count"], 2);
    }

    #[tokio::test]
    async fn test_backup_written_even_when_request_fails() {
        let root = std::env::temp_dir().join(format!("capture-backup-{}", Uuid::new_v4()));

        let mut api = MockDescriptionApi::new();
        api.expect_post_description()
            .times(1)
            .returning(|_| {
                Err(DescriptionUploadError::Status {
                    status: 500,
                    body: "down".into(),
                })
            });

        let uploader = DescriptionUploader::new(Arc::new(api), &root, &account());
        let summary = Summary::new(2, 0, 0);
        let result = uploader.upload("seq-1", &images(), &summary).await;
        assert!(matches!(result, Err(DescriptionUploadError::Status { status: 500, .. })));

        let backups: Vec<PathBuf> = std::fs::read_dir(root.join("user"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(backups.len(), 1);
        let name = backups[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_backup_request_org_none_seq-1.json"));

        let saved: Value = serde_json::from_slice(&std::fs::read(&backups[0]).unwrap()).unwrap();
        assert_eq!(saved["options"]["parameters"]["organization_key"], "org");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_posts_payload() {
        let root = std::env::temp_dir().join(format!("capture-backup-{}", Uuid::new_v4()));

        let mut api = MockDescriptionApi::new();
        api.expect_post_description()
            .withf(|payload| payload["options"]["parameters"]["json_data"].as_array().map(Vec::len) == Some(2))
            .times(1)
            .returning(|_| Ok(()));

        let uploader = DescriptionUploader::new(Arc::new(api), &root, &account());
        uploader
            .upload("seq-1", &images(), &Summary::new(2, 0, 0))
            .await
            .unwrap();

        std::fs::remove_dir_all(&root).unwrap();
    }
}
