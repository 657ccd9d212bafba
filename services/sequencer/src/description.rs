//! Per-image description records and the description file that carries them.
//!
//! A description file is a JSON array of image records, failed-image records
//! (objects carrying an `error` key) and one trailing `{"Information": {...}}`
//! summary entry.

use crate::point::{GeoPoint, Located};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Format of `captureTime` in description files
pub const CAPTURE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Same, keeping sub-second precision when there is any
const CAPTURE_TIME_PRECISE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Path that selects stdin/stdout instead of a file
pub const STDIO_PATH: &str = "-";

const INFORMATION_KEY: &str = "Information";
const ERROR_KEY: &str = "error";

/// Description file errors
#[derive(Error, Debug)]
pub enum DescriptionError {
    #[error("image description file {0} not found, process the images first")]
    NotFound(PathBuf),

    #[error("invalid JSON in {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid image description at index {index}: {message}")]
    InvalidEntry { index: usize, message: String },

    #[error("image {0} referenced by the description file does not exist")]
    MissingImage(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Serde adapter for `captureTime`.
pub mod capture_time {
    use super::{CAPTURE_TIME_FORMAT, CAPTURE_TIME_PRECISE_FORMAT};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(time: &NaiveDateTime) -> String {
        time.format(CAPTURE_TIME_FORMAT).to_string()
    }

    /// Parse a capture time, accepting optional fractional seconds.
    pub fn parse(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        NaiveDateTime::parse_from_str(value, CAPTURE_TIME_PRECISE_FORMAT)
    }

    pub fn serialize<S: Serializer>(time: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(CAPTURE_TIME_PRECISE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let value = String::deserialize(deserializer)?;
        parse(&value).map_err(serde::de::Error::custom)
    }
}

/// Final per-image record consumed by archiving and upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescription {
    /// Directory of the image, relative to the import root
    #[serde(default)]
    pub path: String,
    /// File name of the image
    #[serde(default)]
    pub filename: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(with = "capture_time")]
    pub capture_time: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Compass heading in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_uuid: Option<String>,
    /// Which pipeline produced the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fov: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<i64>,
    /// 0 once the record passed the anomaly checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<u8>,
    /// Any other metadata, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageDescription {
    /// Seconds since the Unix epoch, treating the capture time as UTC.
    pub fn timestamp(&self) -> f64 {
        self.capture_time.and_utc().timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn capture_time_str(&self) -> String {
        capture_time::format(&self.capture_time)
    }

    pub fn to_geo_point(&self) -> GeoPoint {
        GeoPoint {
            time: self.timestamp(),
            lat: self.latitude,
            lon: self.longitude,
            altitude: self.altitude,
            heading: self.heading,
        }
    }

    /// Path relative to the import root.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.path).join(&self.filename)
    }

    /// Location of the image on disk.
    pub fn image_path(&self, import_path: &Path) -> PathBuf {
        import_path.join(self.relative_path())
    }

    /// Split the record back into the stage records it was merged from.
    ///
    /// Sequence assignment and source tag are dropped; the sequence pass
    /// derives them again.
    pub fn into_records(self) -> (GeotagRecord, MetadataRecord) {
        let geotag = GeotagRecord {
            path: self.path,
            filename: self.filename,
            latitude: self.latitude,
            longitude: self.longitude,
            capture_time: self.capture_time,
            altitude: self.altitude,
            heading: self.heading,
        };
        let metadata = MetadataRecord {
            photo_uuid: self.photo_uuid,
            device_make: self.device_make,
            device_model: self.device_model,
            camera_uuid: self.camera_uuid,
            image_size: self.image_size,
            fov: self.fov,
            orientation: self.orientation,
            extra: self.extra,
        };
        (geotag, metadata)
    }
}

impl Located for ImageDescription {
    fn lat(&self) -> f64 {
        self.latitude
    }

    fn lon(&self) -> f64 {
        self.longitude
    }

    fn time(&self) -> f64 {
        self.timestamp()
    }
}

/// Output of the geotagging pass
#[derive(Debug, Clone, PartialEq)]
pub struct GeotagRecord {
    pub path: String,
    pub filename: String,
    pub latitude: f64,
    pub longitude: f64,
    pub capture_time: NaiveDateTime,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
}

impl GeotagRecord {
    pub fn timestamp(&self) -> f64 {
        self.capture_time.and_utc().timestamp_micros() as f64 / 1_000_000.0
    }
}

impl Located for GeotagRecord {
    fn lat(&self) -> f64 {
        self.latitude
    }

    fn lon(&self) -> f64 {
        self.longitude
    }

    fn time(&self) -> f64 {
        self.timestamp()
    }
}

/// Output of the sequence pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceRecord {
    pub sequence_uuid: Option<String>,
    pub heading: Option<f64>,
    pub source: Option<String>,
}

/// Output of the import-metadata pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataRecord {
    pub photo_uuid: Option<String>,
    pub device_make: Option<String>,
    pub device_model: Option<String>,
    pub camera_uuid: Option<String>,
    pub image_size: Option<String>,
    pub fov: Option<f64>,
    pub orientation: Option<i64>,
    pub extra: Map<String, Value>,
}

fn overlay<T>(earlier: Option<T>, later: Option<T>) -> Option<T> {
    later.or(earlier)
}

/// Merge the three stage records into the final description.
///
/// Stages apply in order geotag, sequence, metadata; a field set by a later
/// stage wins over the same field from an earlier one.
pub fn merge_records(
    geotag: GeotagRecord,
    sequence: SequenceRecord,
    metadata: MetadataRecord,
) -> ImageDescription {
    let heading = overlay(geotag.heading, sequence.heading);

    ImageDescription {
        path: geotag.path,
        filename: geotag.filename,
        latitude: geotag.latitude,
        longitude: geotag.longitude,
        capture_time: geotag.capture_time,
        altitude: geotag.altitude,
        heading,
        sequence_uuid: sequence.sequence_uuid,
        source: sequence.source,
        photo_uuid: metadata.photo_uuid,
        device_make: metadata.device_make,
        device_model: metadata.device_model,
        camera_uuid: metadata.camera_uuid,
        image_size: metadata.image_size,
        fov: metadata.fov,
        orientation: metadata.orientation,
        anomaly: None,
        extra: metadata.extra,
    }
}

/// Aggregate counts appended as the trailing `Information` entry.
///
/// `total_images = processed_images + failed_images`; duplicates are counted
/// in `failed_images` and also reported on their own in `duplicated_images`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_images: usize,
    pub processed_images: usize,
    pub failed_images: usize,
    pub duplicated_images: usize,
    /// Run id
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_device_type() -> String {
    "Desktop".to_string()
}

impl Summary {
    pub fn new(total_images: usize, failed_images: usize, duplicated_images: usize) -> Self {
        let failed_images = failed_images.min(total_images);
        Self {
            total_images,
            processed_images: total_images - failed_images,
            failed_images,
            duplicated_images: duplicated_images.min(failed_images),
            id: Uuid::new_v4().simple().to_string(),
            group_key: None,
            device_type: default_device_type(),
            extra: Map::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total_images == self.processed_images + self.failed_images
            && self.duplicated_images <= self.failed_images
    }
}

/// Why an image did not make it into a sequence
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageFailure {
    #[error("geotagging failed for {path}/{filename}: {message}")]
    GeoTagging {
        path: String,
        filename: String,
        message: String,
    },

    #[error("duplicate of the previous image, {distance:.3} m apart")]
    Duplication {
        description: Box<ImageDescription>,
        distance: f64,
    },
}

impl ImageFailure {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ImageFailure::Duplication { .. })
    }

    pub fn to_entry(&self) -> FailedEntry {
        match self {
            ImageFailure::GeoTagging {
                path,
                filename,
                message,
            } => FailedEntry {
                path: path.clone(),
                filename: filename.clone(),
                error: serde_json::json!({
                    "type": "GeoTaggingError",
                    "message": message,
                }),
            },
            ImageFailure::Duplication { description, .. } => FailedEntry {
                path: description.path.clone(),
                filename: description.filename.clone(),
                error: serde_json::json!({
                    "type": "DuplicationError",
                    "message": self.to_string(),
                    "vars": { "desc": description },
                }),
            },
        }
    }
}

/// A failed image as it appears in the description file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntry {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub filename: String,
    pub error: Value,
}

impl FailedEntry {
    pub fn error_type(&self) -> Option<&str> {
        self.error.get("type").and_then(Value::as_str)
    }

    pub fn is_duplicate(&self) -> bool {
        self.error_type() == Some("DuplicationError")
    }
}

/// Contents of a description file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptionFile {
    pub images: Vec<ImageDescription>,
    pub failures: Vec<FailedEntry>,
    pub information: Option<Summary>,
}

fn open_input(path: &Path) -> Result<(Box<dyn Read>, String), DescriptionError> {
    if path == Path::new(STDIO_PATH) {
        return Ok((Box::new(std::io::stdin()), "stdin".to_string()));
    }
    if !path.is_file() {
        return Err(DescriptionError::NotFound(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|source| DescriptionError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok((Box::new(BufReader::new(file)), path.display().to_string()))
}

/// Parse a description array from any reader.
pub fn parse_descriptions<R: Read>(reader: R, origin: &str) -> Result<DescriptionFile, DescriptionError> {
    let entries: Vec<Value> = serde_json::from_reader(reader).map_err(|source| DescriptionError::Parse {
        origin: origin.to_string(),
        source,
    })?;

    let mut file = DescriptionFile::default();
    for (index, entry) in entries.into_iter().enumerate() {
        let invalid = |e: serde_json::Error| DescriptionError::InvalidEntry {
            index,
            message: e.to_string(),
        };

        if let Some(information) = entry.get(INFORMATION_KEY) {
            file.information = Some(serde_json::from_value(information.clone()).map_err(invalid)?);
        } else if entry.get(ERROR_KEY).is_some() {
            file.failures.push(serde_json::from_value(entry).map_err(invalid)?);
        } else {
            file.images.push(serde_json::from_value(entry).map_err(invalid)?);
        }
    }

    debug!(
        origin = %origin,
        images = file.images.len(),
        failures = file.failures.len(),
        "Parsed description file"
    );
    Ok(file)
}

/// Read a whole description file, `-` for stdin.
pub fn read_description_file(path: &Path) -> Result<DescriptionFile, DescriptionError> {
    let (reader, origin) = open_input(path)?;
    parse_descriptions(reader, &origin)
}

/// Read the images that are ready for upload.
///
/// Failed entries and images without a heading (which never went through
/// the sequence pass) are dropped; the `Information` entry is kept.
pub fn read_image_descriptions(path: &Path) -> Result<DescriptionFile, DescriptionError> {
    let mut file = read_description_file(path)?;

    let before = file.images.len();
    file.images.retain(|desc| desc.heading.is_some());
    if file.images.len() < before {
        debug!(
            dropped = before - file.images.len(),
            "Dropped images without heading"
        );
    }
    file.failures.clear();

    Ok(file)
}

/// Write images, failures and the summary as one JSON array, `-` for stdout.
pub fn write_description_file(path: &Path, file: &DescriptionFile) -> Result<(), DescriptionError> {
    let mut entries: Vec<Value> = Vec::with_capacity(file.images.len() + file.failures.len() + 1);
    let to_value = |e: serde_json::Error| DescriptionError::Parse {
        origin: path.display().to_string(),
        source: e,
    };

    for image in &file.images {
        entries.push(serde_json::to_value(image).map_err(to_value)?);
    }
    for failure in &file.failures {
        entries.push(serde_json::to_value(failure).map_err(to_value)?);
    }
    if let Some(information) = &file.information {
        entries.push(serde_json::json!({ INFORMATION_KEY: information }));
    }

    let io_error = |source| DescriptionError::Io {
        path: path.display().to_string(),
        source,
    };

    if path == Path::new(STDIO_PATH) {
        let stdout = std::io::stdout();
        let mut writer = stdout.lock();
        serde_json::to_writer_pretty(&mut writer, &entries).map_err(to_value)?;
        writer.write_all(b"\n").map_err(io_error)?;
    } else {
        let mut writer = BufWriter::new(File::create(path).map_err(io_error)?);
        serde_json::to_writer_pretty(&mut writer, &entries).map_err(to_value)?;
        writer.flush().map_err(io_error)?;
    }

    info!(
        path = %path.display(),
        images = file.images.len(),
        failures = file.failures.len(),
        "Wrote description file"
    );
    Ok(())
}

/// Stable photo identifier: `md5("<email>--<captureTime>")` as hex.
pub fn photo_uuid(email: &str, capture_time: &NaiveDateTime) -> String {
    let digest = md5::compute(format!("{}--{}", email, capture_time::format(capture_time)));
    format!("{:x}", digest)
}

/// Assign a photo identifier to every image.
pub fn assign_photo_uuids(images: &mut [ImageDescription], email: &str) {
    for image in images {
        image.photo_uuid = Some(photo_uuid(email, &image.capture_time));
    }
}

/// Check that every image exists under `import_path`.
pub fn validate_image_files(images: &[ImageDescription], import_path: &Path) -> Result<(), DescriptionError> {
    for image in images {
        let image_path = image.image_path(import_path);
        if !image_path.is_file() {
            return Err(DescriptionError::MissingImage(image_path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"[
            {"path": "a", "filename": "1.jpg", "latitude": 41.0, "longitude": 29.0,
             "captureTime": "2023-05-01 10:00:00", "heading": 12.5, "deviceMake": "GoPro",
             "megapixels": 12},
            {"path": "a", "filename": "2.jpg", "latitude": 41.001, "longitude": 29.0,
             "captureTime": "2023-05-01 10:00:01.500"},
            {"path": "a", "filename": "3.jpg", "error": {"type": "GeoTaggingError", "message": "no GPS"}},
            {"Information": {"total_images": 3, "processed_images": 2, "failed_images": 1,
             "duplicated_images": 0, "id": "abc", "device_type": "Desktop"}}
        ]"#
    }

    #[test]
    fn test_parse_descriptions_classifies_entries() {
        let file = parse_descriptions(sample_json().as_bytes(), "test").unwrap();

        assert_eq!(file.images.len(), 2);
        assert_eq!(file.failures.len(), 1);
        assert_eq!(file.failures[0].error_type(), Some("GeoTaggingError"));

        let info = file.information.unwrap();
        assert_eq!(info.total_images, 3);
        assert!(info.is_consistent());

        let first = &file.images[0];
        assert_eq!(first.device_make.as_deref(), Some("GoPro"));
        assert_eq!(first.extra.get("megapixels"), Some(&Value::from(12)));
        assert_eq!(first.relative_path(), PathBuf::from("a/1.jpg"));
        assert!((file.images[1].timestamp() - first.timestamp() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_descriptions_rejects_malformed() {
        let err = parse_descriptions("[{".as_bytes(), "test").unwrap_err();
        assert!(matches!(err, DescriptionError::Parse { .. }));

        let err = parse_descriptions(r#"[{"latitude": 1.0}]"#.as_bytes(), "test").unwrap_err();
        assert!(matches!(err, DescriptionError::InvalidEntry { index: 0, .. }));
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let file = parse_descriptions(sample_json().as_bytes(), "test").unwrap();
        let value = serde_json::to_value(&file.images[0]).unwrap();

        assert_eq!(value["captureTime"], "2023-05-01 10:00:00");
        assert_eq!(value["deviceMake"], "GoPro");
        assert_eq!(value["megapixels"], 12);
        assert!(value.get("sequenceUuid").is_none());
    }

    #[test]
    fn test_merge_later_stage_wins() {
        let file = parse_descriptions(sample_json().as_bytes(), "test").unwrap();
        let (geotag, metadata) = file.images[0].clone().into_records();

        let sequence = SequenceRecord {
            sequence_uuid: Some("seq".to_string()),
            heading: Some(90.0),
            source: Some("sequence".to_string()),
        };

        let merged = merge_records(geotag.clone(), sequence, metadata.clone());
        assert_eq!(merged.heading, Some(90.0));
        assert_eq!(merged.sequence_uuid.as_deref(), Some("seq"));
        assert_eq!(merged.source.as_deref(), Some("sequence"));
        assert_eq!(merged.device_make.as_deref(), Some("GoPro"));

        // an empty sequence stage keeps the geotag heading
        let merged = merge_records(geotag, SequenceRecord::default(), MetadataRecord::default());
        assert_eq!(merged.heading, Some(12.5));
        assert_eq!(merged.source, None);
    }

    #[test]
    fn test_summary_reconciles() {
        let summary = Summary::new(10, 3, 2);
        assert_eq!(summary.processed_images, 7);
        assert_eq!(summary.duplicated_images, 2);
        assert!(summary.is_consistent());
        assert_eq!(summary.id.len(), 32);

        let clamped = Summary::new(2, 5, 5);
        assert_eq!(clamped.failed_images, 2);
        assert_eq!(clamped.processed_images, 0);
        assert!(clamped.is_consistent());
    }

    #[test]
    fn test_photo_uuid_is_md5_of_email_and_time() {
        let time = capture_time::parse("2023-05-01 10:00:00").unwrap();
        let id = photo_uuid("user@example.com", &time);
        let expected = format!("{:x}", md5::compute("user@example.com--2023-05-01 10:00:00"));
        assert_eq!(id, expected);
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn test_duplicate_failure_entry() {
        let file = parse_descriptions(sample_json().as_bytes(), "test").unwrap();
        let failure = ImageFailure::Duplication {
            description: Box::new(file.images[1].clone()),
            distance: 0.05,
        };

        let entry = failure.to_entry();
        assert!(entry.is_duplicate());
        assert_eq!(entry.filename, "2.jpg");
        assert_eq!(entry.error["vars"]["desc"]["filename"], "2.jpg");
    }

    #[test]
    fn test_write_then_read_upload_view() {
        let dir = std::env::temp_dir().join(format!("capture-desc-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("description.json");

        let file = parse_descriptions(sample_json().as_bytes(), "test").unwrap();
        write_description_file(&path, &file).unwrap();

        let reread = read_description_file(&path).unwrap();
        assert_eq!(reread, file);

        let upload_view = read_image_descriptions(&path).unwrap();
        assert_eq!(upload_view.images.len(), 1);
        assert!(upload_view.failures.is_empty());
        assert!(upload_view.information.is_some());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_and_images() {
        let missing = Path::new("/nonexistent/description.json");
        assert!(matches!(
            read_description_file(missing),
            Err(DescriptionError::NotFound(_))
        ));

        let file = parse_descriptions(sample_json().as_bytes(), "test").unwrap();
        assert!(matches!(
            validate_image_files(&file.images, Path::new("/nonexistent")),
            Err(DescriptionError::MissingImage(_))
        ));
    }
}
