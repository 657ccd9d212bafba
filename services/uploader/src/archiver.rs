//! Sequence archives.
//!
//! An archive's identity is the MD5 of its members' image bytes concatenated
//! in capture-time order, not of the zip container, so re-zipping the same
//! sequence always yields the same session key.

use capture_sequencer::ImageDescription;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::CompressionMethod;

/// Errors raised while building archives
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("no common root directory for the sequence images")]
    NoCommonRoot,

    #[error("sequence {0} has no images")]
    EmptySequence(String),
}

impl ArchiveError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Supplies the bytes stored for each image.
///
/// The default reads the file as is; a reader that rewrites EXIF tags from
/// the description can be plugged in instead.
pub trait ImageReader: Send + Sync {
    fn read_image(&self, path: &Path, description: &ImageDescription) -> Result<Vec<u8>, ArchiveError>;
}

/// Reads image files unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawImageReader;

impl ImageReader for RawImageReader {
    fn read_image(&self, path: &Path, _description: &ImageDescription) -> Result<Vec<u8>, ArchiveError> {
        std::fs::read(path).map_err(|e| ArchiveError::io(path, e))
    }
}

/// Deepest directory containing every path.
///
/// A single path gives its own directory. `None` when the paths share no
/// directory at all.
pub fn find_root_dir<P: AsRef<Path>>(paths: &[P]) -> Option<PathBuf> {
    let dirs: BTreeSet<&Path> = paths
        .iter()
        .map(|p| p.as_ref().parent())
        .collect::<Option<_>>()?;

    let mut dirs = dirs.into_iter();
    let first = dirs.next()?;
    let mut common: Vec<Component> = first.components().collect();

    for dir in dirs {
        let shared = common
            .iter()
            .zip(dir.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        common.truncate(shared);
    }

    if common.is_empty() {
        return None;
    }
    Some(common.iter().collect())
}

/// Name of a file inside the archive, always `/`-separated.
fn entry_name(path: &Path, root: &Path) -> Result<String, ArchiveError> {
    let relative = path.strip_prefix(root).map_err(|_| ArchiveError::NoCommonRoot)?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Write a sequence into a deflate zip and return its content hash.
///
/// Members are stored in capture-time order (ties keep their order) at their
/// path relative to the common root of all members.
pub fn zip_sequence<W: Write + Seek>(
    import_path: &Path,
    members: &[ImageDescription],
    output: W,
    reader: &dyn ImageReader,
) -> Result<String, ArchiveError> {
    let paths: Vec<PathBuf> = members.iter().map(|m| m.image_path(import_path)).collect();
    let root = find_root_dir(&paths).ok_or(ArchiveError::NoCommonRoot)?;

    let mut order: Vec<usize> = (0..members.len()).collect();
    order.sort_by(|a, b| members[*a].capture_time.cmp(&members[*b].capture_time));

    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = zip::ZipWriter::new(output);
    let mut hasher = md5::Context::new();

    for idx in order {
        let path = &paths[idx];
        let bytes = reader.read_image(path, &members[idx])?;
        hasher.consume(&bytes);

        let name = entry_name(path, &root)?;
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&bytes).map_err(|e| ArchiveError::io(path, e))?;
        debug!(entry = %name, bytes = bytes.len(), "Added image to archive");
    }

    let mut output = zip.finish()?;
    output.flush().map_err(zip::result::ZipError::from)?;
    Ok(format!("{:x}", hasher.compute()))
}

/// Zip into `file` and make sure every byte reached the disk.
fn write_archive(
    import_path: &Path,
    members: &[ImageDescription],
    file: File,
    path: &Path,
    reader: &dyn ImageReader,
) -> Result<String, ArchiveError> {
    let mut writer = BufWriter::new(file);
    let hash = zip_sequence(import_path, members, &mut writer, reader)?;
    let file = writer
        .into_inner()
        .map_err(|e| ArchiveError::io(path, e.into_error()))?;
    file.sync_all().map_err(|e| ArchiveError::io(path, e))?;
    Ok(hash)
}

/// Session key of an archive with the given content hash.
pub fn session_key(prefix: &str, hash: &str) -> String {
    format!("{}_{}.zip", prefix, hash)
}

/// A sequence archive on disk
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedSequence {
    pub sequence_uuid: String,
    pub path: PathBuf,
    pub hash: String,
    pub session_key: String,
    pub image_count: usize,
    pub size_bytes: u64,
}

impl ArchivedSequence {
    pub fn size_mib(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Zip a sequence into `work_dir` under its content-addressed name.
///
/// The archive is written to a `.wip` file first and renamed once complete,
/// so a finished `<prefix>_<md5>.zip` is never partial.
#[instrument(skip(import_path, members, reader), fields(images = members.len()))]
pub fn archive_sequence(
    import_path: &Path,
    sequence_uuid: &str,
    members: &[ImageDescription],
    work_dir: &Path,
    prefix: &str,
    reader: &dyn ImageReader,
) -> Result<ArchivedSequence, ArchiveError> {
    if members.is_empty() {
        return Err(ArchiveError::EmptySequence(sequence_uuid.to_string()));
    }
    std::fs::create_dir_all(work_dir).map_err(|e| ArchiveError::io(work_dir, e))?;

    let wip_path = work_dir.join(format!(
        "{}_{}.{}.wip",
        prefix,
        Uuid::new_v4().simple(),
        std::process::id()
    ));

    let file = File::create(&wip_path).map_err(|e| ArchiveError::io(&wip_path, e))?;
    let hash = match write_archive(import_path, members, file, &wip_path, reader) {
        Ok(hash) => hash,
        Err(e) => {
            let _ = std::fs::remove_file(&wip_path);
            return Err(e);
        }
    };

    let session_key = session_key(prefix, &hash);
    let path = work_dir.join(&session_key);
    std::fs::rename(&wip_path, &path).map_err(|e| ArchiveError::io(&path, e))?;
    let size_bytes = std::fs::metadata(&path)
        .map_err(|e| ArchiveError::io(&path, e))?
        .len();

    info!(
        sequence = %sequence_uuid,
        archive = %path.display(),
        images = members.len(),
        size_bytes = size_bytes,
        "Sequence archived"
    );

    Ok(ArchivedSequence {
        sequence_uuid: sequence_uuid.to_string(),
        path,
        hash,
        session_key,
        image_count: members.len(),
        size_bytes,
    })
}

/// Number of entries in an existing zip file.
pub fn zip_entry_count(path: &Path) -> Result<usize, ArchiveError> {
    let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let archive = zip::ZipArchive::new(file)?;
    Ok(archive.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_sequencer::description::parse_descriptions;
    use std::io::{Cursor, Read};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("capture-archiver-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Three images written out of capture order, plus their descriptions.
    fn fixture(dir: &Path) -> Vec<ImageDescription> {
        std::fs::create_dir_all(dir.join("seq/a")).unwrap();
        std::fs::write(dir.join("seq/a/1.jpg"), b"first image").unwrap();
        std::fs::write(dir.join("seq/a/2.jpg"), b"second image").unwrap();
        std::fs::write(dir.join("seq/3.jpg"), b"third image").unwrap();

        parse_descriptions(
            r#"[
                {"path": "seq/a", "filename": "2.jpg", "latitude": 41.0, "longitude": 29.0, "captureTime": "2023-05-01 10:00:01"},
                {"path": "seq", "filename": "3.jpg", "latitude": 41.0, "longitude": 29.0, "captureTime": "2023-05-01 10:00:02"},
                {"path": "seq/a", "filename": "1.jpg", "latitude": 41.0, "longitude": 29.0, "captureTime": "2023-05-01 10:00:00"}
            ]"#
            .as_bytes(),
            "test",
        )
        .unwrap()
        .images
    }

    #[test]
    fn test_find_root_dir() {
        assert_eq!(
            find_root_dir(&["/data/seq/a/1.jpg", "/data/seq/b/2.jpg"]),
            Some(PathBuf::from("/data/seq"))
        );
        assert_eq!(
            find_root_dir(&["/data/seq/1.jpg", "/data/seq/a/2.jpg"]),
            Some(PathBuf::from("/data/seq"))
        );
        // a single image gives its own directory
        assert_eq!(
            find_root_dir(&["/data/seq/1.jpg"]),
            Some(PathBuf::from("/data/seq"))
        );
        assert_eq!(find_root_dir(&["a/1.jpg", "b/2.jpg"]), None);
        assert_eq!(find_root_dir::<&str>(&[]), None);
    }

    #[test]
    fn test_zip_sequence_orders_and_hashes_payloads() {
        let dir = temp_dir();
        let members = fixture(&dir);

        let mut buffer = Cursor::new(Vec::new());
        let hash = zip_sequence(&dir, &members, &mut buffer, &RawImageReader).unwrap();

        let expected = format!("{:x}", md5::compute(b"first imagesecond imagethird image"));
        assert_eq!(hash, expected);

        let mut archive = zip::ZipArchive::new(Cursor::new(buffer.into_inner())).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["a/1.jpg", "a/2.jpg", "3.jpg"]);

        let mut content = String::new();
        archive.by_name("a/2.jpg").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "second image");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_hash_is_stable_across_zips() {
        let dir = temp_dir();
        let members = fixture(&dir);

        let first = zip_sequence(&dir, &members, Cursor::new(Vec::new()), &RawImageReader).unwrap();
        let mut reversed = members.clone();
        reversed.reverse();
        let second = zip_sequence(&dir, &reversed, Cursor::new(Vec::new()), &RawImageReader).unwrap();
        assert_eq!(first, second);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_archive_sequence_renames_to_session_key() {
        let dir = temp_dir();
        let members = fixture(&dir);
        let work_dir = dir.join("work");

        let archived = archive_sequence(&dir, "seq-1", &members, &work_dir, "capture_kit", &RawImageReader).unwrap();

        assert_eq!(archived.session_key, format!("capture_kit_{}.zip", archived.hash));
        assert_eq!(archived.path, work_dir.join(&archived.session_key));
        assert!(archived.path.is_file());
        assert_eq!(archived.image_count, 3);
        assert_eq!(zip_entry_count(&archived.path).unwrap(), 3);

        let leftovers: Vec<_> = std::fs::read_dir(&work_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "wip"))
            .collect();
        assert!(leftovers.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    /// Accepts writes but fails every flush, like a full disk behind a buffer.
    struct FailingFlush(Cursor<Vec<u8>>);

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
        }
    }

    impl Seek for FailingFlush {
        fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
            self.0.seek(pos)
        }
    }

    #[test]
    fn test_flush_failure_is_reported() {
        let dir = temp_dir();
        let members = fixture(&dir);

        let result = zip_sequence(&dir, &members, FailingFlush(Cursor::new(Vec::new())), &RawImageReader);
        assert!(matches!(result, Err(ArchiveError::Zip(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_image_fails() {
        let dir = temp_dir();
        let members = fixture(&dir);
        std::fs::remove_file(dir.join("seq/3.jpg")).unwrap();

        let result = archive_sequence(&dir, "seq-1", &members, &dir.join("work"), "capture_kit", &RawImageReader);
        assert!(matches!(result, Err(ArchiveError::Io { .. })));

        let result = archive_sequence(&dir, "seq-1", &[], &dir.join("work"), "capture_kit", &RawImageReader);
        assert!(matches!(result, Err(ArchiveError::EmptySequence(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
