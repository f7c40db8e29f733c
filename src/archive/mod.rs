pub mod tarzst;
pub mod zipfile;

use crate::error::{ImportError, ImportResult, IoContext};
use crate::metadata::{self, CourseMetadata};
use crate::progress::{PercentCallback, PercentTracker};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info};

pub use tarzst::TarZstBackend;
pub use zipfile::ZipBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarZst,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> ImportResult<Self> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            Ok(ArchiveKind::Zip)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Ok(ArchiveKind::TarZst)
        } else {
            let ext = path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default();
            Err(ImportError::UnsupportedArchive(ext))
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::TarZst => "tar.zst",
        }
    }
}

/// One archive format. Implementations decide for themselves whether a single
/// member can be read without unpacking everything.
pub trait ArchiveBackend: Send + Sync {
    fn supports_metadata_peek(&self) -> bool {
        true
    }

    fn list(&self, archive: &Path) -> ImportResult<Vec<String>>;

    fn extract_all(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &PercentTracker<'_>,
    ) -> ImportResult<()>;

    fn extract_one(&self, archive: &Path, entry: &str) -> ImportResult<Vec<u8>>;

    fn read_descriptor(&self, archive: &Path) -> ImportResult<Vec<u8>> {
        let entries = self.list(archive)?;
        let entry = entries
            .iter()
            .map(|name| name.trim())
            .find(|name| metadata::is_descriptor_entry(name))
            .ok_or(ImportError::DescriptorMissing)?;
        self.extract_one(archive, entry)
    }
}

pub struct ArchiveExtractor {
    zip: ZipBackend,
    tar_zst: TarZstBackend,
}

impl ArchiveExtractor {
    pub fn new(zip: ZipBackend, tar_zst: TarZstBackend) -> Self {
        Self { zip, tar_zst }
    }

    pub fn backend(&self, kind: ArchiveKind) -> &dyn ArchiveBackend {
        match kind {
            ArchiveKind::Zip => &self.zip,
            ArchiveKind::TarZst => &self.tar_zst,
        }
    }

    pub fn supports_metadata_peek(&self, archive: &Path) -> ImportResult<bool> {
        let kind = ArchiveKind::detect(archive)?;
        Ok(self.backend(kind).supports_metadata_peek())
    }

    /// Unpacks `archive` and leaves the package root at
    /// `destination_root/<course id>`, replacing whatever was there.
    pub fn extract_archive(
        &self,
        archive: &Path,
        destination_root: &Path,
        on_progress: Option<PercentCallback<'_>>,
    ) -> ImportResult<PathBuf> {
        let result = self
            .extract_staged(archive, destination_root, on_progress)
            .and_then(StagedCourse::commit);
        if let Err(err) = &result {
            error!(archive = %archive.display(), "Error extracting archive: {err}");
        }
        result
    }

    /// Unpacks `archive` into a scratch directory under `destination_root`
    /// and reads its descriptor, without touching `destination_root/<id>`.
    /// Dropping the returned value discards the extracted files.
    pub fn extract_staged(
        &self,
        archive: &Path,
        destination_root: &Path,
        on_progress: Option<PercentCallback<'_>>,
    ) -> ImportResult<StagedCourse> {
        let scratch = ScratchDir::create(destination_root)?;
        let kind = ArchiveKind::detect(archive)?;
        let tracker = PercentTracker::new(on_progress);

        info!(archive = %archive.display(), kind = kind.label(), "extracting archive");
        self.backend(kind)
            .extract_all(archive, scratch.path(), &tracker)?;
        tracker.finish();

        let package_root = metadata::find_descriptor_root(scratch.path())
            .ok_or(ImportError::DescriptorMissing)?;
        let metadata = metadata::read_descriptor(&package_root)?;
        metadata.check_id()?;
        Ok(StagedCourse {
            _scratch: scratch,
            package_root,
            destination_root: destination_root.to_path_buf(),
            metadata,
        })
    }

    pub fn extract_metadata_only(&self, archive: &Path) -> ImportResult<CourseMetadata> {
        let kind = ArchiveKind::detect(archive)?;
        let backend = self.backend(kind);
        if !backend.supports_metadata_peek() {
            return Err(ImportError::MetadataPeekUnsupported);
        }
        let bytes = backend.read_descriptor(archive)?;
        metadata::parse_descriptor(&bytes)
    }
}

/// An extracted package waiting in its scratch directory.
pub struct StagedCourse {
    _scratch: ScratchDir,
    package_root: PathBuf,
    destination_root: PathBuf,
    metadata: CourseMetadata,
}

impl StagedCourse {
    pub fn metadata(&self) -> &CourseMetadata {
        &self.metadata
    }

    /// Moves the package root to `destination_root/<id>`, replacing whatever
    /// was there.
    pub fn commit(self) -> ImportResult<PathBuf> {
        let final_path = self.destination_root.join(&self.metadata.id);
        if final_path.exists() {
            debug!(path = %final_path.display(), "replacing existing course directory");
            fs::remove_dir_all(&final_path)
                .io_context(format!("remove {}", final_path.display()))?;
        }
        fs::rename(&self.package_root, &final_path).io_context(format!(
            "move {} to {}",
            self.package_root.display(),
            final_path.display()
        ))?;
        Ok(final_path)
    }
}

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Temporary extraction directory, removed when dropped.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(destination_root: &Path) -> ImportResult<Self> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let counter = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = destination_root.join(format!(".temp-extract-{millis}-{counter}"));
        fs::create_dir_all(&path).io_context(format!("create {}", path.display()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::tests::descriptor_json;
    use std::{fs::File, io::Write, sync::Mutex};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    /// Builds a zip holding `files` (path, contents); paths ending in `/` become
    /// directory entries.
    pub(crate) fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, contents) in files {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    pub(crate) fn write_tar_zst(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = zstd::stream::write::Encoder::new(file, 3).unwrap().auto_finish();
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap();
    }

    pub(crate) fn course_zip(dir: &Path, id: &str, build_at: &str) -> PathBuf {
        let path = dir.join(format!("{id}.zip"));
        let descriptor = descriptor_json(id, build_at);
        write_zip(
            &path,
            &[
                ("package/", b""),
                ("package/metadata.json", descriptor.as_bytes()),
                ("package/icon.png", b"\x89PNG fake"),
                ("package/lessons/intro.mp4", b"video bytes"),
                ("package/lessons/setup.md", b"# Setup"),
            ],
        );
        path
    }

    pub(crate) fn native_extractor() -> ArchiveExtractor {
        ArchiveExtractor::new(
            ZipBackend::default(),
            TarZstBackend::new("coursekeeper-test-missing-tar"),
        )
    }

    fn leftover_scratch(root: &Path) -> Vec<PathBuf> {
        fs::read_dir(root)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().starts_with(".temp-extract-"))
                    .unwrap_or(false)
            })
            .collect()
    }

    #[test]
    fn detects_archive_kinds() {
        assert_eq!(ArchiveKind::detect(Path::new("a/b.zip")).unwrap(), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::detect(Path::new("b.ZIP")).unwrap(), ArchiveKind::Zip);
        assert_eq!(
            ArchiveKind::detect(Path::new("b.tar.zst")).unwrap(),
            ArchiveKind::TarZst
        );
        assert_eq!(ArchiveKind::detect(Path::new("b.tzst")).unwrap(), ArchiveKind::TarZst);
        let err = ArchiveKind::detect(Path::new("b.rar")).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported archive type: .rar");
    }

    #[test]
    fn zip_lands_under_course_id_and_scratch_is_removed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let archive = course_zip(temp.path(), "rust-101", "2024-01-01T00:00:00Z");

        let seen = Mutex::new(Vec::new());
        let callback = |value: u8| seen.lock().unwrap().push(value);
        let final_dir = native_extractor()
            .extract_archive(&archive, &root, Some(&callback))
            .unwrap();

        assert_eq!(final_dir, root.join("rust-101"));
        assert!(final_dir.join("metadata.json").is_file());
        assert!(final_dir.join("lessons/intro.mp4").is_file());
        assert!(leftover_scratch(&root).is_empty());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn existing_course_directory_is_replaced() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let stale = root.join("rust-101");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("stale.txt"), "old").unwrap();
        let archive = course_zip(temp.path(), "rust-101", "2024-01-01T00:00:00Z");

        let final_dir = native_extractor()
            .extract_archive(&archive, &root, None)
            .unwrap();
        assert!(!final_dir.join("stale.txt").exists());
        assert!(final_dir.join("metadata.json").is_file());
    }

    #[test]
    fn missing_descriptor_fails_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let archive = temp.path().join("empty.zip");
        write_zip(&archive, &[("readme.txt", b"hello")]);

        let err = native_extractor()
            .extract_archive(&archive, &root, None)
            .unwrap_err();
        assert!(matches!(err, ImportError::DescriptorMissing));
        assert!(leftover_scratch(&root).is_empty());
    }

    #[test]
    fn descriptor_without_id_fails_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let archive = temp.path().join("anon.zip");
        write_zip(&archive, &[("c/metadata.json", br#"{"name": "anon"}"#)]);

        let err = native_extractor()
            .extract_archive(&archive, &root, None)
            .unwrap_err();
        assert!(matches!(err, ImportError::MissingCourseId));
        assert!(leftover_scratch(&root).is_empty());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn dot_id_fails_without_touching_installed_courses() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let installed = root.join("rust-101");
        fs::create_dir_all(&installed).unwrap();
        fs::write(installed.join("keep.txt"), "mine").unwrap();

        for (name, id) in [("dot", "."), ("up", ".."), ("nested", "a/b")] {
            let archive = temp.path().join(format!("{name}.zip"));
            let descriptor = format!(r#"{{"id": {id:?}}}"#);
            write_zip(&archive, &[("p/metadata.json", descriptor.as_bytes())]);
            let err = native_extractor()
                .extract_archive(&archive, &root, None)
                .unwrap_err();
            assert!(matches!(err, ImportError::InvalidCourseId(_)), "{id}: {err}");
        }
        assert!(installed.join("keep.txt").is_file());
        assert!(leftover_scratch(&root).is_empty());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("course.7z");
        fs::write(&archive, b"whatever").unwrap();
        let err = native_extractor()
            .extract_archive(&archive, temp.path(), None)
            .unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedArchive(_)));
        assert!(leftover_scratch(temp.path()).is_empty());
    }

    #[test]
    fn metadata_only_reads_zip_descriptor() {
        let temp = TempDir::new().unwrap();
        let archive = course_zip(temp.path(), "go-201", "2024-05-01T00:00:00Z");
        let meta = native_extractor().extract_metadata_only(&archive).unwrap();
        assert_eq!(meta.id, "go-201");
        assert_eq!(meta.chapters.len(), 2);
    }

    #[test]
    fn metadata_only_reads_tar_zst_descriptor() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("course.tar.zst");
        let descriptor = descriptor_json("zig-1", "2024-05-01T00:00:00Z");
        write_tar_zst(
            &archive,
            &[
                ("zig-1/icon.png", b"png"),
                ("zig-1/metadata.json", descriptor.as_bytes()),
            ],
        );
        let meta = native_extractor().extract_metadata_only(&archive).unwrap();
        assert_eq!(meta.id, "zig-1");
    }

    #[test]
    fn tar_zst_extracts_to_course_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let archive = temp.path().join("course.tzst");
        let descriptor = descriptor_json("zig-1", "2024-05-01T00:00:00Z");
        write_tar_zst(
            &archive,
            &[
                ("bundle/zig-1-src/metadata.json", descriptor.as_bytes()),
                ("bundle/zig-1-src/lessons/a.md", b"# A"),
            ],
        );
        let final_dir = native_extractor()
            .extract_archive(&archive, &root, None)
            .unwrap();
        assert_eq!(final_dir, root.join("zig-1"));
        assert!(final_dir.join("lessons/a.md").is_file());
        assert!(leftover_scratch(&root).is_empty());
    }

    #[test]
    fn dropping_a_staged_course_leaves_destination_alone() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let existing = root.join("rust-101");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("keep.txt"), "mine").unwrap();
        let archive = course_zip(temp.path(), "rust-101", "2024-01-01T00:00:00Z");

        let staged = native_extractor()
            .extract_staged(&archive, &root, None)
            .unwrap();
        assert_eq!(staged.metadata().id, "rust-101");
        drop(staged);

        assert!(existing.join("keep.txt").is_file());
        assert!(leftover_scratch(&root).is_empty());
    }

    #[test]
    fn peek_is_refused_when_backend_cannot_stream_members() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("course.tar.zst");
        write_tar_zst(&archive, &[("c/metadata.json", br#"{"id": "c"}"#)]);
        let extractor = ArchiveExtractor::new(
            ZipBackend::default(),
            TarZstBackend::new("tar").with_codec(tarzst::CodecMode::Embedded),
        );
        assert!(!extractor.supports_metadata_peek(&archive).unwrap());
        let err = extractor.extract_metadata_only(&archive).unwrap_err();
        assert!(matches!(err, ImportError::MetadataPeekUnsupported));
    }
}
