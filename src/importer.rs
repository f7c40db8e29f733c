use crate::archive::{ArchiveExtractor, StagedCourse};
use crate::catalog::{CatalogStore, CoursePreview};
use crate::duplicate::{self, DuplicateAction};
use crate::error::{ImportError, ImportResult, IoContext};
use crate::materializer::CourseMaterializer;
use crate::metadata::{self, CourseMetadata};
use crate::progress::{ImportEvent, ProgressSink};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};

/// Runs directory and archive imports against one catalog.
pub struct ImportOrchestrator {
    store: Arc<dyn CatalogStore>,
    extractor: ArchiveExtractor,
    materializer: CourseMaterializer,
    in_flight: Mutex<HashSet<String>>,
}

/// Held for the duration of one import of a course id.
struct ImportLock<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    course_id: String,
}

impl Drop for ImportLock<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.course_id);
        }
    }
}

impl ImportOrchestrator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        extractor: ArchiveExtractor,
        materializer: CourseMaterializer,
    ) -> Self {
        Self {
            store,
            extractor,
            materializer,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn root_path(&self) -> ImportResult<PathBuf> {
        self.store.root_path()?.ok_or(ImportError::RootPathNotSet)
    }

    fn lock(&self, course_id: &str) -> ImportResult<ImportLock<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| ImportError::ImportInProgress(course_id.to_string()))?;
        if !in_flight.insert(course_id.to_string()) {
            return Err(ImportError::ImportInProgress(course_id.to_string()));
        }
        Ok(ImportLock {
            in_flight: &self.in_flight,
            course_id: course_id.to_string(),
        })
    }

    /// Adds a course directory already sitting under the root. No duplicate
    /// check: hand-placed directories are taken as they are.
    pub fn import_directory(&self, dir_name: &str) -> ImportResult<CoursePreview> {
        let result = self.import_directory_inner(dir_name);
        if let Err(err) = &result {
            error!(dir = dir_name, "Error adding course: {err}");
        }
        result
    }

    fn import_directory_inner(&self, dir_name: &str) -> ImportResult<CoursePreview> {
        let course_dir = self.root_path()?.join(dir_name);
        if !course_dir.exists() {
            return Err(ImportError::DirectoryMissing(course_dir));
        }
        let meta = metadata::read_descriptor(&course_dir)?;
        meta.check_id()?;
        let _lock = self.lock(&meta.id)?;
        self.materializer.process(&meta, &course_dir)
    }

    /// Imports a course archive into the root, reporting extraction progress
    /// to `sink`.
    pub fn import_archive(
        &self,
        archive: &Path,
        sink: &dyn ProgressSink,
    ) -> ImportResult<CoursePreview> {
        let result = self.import_archive_inner(archive, sink);
        match &result {
            Ok(preview) => info!(course_id = %preview.id, archive = %archive.display(), "course imported"),
            Err(err) => error!(archive = %archive.display(), "Error during course import: {err}"),
        }
        result
    }

    fn import_archive_inner(
        &self,
        archive: &Path,
        sink: &dyn ProgressSink,
    ) -> ImportResult<CoursePreview> {
        let root = self.root_path()?;
        if self.extractor.supports_metadata_peek(archive)? {
            self.import_with_peek(archive, &root, sink)
        } else {
            self.import_extract_first(archive, &root, sink)
        }
    }

    /// Reads the descriptor straight from the archive and only unpacks once
    /// the duplicate check has passed. The unpacked package must carry the
    /// same id as the peeked descriptor before it replaces `root/<id>`.
    fn import_with_peek(
        &self,
        archive: &Path,
        root: &Path,
        sink: &dyn ProgressSink,
    ) -> ImportResult<CoursePreview> {
        let meta = self.extractor.extract_metadata_only(archive)?;
        meta.check_id()?;
        let _lock = self.lock(&meta.id)?;
        self.ensure_importable(&meta)?;

        sink.report(ImportEvent::ExtractionStarted);
        let report = |percent: u8| sink.report(ImportEvent::ExtractionProgress(percent));
        let staged = self.extractor.extract_staged(archive, root, Some(&report))?;
        if staged.metadata().id != meta.id {
            return Err(ImportError::DescriptorMismatch {
                peeked: meta.id,
                extracted: staged.metadata().id.clone(),
            });
        }
        let course_dir = staged.commit()?;
        self.materialize(&meta, &course_dir)
    }

    /// Used when the backend cannot read the descriptor without unpacking
    /// everything. A rejected course is discarded from the scratch directory,
    /// so an installed copy is never touched.
    fn import_extract_first(
        &self,
        archive: &Path,
        root: &Path,
        sink: &dyn ProgressSink,
    ) -> ImportResult<CoursePreview> {
        info!(archive = %archive.display(), "descriptor peek unavailable, extracting first");
        sink.report(ImportEvent::ExtractionStarted);
        let report = |percent: u8| sink.report(ImportEvent::ExtractionProgress(percent));
        let staged: StagedCourse = self.extractor.extract_staged(archive, root, Some(&report))?;
        let meta = staged.metadata().clone();

        let _lock = self.lock(&meta.id)?;
        self.ensure_importable(&meta)?;

        let course_dir = staged.commit()?;
        self.materialize(&meta, &course_dir)
    }

    fn ensure_importable(&self, meta: &CourseMetadata) -> ImportResult<()> {
        let check = duplicate::check_duplicate(self.store.as_ref(), meta)?;
        info!(course_id = %meta.id, action = ?check.action, "{}", check.message);
        if check.action == DuplicateAction::Reject {
            return Err(ImportError::Duplicate {
                course_id: meta.id.clone(),
                message: check.message,
            });
        }
        Ok(())
    }

    fn materialize(&self, meta: &CourseMetadata, course_dir: &Path) -> ImportResult<CoursePreview> {
        self.materializer.process(meta, course_dir).map_err(|err| {
            warn!(
                course_id = %meta.id,
                dir = %course_dir.display(),
                "course directory left on disk without a catalog record"
            );
            err
        })
    }
}

/// Removes `root/<dir_name>`; missing directories are fine. Names that
/// would reach outside the root are refused.
pub(crate) fn remove_course_dir(root: &Path, dir_name: &str) -> ImportResult<()> {
    if !metadata::is_plain_dir_name(dir_name) {
        return Err(ImportError::InvalidCourseId(dir_name.to_string()));
    }
    let dir = root.join(dir_name);
    if dir.exists() {
        fs::remove_dir_all(&dir).io_context(format!("remove {}", dir.display()))?;
    }
    Ok(())
}
