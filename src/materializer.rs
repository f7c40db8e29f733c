use crate::catalog::{
    CatalogStore, ChapterRecord, CoursePreview, LessonRecord, NewCourse, ResourceRecord,
    SnippetRecord,
};
use crate::error::ImportResult;
use crate::icons::IconStore;
use crate::metadata::{ChapterMetadata, CourseMetadata, LessonMetadata, ICON_FILE};
use std::{path::Path, sync::Arc};
use tracing::{error, info};

/// Writes a course described by its descriptor into the catalog.
pub struct CourseMaterializer {
    store: Arc<dyn CatalogStore>,
    icons: IconStore,
}

impl CourseMaterializer {
    pub fn new(store: Arc<dyn CatalogStore>, icons: IconStore) -> Self {
        Self { store, icons }
    }

    /// Reactivates, replaces or creates the catalog record for `meta`.
    pub fn process(&self, meta: &CourseMetadata, course_dir: &Path) -> ImportResult<CoursePreview> {
        let result = self.process_inner(meta, course_dir);
        if let Err(err) = &result {
            error!(course_id = %meta.id, "Error adding course to catalog: {err}");
        }
        result
    }

    fn process_inner(&self, meta: &CourseMetadata, course_dir: &Path) -> ImportResult<CoursePreview> {
        if let Some(inactive) = self
            .store
            .get_by_id_including_inactive(&meta.id)?
            .filter(|course| !course.is_active)
        {
            info!(course_id = %meta.id, name = %meta.name, "reactivating course");
            self.store.reactivate(&meta.id, &meta.build_at)?;
            return Ok(CoursePreview {
                id: meta.id.clone(),
                name: meta.name.clone(),
                description: meta.description.clone(),
                folder_name: inactive.folder_name,
                build_at: meta.build_at.clone(),
            });
        }

        let existing = match self.store.get_by_id(&meta.id)? {
            Some(course) => Some(course),
            None => self.store.get_by_name(&meta.name)?,
        };
        if let Some(existing) = existing {
            info!(course_id = %meta.id, replaced = %existing.id, "replacing course");
            self.store.delete_by_id(&existing.id)?;
        }
        self.create(meta, course_dir)
    }

    fn create(&self, meta: &CourseMetadata, course_dir: &Path) -> ImportResult<CoursePreview> {
        let folder_name = course_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| meta.id.clone());

        self.icons.save(&meta.id, &course_dir.join(ICON_FILE))?;

        let record = self.store.create(NewCourse {
            id: meta.id.clone(),
            name: meta.name.clone(),
            description: meta.description.clone(),
            folder_name,
            build_at: meta.build_at.clone(),
        })?;

        for (position, chapter) in meta.chapters.iter().enumerate() {
            self.store
                .add_chapter(&record.id, chapter_record(chapter, position))?;
            for (position, lesson) in chapter.lessons.iter().enumerate() {
                self.store
                    .add_lesson(&record.id, &chapter.id, lesson_record(lesson, position))?;
            }
        }
        info!(
            course_id = %record.id,
            chapters = meta.chapters.len(),
            lessons = meta.lesson_count(),
            "course added to catalog"
        );
        Ok(record.preview())
    }
}

fn chapter_record(chapter: &ChapterMetadata, position: usize) -> ChapterRecord {
    ChapterRecord {
        id: chapter.id.clone(),
        name: chapter.name.clone(),
        position,
        lessons: Vec::new(),
    }
}

fn lesson_record(lesson: &LessonMetadata, position: usize) -> LessonRecord {
    LessonRecord {
        id: lesson.id.clone(),
        name: lesson.name.clone(),
        kind: lesson.kind,
        position,
        file: lesson.file.clone(),
        video_duration: lesson.video_duration,
        snippets: lesson
            .snippets
            .iter()
            .map(|snippet| SnippetRecord {
                language: snippet.language.clone(),
                code: snippet.code.clone(),
                file: snippet.file.clone(),
            })
            .collect(),
        resources: lesson
            .resources
            .iter()
            .map(|resource| ResourceRecord {
                name: resource.name.clone(),
                path: resource.path.clone(),
                url: resource.url.clone(),
            })
            .collect(),
    }
}
