use crate::catalog::{CatalogStore, CourseRecord, StoreResult};
use crate::error::{ImportError, ImportResult};
use crate::icons::IconStore;
use crate::importer::remove_course_dir;
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CourseProgress {
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
}

impl CourseProgress {
    fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            0
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            completed,
            total,
            percent,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseView {
    pub course: CourseRecord,
    pub completed_lessons: Vec<String>,
    pub progress: CourseProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentCourse {
    pub course: CourseRecord,
    pub accessed_at: i64,
    pub progress: CourseProgress,
}

/// Course queries and user-initiated changes outside the import pipeline.
pub struct CourseService {
    store: Arc<dyn CatalogStore>,
    icons: IconStore,
}

impl CourseService {
    pub fn new(store: Arc<dyn CatalogStore>, icons: IconStore) -> Self {
        Self { store, icons }
    }

    pub fn list(&self) -> StoreResult<Vec<CourseRecord>> {
        self.store.get_all()
    }

    pub fn list_inactive(&self) -> StoreResult<Vec<CourseRecord>> {
        self.store.get_all_inactive()
    }

    fn active(&self, course_id: &str) -> ImportResult<CourseRecord> {
        self.store
            .get_by_id(course_id)?
            .ok_or_else(|| ImportError::CourseNotFound(course_id.to_string()))
    }

    fn completed_ids(&self, course: &CourseRecord) -> StoreResult<HashSet<String>> {
        let lessons: HashSet<&str> = course
            .chapters
            .iter()
            .flat_map(|chapter| chapter.lessons.iter().map(|lesson| lesson.id.as_str()))
            .collect();
        Ok(self
            .store
            .progress_for(&course.id)?
            .into_iter()
            .filter(|entry| entry.completed && lessons.contains(entry.lesson_id.as_str()))
            .map(|entry| entry.lesson_id)
            .collect())
    }

    fn progress_of(&self, course: &CourseRecord) -> StoreResult<CourseProgress> {
        let completed = self.completed_ids(course)?.len();
        Ok(CourseProgress::new(completed, course.lesson_count()))
    }

    /// Opening a course counts as an access for the recent list.
    pub fn show(&self, course_id: &str) -> ImportResult<CourseView> {
        let course = self.active(course_id)?;
        let mut completed_lessons: Vec<String> = self.completed_ids(&course)?.into_iter().collect();
        completed_lessons.sort();
        let progress = CourseProgress::new(completed_lessons.len(), course.lesson_count());
        self.store.record_access(course_id)?;
        Ok(CourseView {
            course,
            completed_lessons,
            progress,
        })
    }

    pub fn recent(&self, limit: usize) -> StoreResult<Vec<RecentCourse>> {
        self.store
            .recent_courses(limit)?
            .into_iter()
            .map(|(course, accessed_at)| {
                let progress = self.progress_of(&course)?;
                Ok(RecentCourse {
                    course,
                    accessed_at,
                    progress,
                })
            })
            .collect()
    }

    pub fn progress(&self, course_id: &str) -> ImportResult<CourseProgress> {
        let course = self.active(course_id)?;
        Ok(self.progress_of(&course)?)
    }

    pub fn mark_lesson(
        &self,
        course_id: &str,
        lesson_id: &str,
        completed: bool,
    ) -> ImportResult<CourseProgress> {
        let course = self.active(course_id)?;
        let known = course
            .chapters
            .iter()
            .flat_map(|chapter| chapter.lessons.iter())
            .any(|lesson| lesson.id == lesson_id);
        if !known {
            return Err(ImportError::LessonNotFound {
                course_id: course_id.to_string(),
                lesson_id: lesson_id.to_string(),
            });
        }
        self.store
            .set_lesson_progress(course_id, lesson_id, completed)?;
        Ok(self.progress_of(&course)?)
    }

    /// Soft delete: the record stays and comes back on re-import.
    pub fn deactivate(&self, course_id: &str) -> ImportResult<()> {
        let course = self.active(course_id)?;
        self.store.soft_delete(&course.id)?;
        info!(course_id, "course deactivated");
        Ok(())
    }

    /// Removes the record with everything hanging off it, its icon and its
    /// directory under the root. Inactive records can be deleted too.
    pub fn hard_delete(&self, course_id: &str) -> ImportResult<()> {
        let course = self
            .store
            .get_by_id_including_inactive(course_id)?
            .ok_or_else(|| ImportError::CourseNotFound(course_id.to_string()))?;

        self.store.delete_by_id(&course.id)?;
        self.icons.remove(&course.id)?;
        if let Some(root) = self.store.root_path()? {
            remove_course_dir(&root, &course.id)?;
            if course.folder_name != course.id && !course.folder_name.is_empty() {
                remove_course_dir(&root, &course.folder_name)?;
            }
        }
        info!(course_id, "course deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{json::tests::new_course, ChapterRecord, JsonCatalog, LessonRecord};
    use crate::metadata::LessonKind;
    use std::{fs, path::PathBuf, time::Duration};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        root: PathBuf,
        store: Arc<JsonCatalog>,
        courses: CourseService,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("courses");
        fs::create_dir_all(&root).unwrap();
        let store = Arc::new(
            JsonCatalog::open(temp.path().join("catalog.json"), Duration::from_secs(60)).unwrap(),
        );
        store.set_root_path(Some(root.clone())).unwrap();
        let courses = CourseService::new(store.clone(), IconStore::new(temp.path().join("icons")));
        Fixture {
            temp,
            root,
            store,
            courses,
        }
    }

    fn add_course(store: &JsonCatalog, id: &str, lessons: &[&str]) {
        store.create(new_course(id, "2024-01-01")).unwrap();
        store
            .add_chapter(
                id,
                ChapterRecord {
                    id: "ch".to_string(),
                    name: "Chapter".to_string(),
                    position: 0,
                    lessons: Vec::new(),
                },
            )
            .unwrap();
        for (position, lesson) in lessons.iter().enumerate() {
            store
                .add_lesson(
                    id,
                    "ch",
                    LessonRecord {
                        id: lesson.to_string(),
                        name: lesson.to_string(),
                        kind: LessonKind::Text,
                        position,
                        file: None,
                        video_duration: None,
                        snippets: Vec::new(),
                        resources: Vec::new(),
                    },
                )
                .unwrap();
        }
    }

    #[test]
    fn progress_percentage_counts_known_lessons() {
        let fx = fixture();
        add_course(&fx.store, "a", &["l1", "l2", "l3"]);
        assert_eq!(fx.courses.progress("a").unwrap().percent, 0);

        fx.courses.mark_lesson("a", "l1", true).unwrap();
        let progress = fx.courses.mark_lesson("a", "l2", true).unwrap();
        assert_eq!(progress, CourseProgress::new(2, 3));
        assert_eq!(progress.percent, 67);

        let progress = fx.courses.mark_lesson("a", "l2", false).unwrap();
        assert_eq!(progress.completed, 1);

        let err = fx.courses.mark_lesson("a", "nope", true).unwrap_err();
        assert!(matches!(err, ImportError::LessonNotFound { .. }));
    }

    #[test]
    fn empty_course_is_zero_percent() {
        let fx = fixture();
        fx.store.create(new_course("empty", "2024-01-01")).unwrap();
        assert_eq!(fx.courses.progress("empty").unwrap(), CourseProgress::default());
    }

    #[test]
    fn show_records_access_for_recent_list() {
        let fx = fixture();
        add_course(&fx.store, "a", &["l1"]);
        add_course(&fx.store, "b", &["l1"]);
        fx.courses.show("a").unwrap();
        let view = fx.courses.show("b").unwrap();
        assert_eq!(view.course.id, "b");

        let recent = fx.courses.recent(5).unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.course.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(matches!(
            fx.courses.show("missing").unwrap_err(),
            ImportError::CourseNotFound(_)
        ));
    }

    #[test]
    fn deactivate_hides_but_keeps_record() {
        let fx = fixture();
        add_course(&fx.store, "a", &["l1"]);
        fx.courses.deactivate("a").unwrap();
        assert!(fx.courses.list().unwrap().is_empty());
        assert_eq!(fx.courses.list_inactive().unwrap()[0].id, "a");
        assert!(matches!(
            fx.courses.deactivate("a").unwrap_err(),
            ImportError::CourseNotFound(_)
        ));
    }

    #[test]
    fn hard_delete_removes_record_icon_and_directory() {
        let fx = fixture();
        add_course(&fx.store, "a", &["l1"]);
        fx.courses.mark_lesson("a", "l1", true).unwrap();
        fs::create_dir_all(fx.root.join("a/lessons")).unwrap();
        let icons = fx.temp.path().join("icons");
        fs::create_dir_all(&icons).unwrap();
        fs::write(icons.join("a.png"), b"png").unwrap();

        fx.courses.hard_delete("a").unwrap();
        assert!(fx.store.get_by_id_including_inactive("a").unwrap().is_none());
        assert!(fx.store.progress_for("a").unwrap().is_empty());
        assert!(!fx.root.join("a").exists());
        assert!(!icons.join("a.png").exists());
    }

    #[test]
    fn hard_delete_works_on_inactive_courses() {
        let fx = fixture();
        add_course(&fx.store, "a", &[]);
        fx.store.soft_delete("a").unwrap();
        fx.courses.hard_delete("a").unwrap();
        assert!(fx.store.get_all_inactive().unwrap().is_empty());
        assert!(matches!(
            fx.courses.hard_delete("a").unwrap_err(),
            ImportError::CourseNotFound(_)
        ));
    }
}
