use super::{
    AccessEntry, CatalogStore, ChapterRecord, CourseRecord, LessonProgress, LessonRecord,
    NewCourse, StoreError, StoreResult,
};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use time::OffsetDateTime;
use tracing::{debug, error};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogData {
    #[serde(default)]
    root_path: Option<PathBuf>,
    #[serde(default)]
    courses: Vec<CourseRecord>,
    #[serde(default)]
    progress: Vec<LessonProgress>,
    /// Oldest access first; one entry per course.
    #[serde(default)]
    history: Vec<AccessEntry>,
}

impl CatalogData {
    fn course_mut(&mut self, id: &str) -> StoreResult<&mut CourseRecord> {
        self.courses
            .iter_mut()
            .find(|course| course.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn active(&self) -> impl Iterator<Item = &CourseRecord> {
        self.courses.iter().filter(|course| course.is_active)
    }
}

#[derive(Default)]
struct FlushSchedule {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    path: PathBuf,
    delay: Duration,
    data: Mutex<CatalogData>,
    /// Held across serialization and the temp-file rename; the flusher and
    /// `flush()` share one temp path.
    write_lock: Mutex<()>,
    schedule: Mutex<FlushSchedule>,
    wake: Condvar,
}

impl Shared {
    fn schedule(&self) -> StoreResult<MutexGuard<'_, FlushSchedule>> {
        self.schedule.lock().map_err(|_| StoreError::Poisoned)
    }

    fn schedule_save(&self) {
        if let Ok(mut schedule) = self.schedule.lock() {
            schedule.deadline = Some(Instant::now() + self.delay);
            self.wake.notify_one();
        }
    }

    fn write_now(&self) -> StoreResult<()> {
        let _writing = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let raw = {
            let data = self.data.lock().map_err(|_| StoreError::Poisoned)?;
            serde_json::to_string_pretty(&*data)?
        };
        write_atomic(&self.path, &raw)?;
        debug!(path = %self.path.display(), "catalog saved");
        Ok(())
    }

    /// Trailing-edge debounce: each mutation pushes the deadline out, and the
    /// file is written once the catalog has been quiet for `delay`.
    fn run_flusher(&self) {
        let Ok(mut schedule) = self.schedule.lock() else {
            return;
        };
        loop {
            if schedule.shutdown {
                return;
            }
            match schedule.deadline {
                None => {
                    schedule = match self.wake.wait(schedule) {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        schedule.deadline = None;
                        drop(schedule);
                        if let Err(err) = self.write_now() {
                            error!("Error saving catalog: {err}");
                        }
                        schedule = match self.schedule.lock() {
                            Ok(guard) => guard,
                            Err(_) => return,
                        };
                    } else {
                        schedule = match self.wake.wait_timeout(schedule, deadline - now) {
                            Ok((guard, _)) => guard,
                            Err(_) => return,
                        };
                    }
                }
            }
        }
    }
}

/// Catalog persisted as a single JSON document.
pub struct JsonCatalog {
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl JsonCatalog {
    pub fn open(path: impl Into<PathBuf>, delay: Duration) -> StoreResult<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            CatalogData::default()
        };
        debug!(path = %path.display(), courses = data.courses.len(), "catalog loaded");

        let shared = Arc::new(Shared {
            path,
            delay,
            data: Mutex::new(data),
            write_lock: Mutex::new(()),
            schedule: Mutex::new(FlushSchedule::default()),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("catalog-flush".to_string())
            .spawn(move || worker.run_flusher())?;

        Ok(Self {
            shared,
            flusher: Mutex::new(Some(handle)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogData) -> T) -> StoreResult<T> {
        let data = self.shared.data.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&data))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut CatalogData) -> StoreResult<T>) -> StoreResult<T> {
        let result = {
            let mut data = self.shared.data.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut data)?
        };
        self.shared.schedule_save();
        Ok(result)
    }
}

impl CatalogStore for JsonCatalog {
    fn create(&self, course: NewCourse) -> StoreResult<CourseRecord> {
        self.mutate(|data| {
            if data.courses.iter().any(|existing| existing.id == course.id) {
                return Err(StoreError::AlreadyExists(course.id));
            }
            let record = CourseRecord {
                id: course.id,
                name: course.name,
                description: course.description,
                folder_name: course.folder_name,
                build_at: course.build_at,
                is_active: true,
                created_at: now_timestamp(),
                chapters: Vec::new(),
            };
            data.courses.push(record.clone());
            Ok(record)
        })
    }

    fn add_chapter(&self, course_id: &str, chapter: ChapterRecord) -> StoreResult<()> {
        self.mutate(|data| {
            data.course_mut(course_id)?.chapters.push(chapter);
            Ok(())
        })
    }

    fn add_lesson(
        &self,
        course_id: &str,
        chapter_id: &str,
        lesson: LessonRecord,
    ) -> StoreResult<()> {
        self.mutate(|data| {
            let course = data.course_mut(course_id)?;
            // Latest match, so chapters sharing an id each get their own lessons.
            let chapter = course
                .chapters
                .iter_mut()
                .rev()
                .find(|chapter| chapter.id == chapter_id)
                .ok_or_else(|| StoreError::ChapterNotFound {
                    course_id: course_id.to_string(),
                    chapter_id: chapter_id.to_string(),
                })?;
            chapter.lessons.push(lesson);
            Ok(())
        })
    }

    fn get_by_id(&self, id: &str) -> StoreResult<Option<CourseRecord>> {
        self.read(|data| data.active().find(|course| course.id == id).cloned())
    }

    fn get_by_id_including_inactive(&self, id: &str) -> StoreResult<Option<CourseRecord>> {
        self.read(|data| data.courses.iter().find(|course| course.id == id).cloned())
    }

    fn get_by_name(&self, name: &str) -> StoreResult<Option<CourseRecord>> {
        self.read(|data| data.active().find(|course| course.name == name).cloned())
    }

    fn get_all(&self) -> StoreResult<Vec<CourseRecord>> {
        self.read(|data| data.active().cloned().collect())
    }

    fn get_all_inactive(&self) -> StoreResult<Vec<CourseRecord>> {
        self.read(|data| {
            data.courses
                .iter()
                .filter(|course| !course.is_active)
                .cloned()
                .collect()
        })
    }

    fn soft_delete(&self, id: &str) -> StoreResult<()> {
        self.mutate(|data| {
            data.course_mut(id)?.is_active = false;
            Ok(())
        })
    }

    fn delete_by_id(&self, id: &str) -> StoreResult<()> {
        self.mutate(|data| {
            data.courses.retain(|course| course.id != id);
            data.progress.retain(|entry| entry.course_id != id);
            data.history.retain(|entry| entry.course_id != id);
            Ok(())
        })
    }

    fn reactivate(&self, id: &str, build_at: &str) -> StoreResult<()> {
        self.mutate(|data| {
            let course = data.course_mut(id)?;
            course.build_at = build_at.to_string();
            course.is_active = true;
            Ok(())
        })
    }

    fn root_path(&self) -> StoreResult<Option<PathBuf>> {
        self.read(|data| data.root_path.clone())
    }

    fn set_root_path(&self, root: Option<PathBuf>) -> StoreResult<()> {
        self.mutate(|data| {
            data.root_path = root;
            Ok(())
        })
    }

    fn record_access(&self, course_id: &str) -> StoreResult<()> {
        self.mutate(|data| {
            data.history.retain(|entry| entry.course_id != course_id);
            data.history.push(AccessEntry {
                course_id: course_id.to_string(),
                accessed_at: now_timestamp(),
            });
            Ok(())
        })
    }

    fn recent_courses(&self, limit: usize) -> StoreResult<Vec<(CourseRecord, i64)>> {
        self.read(|data| {
            data.history
                .iter()
                .rev()
                .filter_map(|entry| {
                    data.active()
                        .find(|course| course.id == entry.course_id)
                        .map(|course| (course.clone(), entry.accessed_at))
                })
                .take(limit)
                .collect()
        })
    }

    fn set_lesson_progress(
        &self,
        course_id: &str,
        lesson_id: &str,
        completed: bool,
    ) -> StoreResult<()> {
        self.mutate(|data| {
            let updated_at = now_timestamp();
            match data
                .progress
                .iter_mut()
                .find(|entry| entry.course_id == course_id && entry.lesson_id == lesson_id)
            {
                Some(entry) => {
                    entry.completed = completed;
                    entry.updated_at = updated_at;
                }
                None => data.progress.push(LessonProgress {
                    course_id: course_id.to_string(),
                    lesson_id: lesson_id.to_string(),
                    completed,
                    updated_at,
                }),
            }
            Ok(())
        })
    }

    fn progress_for(&self, course_id: &str) -> StoreResult<Vec<LessonProgress>> {
        self.read(|data| {
            data.progress
                .iter()
                .filter(|entry| entry.course_id == course_id)
                .cloned()
                .collect()
        })
    }

    fn flush(&self) -> StoreResult<()> {
        self.shared.schedule()?.deadline = None;
        self.shared.write_now()
    }
}

impl Drop for JsonCatalog {
    fn drop(&mut self) {
        let pending = match self.shared.schedule.lock() {
            Ok(mut schedule) => {
                schedule.shutdown = true;
                self.shared.wake.notify_one();
                schedule.deadline.take().is_some()
            }
            Err(_) => false,
        };
        if let Ok(mut flusher) = self.flusher.lock() {
            if let Some(handle) = flusher.take() {
                let _ = handle.join();
            }
        }
        if pending {
            if let Err(err) = self.shared.write_now() {
                error!("Error saving catalog on shutdown: {err}");
            }
        }
    }
}

fn now_timestamp() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn write_atomic(path: &Path, contents: &str) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("catalog.json"));
    let mut temp_name = file_name.clone();
    temp_name.push(".tmp");
    let mut temp_path = path.with_file_name(temp_name);
    if temp_path.exists() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut temp_name = file_name;
        temp_name.push(format!(".{stamp}.tmp"));
        temp_path = path.with_file_name(temp_name);
    }
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::LessonKind;
    use tempfile::TempDir;

    pub(crate) fn new_course(id: &str, build_at: &str) -> NewCourse {
        NewCourse {
            id: id.to_string(),
            name: format!("Course {id}"),
            description: String::new(),
            folder_name: id.to_string(),
            build_at: build_at.to_string(),
        }
    }

    fn lesson(id: &str, position: usize) -> LessonRecord {
        LessonRecord {
            id: id.to_string(),
            name: id.to_string(),
            kind: LessonKind::Text,
            position,
            file: None,
            video_duration: None,
            snippets: Vec::new(),
            resources: Vec::new(),
        }
    }

    fn open(dir: &Path, delay_ms: u64) -> JsonCatalog {
        JsonCatalog::open(dir.join("catalog.json"), Duration::from_millis(delay_ms)).unwrap()
    }

    #[test]
    fn active_lookups_hide_soft_deleted_records() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 50);
        catalog.create(new_course("a", "2024-01-01")).unwrap();
        catalog.create(new_course("b", "2024-01-01")).unwrap();
        catalog.soft_delete("a").unwrap();

        assert!(catalog.get_by_id("a").unwrap().is_none());
        assert!(catalog.get_by_name("Course a").unwrap().is_none());
        let inactive = catalog.get_by_id_including_inactive("a").unwrap().unwrap();
        assert!(!inactive.is_active);
        assert_eq!(catalog.get_all().unwrap().len(), 1);
        assert_eq!(catalog.get_all_inactive().unwrap()[0].id, "a");
    }

    #[test]
    fn one_record_per_id() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 50);
        catalog.create(new_course("a", "2024-01-01")).unwrap();
        catalog.soft_delete("a").unwrap();
        let err = catalog.create(new_course("a", "2024-02-01")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn reactivate_updates_build_and_keeps_folder() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 50);
        let mut course = new_course("a", "2024-01-01");
        course.folder_name = "original-folder".to_string();
        catalog.create(course).unwrap();
        catalog.soft_delete("a").unwrap();
        catalog.reactivate("a", "2024-06-01").unwrap();

        let record = catalog.get_by_id("a").unwrap().unwrap();
        assert!(record.is_active);
        assert_eq!(record.build_at, "2024-06-01");
        assert_eq!(record.folder_name, "original-folder");
        assert!(matches!(
            catalog.reactivate("missing", "x").unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn hard_delete_cascades() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 50);
        catalog.create(new_course("a", "2024-01-01")).unwrap();
        catalog.create(new_course("b", "2024-01-01")).unwrap();
        catalog
            .add_chapter(
                "a",
                ChapterRecord {
                    id: "ch".to_string(),
                    name: "Chapter".to_string(),
                    position: 0,
                    lessons: Vec::new(),
                },
            )
            .unwrap();
        catalog.add_lesson("a", "ch", lesson("l1", 0)).unwrap();
        catalog.set_lesson_progress("a", "l1", true).unwrap();
        catalog.set_lesson_progress("b", "l9", true).unwrap();
        catalog.record_access("a").unwrap();
        catalog.record_access("b").unwrap();

        catalog.delete_by_id("a").unwrap();
        assert!(catalog.get_by_id_including_inactive("a").unwrap().is_none());
        assert!(catalog.progress_for("a").unwrap().is_empty());
        assert_eq!(catalog.progress_for("b").unwrap().len(), 1);
        let recent = catalog.recent_courses(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].0.id, "b");
    }

    #[test]
    fn lessons_need_an_existing_chapter() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 50);
        catalog.create(new_course("a", "2024-01-01")).unwrap();
        let err = catalog.add_lesson("a", "nope", lesson("l", 0)).unwrap_err();
        assert!(matches!(err, StoreError::ChapterNotFound { .. }));
    }

    #[test]
    fn recent_courses_are_most_recent_first() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 50);
        for id in ["a", "b", "c"] {
            catalog.create(new_course(id, "2024-01-01")).unwrap();
        }
        catalog.record_access("a").unwrap();
        catalog.record_access("b").unwrap();
        catalog.record_access("c").unwrap();
        catalog.record_access("a").unwrap();
        catalog.soft_delete("c").unwrap();

        let ids: Vec<String> = catalog
            .recent_courses(5)
            .unwrap()
            .into_iter()
            .map(|(course, _)| course.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(catalog.recent_courses(1).unwrap().len(), 1);
    }

    #[test]
    fn progress_is_upserted() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 50);
        catalog.set_lesson_progress("a", "l1", true).unwrap();
        catalog.set_lesson_progress("a", "l1", false).unwrap();
        let progress = catalog.progress_for("a").unwrap();
        assert_eq!(progress.len(), 1);
        assert!(!progress[0].completed);
    }

    #[test]
    fn mutations_are_saved_after_the_debounce_window() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 20);
        catalog.create(new_course("a", "2024-01-01")).unwrap();
        catalog.set_root_path(Some(temp.path().join("courses"))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !catalog.path().exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(catalog.path().exists());

        let raw = fs::read_to_string(catalog.path()).unwrap();
        let data: CatalogData = serde_json::from_str(&raw).unwrap();
        assert_eq!(data.courses.len(), 1);
        assert_eq!(data.root_path, Some(temp.path().join("courses")));
    }

    #[test]
    fn flush_writes_immediately() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 60_000);
        catalog.create(new_course("a", "2024-01-01")).unwrap();
        catalog.flush().unwrap();

        let raw = fs::read_to_string(catalog.path()).unwrap();
        assert!(raw.contains("\"id\": \"a\""));
    }

    #[test]
    fn flush_racing_the_flusher_never_fails() {
        let temp = TempDir::new().unwrap();
        let catalog = open(temp.path(), 0);
        thread::scope(|scope| {
            for worker in 0..4 {
                let catalog = &catalog;
                scope.spawn(move || {
                    for round in 0..25 {
                        let id = format!("c-{worker}-{round}");
                        catalog.create(new_course(&id, "2024-01-01")).unwrap();
                        catalog.flush().unwrap();
                    }
                });
            }
        });
        catalog.flush().unwrap();

        let raw = fs::read_to_string(catalog.path()).unwrap();
        let data: CatalogData = serde_json::from_str(&raw).unwrap();
        assert_eq!(data.courses.len(), 100);
    }

    #[test]
    fn drop_flushes_pending_writes() {
        let temp = TempDir::new().unwrap();
        {
            let catalog = open(temp.path(), 60_000);
            catalog.create(new_course("a", "2024-01-01")).unwrap();
            catalog.soft_delete("a").unwrap();
        }
        let catalog = open(temp.path(), 50);
        let record = catalog.get_by_id_including_inactive("a").unwrap().unwrap();
        assert!(!record.is_active);
    }
}
