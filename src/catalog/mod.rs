pub mod json;

use crate::metadata::LessonKind;
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use thiserror::Error;

pub use json::JsonCatalog;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("catalog I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("course {0} is not in the catalog")]
    NotFound(String),

    #[error("course {0} already exists in the catalog")]
    AlreadyExists(String),

    #[error("chapter {chapter_id} does not exist in course {course_id}")]
    ChapterNotFound {
        course_id: String,
        chapter_id: String,
    },

    #[error("catalog lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub folder_name: String,
    pub build_at: String,
    pub is_active: bool,
    pub created_at: i64,
    #[serde(default)]
    pub chapters: Vec<ChapterRecord>,
}

impl CourseRecord {
    pub fn preview(&self) -> CoursePreview {
        CoursePreview {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            folder_name: self.folder_name.clone(),
            build_at: self.build_at.clone(),
        }
    }

    pub fn lesson_count(&self) -> usize {
        self.chapters.iter().map(|chapter| chapter.lessons.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub id: String,
    pub name: String,
    pub position: usize,
    #[serde(default)]
    pub lessons: Vec<LessonRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonRecord {
    pub id: String,
    pub name: String,
    pub kind: LessonKind,
    pub position: usize,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub video_duration: Option<u32>,
    #[serde(default)]
    pub snippets: Vec<SnippetRecord>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetRecord {
    pub language: Option<String>,
    pub code: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub path: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCourse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub folder_name: String,
    pub build_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoursePreview {
    pub id: String,
    pub name: String,
    pub description: String,
    pub folder_name: String,
    pub build_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonProgress {
    pub course_id: String,
    pub lesson_id: String,
    pub completed: bool,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub course_id: String,
    pub accessed_at: i64,
}

/// Record-oriented course catalog. Writers are the import pipeline, the
/// startup reconciliation and explicit user actions.
pub trait CatalogStore: Send + Sync {
    fn create(&self, course: NewCourse) -> StoreResult<CourseRecord>;

    /// Appends a chapter (without lessons) to the end of the course.
    fn add_chapter(&self, course_id: &str, chapter: ChapterRecord) -> StoreResult<()>;

    fn add_lesson(&self, course_id: &str, chapter_id: &str, lesson: LessonRecord)
        -> StoreResult<()>;

    /// Active records only.
    fn get_by_id(&self, id: &str) -> StoreResult<Option<CourseRecord>>;

    fn get_by_id_including_inactive(&self, id: &str) -> StoreResult<Option<CourseRecord>>;

    /// Active records only.
    fn get_by_name(&self, name: &str) -> StoreResult<Option<CourseRecord>>;

    /// Active records only.
    fn get_all(&self) -> StoreResult<Vec<CourseRecord>>;

    fn get_all_inactive(&self) -> StoreResult<Vec<CourseRecord>>;

    fn soft_delete(&self, id: &str) -> StoreResult<()>;

    /// Removes the record and everything hanging off it: chapters, lessons,
    /// progress and access history.
    fn delete_by_id(&self, id: &str) -> StoreResult<()>;

    fn reactivate(&self, id: &str, build_at: &str) -> StoreResult<()>;

    fn root_path(&self) -> StoreResult<Option<PathBuf>>;

    fn set_root_path(&self, root: Option<PathBuf>) -> StoreResult<()>;

    fn record_access(&self, course_id: &str) -> StoreResult<()>;

    /// Most recently opened first, active courses only.
    fn recent_courses(&self, limit: usize) -> StoreResult<Vec<(CourseRecord, i64)>>;

    fn set_lesson_progress(&self, course_id: &str, lesson_id: &str, completed: bool)
        -> StoreResult<()>;

    fn progress_for(&self, course_id: &str) -> StoreResult<Vec<LessonProgress>>;

    fn flush(&self) -> StoreResult<()>;
}
