use crate::error::{ImportError, ImportResult, IoContext};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    fs,
    path::{Component, Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, Date, OffsetDateTime, PrimitiveDateTime};
use walkdir::WalkDir;

pub const DESCRIPTOR_FILE: &str = "metadata.json";
pub const ICON_FILE: &str = "icon.png";

/// How many directory levels below the extraction root are searched for the
/// package root.
pub const DESCRIPTOR_SEARCH_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub build_at: String,
    #[serde(default)]
    pub chapters: Vec<ChapterMetadata>,
}

impl CourseMetadata {
    pub fn has_id(&self) -> bool {
        !self.id.trim().is_empty()
    }

    /// The id names the course directory under the root, so it must be
    /// present and usable as exactly one path component.
    pub fn check_id(&self) -> ImportResult<()> {
        if !self.has_id() {
            return Err(ImportError::MissingCourseId);
        }
        if !is_plain_dir_name(&self.id) {
            return Err(ImportError::InvalidCourseId(self.id.clone()));
        }
        Ok(())
    }

    pub fn lesson_count(&self) -> usize {
        self.chapters.iter().map(|chapter| chapter.lessons.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lessons: Vec<LessonMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: LessonKind,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub video_duration: Option<u32>,
    #[serde(default)]
    pub snippets: Vec<SnippetMetadata>,
    #[serde(default)]
    pub resources: Vec<ResourceMetadata>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonKind {
    Video,
    #[default]
    Text,
    Quiz,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetMetadata {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// True when `name` joined onto a directory stays a direct child of it.
pub fn is_plain_dir_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => part == OsStr::new(name),
        _ => false,
    }
}

pub fn parse_descriptor(bytes: &[u8]) -> ImportResult<CourseMetadata> {
    serde_json::from_slice(bytes).map_err(ImportError::InvalidDescriptor)
}

/// Reads `metadata.json` from an extracted or hand-placed course directory.
pub fn read_descriptor(course_dir: &Path) -> ImportResult<CourseMetadata> {
    let path = course_dir.join(DESCRIPTOR_FILE);
    if !path.is_file() {
        return Err(ImportError::DescriptorNotFound(course_dir.to_path_buf()));
    }
    let bytes = fs::read(&path).io_context(format!("read {}", path.display()))?;
    parse_descriptor(&bytes)
}

/// Returns the first directory (pre-order, name-sorted) under `root` that
/// directly contains the descriptor.
pub fn find_descriptor_root(root: &Path) -> Option<PathBuf> {
    WalkDir::new(root)
        .max_depth(DESCRIPTOR_SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .find(|entry| entry.path().join(DESCRIPTOR_FILE).is_file())
        .map(|entry| entry.into_path())
}

pub fn is_descriptor_entry(name: &str) -> bool {
    name.trim_end().ends_with(DESCRIPTOR_FILE)
}

pub fn parse_build_at(value: &str) -> Option<OffsetDateTime> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some(dt);
    }
    let naive_format =
        time::macros::format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(dt) = PrimitiveDateTime::parse(trimmed, &naive_format) {
        return Some(dt.assume_utc());
    }
    let spaced_format =
        time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(dt) = PrimitiveDateTime::parse(trimmed, &spaced_format) {
        return Some(dt.assume_utc());
    }
    let date_format = time::macros::format_description!("[year]-[month]-[day]");
    if let Ok(date) = Date::parse(trimmed, &date_format) {
        return date.with_hms(0, 0, 0).ok().map(|dt| dt.assume_utc());
    }
    None
}

/// True only when both timestamps parse and `candidate` is strictly later.
pub fn is_newer_build(candidate: &str, existing: &str) -> bool {
    match (parse_build_at(candidate), parse_build_at(existing)) {
        (Some(candidate), Some(existing)) => candidate > existing,
        _ => false,
    }
}
