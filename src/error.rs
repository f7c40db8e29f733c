use crate::catalog::StoreError;
use std::{io, path::PathBuf};
use thiserror::Error;

pub type ImportResult<T> = Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Unsupported archive type: {0}")]
    UnsupportedArchive(String),

    #[error("File metadata.json is missing in the archive")]
    DescriptorMissing,

    #[error("metadata.json file not found in {}", .0.display())]
    DescriptorNotFound(PathBuf),

    #[error("Invalid metadata.json format: {0}")]
    InvalidDescriptor(#[source] serde_json::Error),

    #[error("Course ID is missing in metadata.json")]
    MissingCourseId,

    /// The id has to work as a single directory name under the root.
    #[error("Course ID {0:?} is not a valid directory name")]
    InvalidCourseId(String),

    #[error("Archive holds course {extracted} but its first metadata.json names {peeked}")]
    DescriptorMismatch { peeked: String, extracted: String },

    /// The backend cannot read a single entry without unpacking the whole
    /// archive. Callers fall back to full extraction for metadata discovery.
    #[error("metadata-only extraction is unavailable for this archive on this platform")]
    MetadataPeekUnsupported,

    #[error("{message}")]
    Duplicate { course_id: String, message: String },

    #[error("{0}")]
    Tool(String),

    #[error("{0}")]
    ToolLaunch(String),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Root path is not set")]
    RootPathNotSet,

    #[error("Course directory {} does not exist", .0.display())]
    DirectoryMissing(PathBuf),

    #[error("Course {0} not found")]
    CourseNotFound(String),

    #[error("Lesson {lesson_id} not found in course {course_id}")]
    LessonNotFound { course_id: String, lesson_id: String },

    #[error("An import of course {0} is already in progress")]
    ImportInProgress(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ImportError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ImportError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attaches a short description of the failed filesystem step.
pub trait IoContext<T> {
    fn io_context(self, context: impl Into<String>) -> ImportResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, context: impl Into<String>) -> ImportResult<T> {
        self.map_err(|source| ImportError::io(context, source))
    }
}
