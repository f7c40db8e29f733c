use crate::catalog::{CatalogStore, StoreResult};
use crate::error::{ImportError, ImportResult, IoContext};
use crate::metadata::{self, CourseMetadata};
use serde::Serialize;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// A course directory found under the root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseOnDisk {
    pub metadata: CourseMetadata,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Import,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannedCourse {
    pub metadata: CourseMetadata,
    pub directory: PathBuf,
    #[serde(rename = "type")]
    pub kind: ScanKind,
}

pub fn set_root(store: &dyn CatalogStore, path: &Path) -> ImportResult<PathBuf> {
    if !path.is_dir() {
        return Err(ImportError::DirectoryMissing(path.to_path_buf()));
    }
    let root = fs::canonicalize(path).io_context(format!("resolve {}", path.display()))?;
    store.set_root_path(Some(root.clone()))?;
    info!(root = %root.display(), "course root set");
    Ok(root)
}

pub fn clear_root(store: &dyn CatalogStore) -> StoreResult<()> {
    store.set_root_path(None)?;
    info!("course root cleared");
    Ok(())
}

/// Every immediate sub-directory of the root holding a readable descriptor,
/// in name order. Hidden directories (scratch space included) are skipped.
pub fn scan_for_courses(store: &dyn CatalogStore) -> ImportResult<Vec<CourseOnDisk>> {
    let root = store.root_path()?.ok_or(ImportError::RootPathNotSet)?;
    let mut dirs = Vec::new();
    for entry in fs::read_dir(&root).io_context(format!("read {}", root.display()))? {
        let entry = entry.io_context(format!("read {}", root.display()))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_dir() && !hidden {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut found = Vec::new();
    for directory in dirs {
        match metadata::read_descriptor(&directory) {
            Ok(metadata) => found.push(CourseOnDisk {
                metadata,
                directory,
            }),
            Err(err) => debug!(dir = %directory.display(), "not a course directory: {err}"),
        }
    }
    Ok(found)
}

/// Keeps what is worth importing: unknown ids, and known ids whose build is
/// strictly newer than the catalog's. Timestamps that do not parse never
/// count as newer.
pub fn classify_scanned(
    store: &dyn CatalogStore,
    found: Vec<CourseOnDisk>,
) -> StoreResult<Vec<ScannedCourse>> {
    let active: HashMap<String, String> = store
        .get_all()?
        .into_iter()
        .map(|course| (course.id, course.build_at))
        .collect();

    Ok(found
        .into_iter()
        .filter_map(|course| {
            let kind = match active.get(&course.metadata.id) {
                None => ScanKind::Import,
                Some(existing) if metadata::is_newer_build(&course.metadata.build_at, existing) => {
                    ScanKind::Update
                }
                Some(_) => return None,
            };
            Some(ScannedCourse {
                metadata: course.metadata,
                directory: course.directory,
                kind,
            })
        })
        .collect())
}
