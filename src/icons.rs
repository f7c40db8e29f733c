use crate::error::{ImportResult, IoContext};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Course icons copied out of the course directories, one `<id>.png` each.
#[derive(Debug, Clone)]
pub struct IconStore {
    dir: PathBuf,
}

impl IconStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, course_id: &str) -> PathBuf {
        self.dir.join(format!("{course_id}.png"))
    }

    /// Copies `source` into the store. A course without an icon is not an
    /// error; `Ok(None)` is returned and nothing is written.
    pub fn save(&self, course_id: &str, source: &Path) -> ImportResult<Option<PathBuf>> {
        if !source.is_file() {
            debug!(course_id, source = %source.display(), "course has no icon");
            return Ok(None);
        }
        fs::create_dir_all(&self.dir).io_context(format!("create {}", self.dir.display()))?;
        let target = self.path_for(course_id);
        fs::copy(source, &target).io_context(format!(
            "copy icon {} to {}",
            source.display(),
            target.display()
        ))?;
        Ok(Some(target))
    }

    pub fn remove(&self, course_id: &str) -> ImportResult<()> {
        let path = self.path_for(course_id);
        if path.exists() {
            fs::remove_file(&path).io_context(format!("remove {}", path.display()))?;
        }
        Ok(())
    }
}
