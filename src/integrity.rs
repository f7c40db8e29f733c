use crate::catalog::{CatalogStore, StoreResult};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityCheckResult {
    pub total_checked: usize,
    pub deactivated: usize,
    pub deactivated_course_ids: Vec<String>,
    pub root_path_removed: bool,
}

impl IntegrityCheckResult {
    pub fn changed_anything(&self) -> bool {
        self.deactivated > 0 || self.root_path_removed
    }
}

/// Aligns the catalog with what is on disk. Runs once at startup, before any
/// import can happen.
///
/// A missing root deactivates every active course and clears the root. With
/// the root present, each active course whose `root/<id>` directory is gone is
/// soft-deleted. Course contents are not inspected.
pub fn reconcile(store: &dyn CatalogStore) -> StoreResult<IntegrityCheckResult> {
    let mut result = IntegrityCheckResult::default();

    let Some(root) = store.root_path()? else {
        info!("no course root configured, skipping integrity check");
        return Ok(result);
    };

    let active = store.get_all()?;
    result.total_checked = active.len();

    if !root.exists() {
        warn!(root = %root.display(), "course root is gone, deactivating every course");
        for course in active {
            store.soft_delete(&course.id)?;
            result.deactivated += 1;
            result.deactivated_course_ids.push(course.id);
        }
        store.set_root_path(None)?;
        result.root_path_removed = true;
        info!(
            deactivated = result.deactivated,
            "integrity check complete: root path removed"
        );
        return Ok(result);
    }

    for course in active {
        if root.join(&course.id).exists() {
            continue;
        }
        warn!(course_id = %course.id, name = %course.name, "course folder missing");
        store.soft_delete(&course.id)?;
        result.deactivated += 1;
        result.deactivated_course_ids.push(course.id);
    }

    if result.deactivated > 0 {
        info!(
            checked = result.total_checked,
            deactivated = result.deactivated,
            "integrity check complete: courses deactivated due to missing folders"
        );
    } else {
        info!(checked = result.total_checked, "integrity check complete: all course folders present");
    }
    Ok(result)
}
