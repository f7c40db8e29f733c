use crate::catalog::{CatalogStore, CoursePreview, StoreResult};
use crate::metadata::CourseMetadata;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    Import,
    Reactivate,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCheckResult {
    pub action: DuplicateAction,
    pub can_import: bool,
    pub existing: Option<CoursePreview>,
    pub message: String,
}

/// Decides what an import of `meta` may do given the current catalog.
///
/// Any active record with the same id blocks the import; only a soft-deleted
/// record lets the import through, as a reactivation.
pub fn check_duplicate(
    store: &dyn CatalogStore,
    meta: &CourseMetadata,
) -> StoreResult<DuplicateCheckResult> {
    if let Some(inactive) = store
        .get_by_id_including_inactive(&meta.id)?
        .filter(|course| !course.is_active)
    {
        return Ok(DuplicateCheckResult {
            action: DuplicateAction::Reactivate,
            can_import: true,
            existing: Some(inactive.preview()),
            message: format!(
                "Course \"{}\" was previously removed and will be reactivated",
                meta.name
            ),
        });
    }

    if let Some(active) = store.get_by_id(&meta.id)? {
        return Ok(DuplicateCheckResult {
            action: DuplicateAction::Reject,
            can_import: false,
            message: format!(
                "Course \"{}\" is already installed (version: {})",
                meta.name, active.build_at
            ),
            existing: Some(active.preview()),
        });
    }

    Ok(DuplicateCheckResult {
        action: DuplicateAction::Import,
        can_import: true,
        existing: None,
        message: format!("New course \"{}\" is ready to import", meta.name),
    })
}
