use crate::{
    archive::{ArchiveExtractor, TarZstBackend, ZipBackend},
    catalog::{CatalogStore, JsonCatalog},
    config::AppConfig,
    courses::CourseService,
    icons::IconStore,
    importer::ImportOrchestrator,
    integrity::{self, IntegrityCheckResult},
    materializer::CourseMaterializer,
};
use anyhow::{Context, Result};
use std::{path::Path, sync::Arc};
use tracing::debug;

/// Everything a command needs, wired once per process.
pub struct App {
    pub config: AppConfig,
    store: Arc<JsonCatalog>,
    pub importer: ImportOrchestrator,
    pub courses: CourseService,
    /// Outcome of the reconciliation run during startup.
    pub integrity: IntegrityCheckResult,
}

impl App {
    /// Loads config and catalog, then reconciles the catalog with disk before
    /// the import pipeline is handed out.
    pub fn initialize(data_dir: &Path) -> Result<Self> {
        let config = AppConfig::load_or_create(data_dir)?;
        let store = Arc::new(
            JsonCatalog::open(config.catalog_path(), config.save_delay())
                .context("open course catalog")?,
        );
        debug!(catalog = %store.path().display(), "catalog ready");

        let integrity = integrity::reconcile(store.as_ref()).context("run integrity check")?;

        let shared: Arc<dyn CatalogStore> = store.clone();
        let icons = IconStore::new(config.icons_dir());
        let extractor = ArchiveExtractor::new(
            ZipBackend::default(),
            TarZstBackend::new(&config.tar_program),
        );
        let materializer = CourseMaterializer::new(shared.clone(), icons.clone());
        let importer = ImportOrchestrator::new(shared.clone(), extractor, materializer);
        let courses = CourseService::new(shared, icons);

        Ok(Self {
            config,
            store,
            importer,
            courses,
            integrity,
        })
    }

    pub fn store(&self) -> &dyn CatalogStore {
        self.store.as_ref()
    }

    /// Writes any pending catalog changes.
    pub fn shutdown(&self) -> Result<()> {
        self.store.flush().context("flush course catalog")
    }
}
