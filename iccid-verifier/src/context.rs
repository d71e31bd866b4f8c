//! Component wiring shared by the HTTP service and the daemon

use iccid_common::config::{database_path, ensure_root_folder};
use iccid_common::db::init_database;
use iccid_common::events::EventBus;
use iccid_common::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::browser::{BrowserLauncher, WebDriverLauncher};
use crate::config::VerifierConfig;
use crate::engine::VerificationEngine;
use crate::lifecycle::BatchLifecycle;
use crate::portal::{Classifier, PortalClassifier, RetryPolicy};
use crate::store::{RecordStore, SqliteStore};

/// Event bus capacity per subscriber
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Store, engine and lifecycle built from one configuration
#[derive(Clone)]
pub struct VerifierContext {
    pub config: VerifierConfig,
    pub store: Arc<dyn RecordStore>,
    pub event_bus: EventBus,
    pub engine: Arc<VerificationEngine>,
    pub lifecycle: BatchLifecycle,
}

impl VerifierContext {
    /// Open `<root>/iccid.db` and wire the production WebDriver collaborators
    pub async fn open(root: &Path, config: VerifierConfig) -> Result<Self> {
        ensure_root_folder(root)?;
        let db_path = database_path(root);
        info!("Database: {}", db_path.display());
        let pool = init_database(&db_path).await?;
        let store: Arc<dyn RecordStore> =
            Arc::new(SqliteStore::new(pool, config.engine.max_lock_wait_ms));

        let launcher: Arc<dyn BrowserLauncher> = Arc::new(
            WebDriverLauncher::new(config.webdriver.clone())
                .map_err(|e| Error::Config(e.to_string()))?,
        );
        let classifier: Arc<dyn Classifier> = Arc::new(PortalClassifier::new(config.portal.clone()));

        Ok(Self::assemble(config, store, launcher, classifier))
    }

    /// Wire components around the given collaborators
    pub fn assemble(
        config: VerifierConfig,
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn BrowserLauncher>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let engine = Arc::new(VerificationEngine::new(
            Arc::clone(&store),
            launcher,
            classifier,
            RetryPolicy::from_settings(&config.retry),
            config.engine.clone(),
            event_bus.clone(),
        ));
        let lifecycle = BatchLifecycle::new(Arc::clone(&store), event_bus.clone());

        Self {
            config,
            store,
            event_bus,
            engine,
            lifecycle,
        }
    }
}
