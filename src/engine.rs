//! Application-lifetime composition root.

use crate::clock::{Clock, LocalClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::facade::GateFacade;
use crate::gate::{FeatureGate, ListStore};
use crate::prefs::{FilePreferenceStore, FileStoreConfig, PreferenceStore};
use crate::reconciler::{EntitlementReconciler, EntitlementStatus};
use crate::settings::SettingsReconciler;
use crate::source::EntitlementSource;
use crate::tier::TierCell;
use crate::usage::UsageCounterStore;
use std::sync::Arc;
use tracing::info;

/// Owns one instance of every component and wires them together.
///
/// Hosts create one engine at startup and hand out [`GateFacade`] clones.
pub struct Engine {
    config: EngineConfig,
    prefs: Arc<dyn PreferenceStore>,
    reconciler: Arc<EntitlementReconciler>,
    facade: GateFacade,
}

impl Engine {
    /// Open the file-backed store under `config.data_dir`.
    pub fn open(
        config: EngineConfig,
        source: Arc<dyn EntitlementSource>,
        lists: Arc<dyn ListStore>,
    ) -> Result<Self> {
        config.validate()?;
        let store = FilePreferenceStore::open(FileStoreConfig::at(config.data_dir.clone()))?;
        Self::with_store(config, Arc::new(store), Arc::new(LocalClock), source, lists)
    }

    /// Build on an existing store and clock.
    pub fn with_store(
        config: EngineConfig,
        prefs: Arc<dyn PreferenceStore>,
        clock: Arc<dyn Clock>,
        source: Arc<dyn EntitlementSource>,
        lists: Arc<dyn ListStore>,
    ) -> Result<Self> {
        config.validate()?;

        let tier = Arc::new(TierCell::new());
        let usage = Arc::new(UsageCounterStore::with_retention(
            Arc::clone(&prefs),
            clock,
            config.counter_retention_days,
        ));
        let settings = Arc::new(SettingsReconciler::new(Arc::clone(&prefs), Arc::clone(&tier)));
        let reconciler = Arc::new(EntitlementReconciler::new(
            &config,
            Arc::clone(&tier),
            Arc::clone(&prefs),
            source,
        ));
        reconciler.add_downgrade_handler(settings.clone());

        let gate = Arc::new(FeatureGate::new(tier, usage, lists, config.limits.clone()));
        let facade = GateFacade::new(gate, settings, Arc::clone(&reconciler), config.limits.clone());

        info!(data_dir = %config.data_dir.display(), products = config.catalog.len(), "entitlement engine ready");

        Ok(Self {
            config,
            prefs,
            reconciler,
            facade,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn facade(&self) -> GateFacade {
        self.facade.clone()
    }

    /// The tier writer, for the host's store adapter.
    ///
    /// Adapters push verified purchase events through it and may wait on
    /// readiness at startup. Screens and view models go through
    /// [`facade`](Self::facade), which can read the tier but never set it.
    pub fn reconciler(&self) -> &EntitlementReconciler {
        &self.reconciler
    }

    pub fn status(&self) -> EntitlementStatus {
        self.reconciler.status()
    }

    /// Start consuming the entitlement source.
    pub fn start(&self) -> Result<()> {
        self.reconciler.start()
    }

    /// Force a fresh replay from the source ("Restore Purchases").
    pub fn restore(&self) -> Result<()> {
        self.reconciler.restore()
    }

    /// Stop the worker and flush the store. The engine stays usable for
    /// gate checks with the last known tier.
    pub fn shutdown(&self) -> Result<()> {
        self.reconciler.stop();
        self.prefs.flush()?;
        info!("entitlement engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.reconciler.stop();
        // Callbacks may hold facade clones, which keep the reconciler alive.
        self.reconciler.disconnect_observers();
    }
}
