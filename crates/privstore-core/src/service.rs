//! Assembled privacy settings service
//!
//! Wires the store, the watchdog and the recovery orchestrator together over
//! one bounded event channel and owns their threads.

use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::admin::Admin;
use crate::config::Config;
use crate::error::StoreResult;
use crate::external::{Notifier, PackageSource};
use crate::recovery::{spawn_orchestrator, OrchestratorHandle, RecoveryOrchestrator};
use crate::store::SettingsStore;
use crate::watchdog::Watchdog;

pub struct PrivacyService {
    store: Arc<SettingsStore>,
    watchdog: Arc<Watchdog>,
    orchestrator: Arc<RecoveryOrchestrator>,
    worker: Mutex<Option<OrchestratorHandle>>,
}

impl PrivacyService {
    /// Open the store and start the recovery thread, plus the watcher if
    /// `config.start_watchdog` is set.
    pub fn start(
        config: Config,
        packages: Arc<dyn PackageSource>,
        notifier: Arc<dyn Notifier>,
    ) -> StoreResult<Self> {
        let store = Arc::new(SettingsStore::open(config.clone(), packages)?);
        let (events_tx, events_rx) = mpsc::sync_channel(config.event_channel_capacity);
        let watchdog = Arc::new(Watchdog::new(Arc::clone(store.context()), &config, events_tx));
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&watchdog),
            notifier,
        ));
        let worker = spawn_orchestrator(Arc::clone(&orchestrator), events_rx)?;

        if config.start_watchdog {
            watchdog.start()?;
        }
        info!(watching = config.start_watchdog, "privacy service started");

        Ok(Self { store, watchdog, orchestrator, worker: Mutex::new(Some(worker)) })
    }

    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn orchestrator(&self) -> &Arc<RecoveryOrchestrator> {
        &self.orchestrator
    }

    pub fn admin(&self) -> Admin {
        Admin::new(Arc::clone(&self.store))
    }

    /// Stop the watcher and the recovery thread. Idempotent.
    pub fn shutdown(&self) {
        self.watchdog.stop();
        if let Some(worker) = self.worker.lock().take() {
            worker.shutdown();
            info!("privacy service stopped");
        }
    }
}

impl Drop for PrivacyService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
