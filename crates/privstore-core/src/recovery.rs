//! Recovery orchestrator: fail-safe entry and rebuild from cache
//!
//! Consumes watcher events on its own thread. A tamper event enters
//! fail-safe mode (once; later events are ignored until an administrator
//! clears it) and rebuilds the store:
//!
//! 1. notify `FailSafeTriggered`
//! 2. stop the watcher
//! 3. under the write lock: wipe database, companions and mirror tree
//! 4. reinitialize an empty store
//! 5. restart the watcher
//! 6. replay the cache into the fresh store
//! 7. notify `RecoveryComplete` or `RecoveryIncomplete`
//!
//! Fail-safe stays active afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::external::{Notification, Notifier};
use crate::store::SettingsStore;
use crate::watchdog::{classify, FileEvent, WatchEvent, Watchdog};

/// How often the orchestrator thread checks for shutdown while idle.
const RECV_SLICE: Duration = Duration::from_millis(50);

/// Outcome of one recovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reason: FileEvent,
    /// Applications whose settings could not be restored
    pub failed: Vec<String>,
    /// Applications restored from the cache
    pub restored: usize,
}

impl RecoveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RecoveryOrchestrator {
    store: Arc<SettingsStore>,
    watchdog: Arc<Watchdog>,
    notifier: Arc<dyn Notifier>,
    recoveries: AtomicU64,
}

impl RecoveryOrchestrator {
    pub fn new(store: Arc<SettingsStore>, watchdog: Arc<Watchdog>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, watchdog, notifier, recoveries: AtomicU64::new(0) }
    }

    /// Completed recovery passes.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// React to one watcher event. Returns the report if a recovery ran.
    pub fn handle_event(&self, event: WatchEvent) -> Option<RecoveryReport> {
        if let WatchEvent::WatcherLost { authorized_window } = event {
            if let Err(e) = self.watchdog.reinstall(authorized_window) {
                error!(error = %e, "could not reinstall watcher");
            }
            return None;
        }
        match classify(&event) {
            Some(reason) => self.recover(reason),
            None => {
                debug!(?event, "change inside authorized window");
                None
            }
        }
    }

    /// Enter fail-safe and rebuild the store from the cache.
    /// Returns None if fail-safe was already active.
    pub fn recover(&self, reason: FileEvent) -> Option<RecoveryReport> {
        if !self.store.context().watchdog_state().enter_fail_safe() {
            info!(reason = %reason, "fail-safe already active, ignoring event");
            return None;
        }
        error!(reason = %reason, "unauthorized change to settings database");
        self.notifier.notify(Notification::FailSafeTriggered { reason: reason.to_string() });

        self.watchdog.stop();
        let report = match self.rebuild(reason) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "could not rebuild settings store");
                let failed = self.store.cache().snapshot().into_iter().map(|r| r.app_id).collect();
                if let Err(e) = self.watchdog.start() {
                    error!(error = %e, "could not restart watcher");
                }
                RecoveryReport { reason, failed, restored: 0 }
            }
        };
        self.recoveries.fetch_add(1, Ordering::Relaxed);

        if report.is_complete() {
            info!(restored = report.restored, "settings restored from cache");
            self.notifier.notify(Notification::RecoveryComplete);
        } else {
            warn!(failed = ?report.failed, "some settings could not be restored");
            self.notifier.notify(Notification::RecoveryIncomplete { failed: report.failed.clone() });
        }
        Some(report)
    }

    fn rebuild(&self, reason: FileEvent) -> StoreResult<RecoveryReport> {
        let access = self.store.context().write_rebuild()?;
        self.store.wipe_locked(&access)?;
        self.store.initialize_locked(&access)?;
        self.watchdog.start()?;
        let cached = self.store.cache().len();
        let failed = self.store.replay_cache_locked(&access);
        drop(access);
        Ok(RecoveryReport { reason, restored: cached.saturating_sub(failed.len()), failed })
    }
}

/// Handle to the orchestrator thread.
/// Dropping this handle signals the thread to stop.
pub struct OrchestratorHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OrchestratorHandle {
    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Start consuming `events` on a background thread.
pub fn spawn_orchestrator(
    orchestrator: Arc<RecoveryOrchestrator>,
    events: Receiver<WatchEvent>,
) -> StoreResult<OrchestratorHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    let path = orchestrator.store.config().db_path.clone();

    let thread = thread::Builder::new()
        .name("privstore-recovery".to_string())
        .spawn(move || orchestrator_loop(orchestrator, events, shutdown_clone))
        .map_err(|e| StoreError::io(path, e))?;

    Ok(OrchestratorHandle { shutdown, thread: Some(thread) })
}

fn orchestrator_loop(
    orchestrator: Arc<RecoveryOrchestrator>,
    events: Receiver<WatchEvent>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match events.recv_timeout(RECV_SLICE) {
            Ok(event) => {
                orchestrator.handle_event(event);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("event channel closed, orchestrator exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::external::StaticPackages;
    use crate::record::{Category, PolicyValue, SettingRecord};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<Notification>>);

    impl Notifier for Recorded {
        fn notify(&self, notification: Notification) {
            self.0.lock().push(notification);
        }
    }

    fn setup() -> (RecoveryOrchestrator, Arc<SettingsStore>, Arc<Recorded>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::testing(dir.path());
        let packages = Arc::new(StaticPackages::new(["A", "B"]));
        let store = Arc::new(SettingsStore::open(config.clone(), packages).unwrap());
        let (tx, _rx) = mpsc::sync_channel(4);
        let watchdog = Arc::new(Watchdog::new(Arc::clone(store.context()), &config, tx));
        let notifier = Arc::new(Recorded::default());
        let orchestrator = RecoveryOrchestrator::new(Arc::clone(&store), watchdog, notifier.clone());
        (orchestrator, store, notifier, dir)
    }

    #[test]
    fn test_authorized_modification_ignored() {
        let (orchestrator, store, notifier, _dir) = setup();
        let event = WatchEvent::Observed { kind: FileEvent::Modified, authorized_window: true };
        assert!(orchestrator.handle_event(event).is_none());
        assert!(!store.context().watchdog_state().fail_safe_active());
        assert!(notifier.0.lock().is_empty());
    }

    #[test]
    fn test_recovery_replays_cache() {
        let (orchestrator, store, notifier, dir) = setup();
        store.save_settings(&SettingRecord::new("A").with(Category::Camera, PolicyValue::Error)).unwrap();
        store.save_settings(&SettingRecord::new("B")).unwrap();
        std::fs::write(dir.path().join("privacy.db"), b"garbage").unwrap();

        let event = WatchEvent::Observed { kind: FileEvent::Modified, authorized_window: false };
        let report = orchestrator.handle_event(event).unwrap();
        assert_eq!(report.reason, FileEvent::Modified);
        assert!(report.is_complete());
        assert_eq!(report.restored, 2);
        assert_eq!(orchestrator.recoveries(), 1);

        assert_eq!(
            *notifier.0.lock(),
            [
                Notification::FailSafeTriggered { reason: "database modified".into() },
                Notification::RecoveryComplete,
            ]
        );

        let state = store.context().watchdog_state();
        assert!(state.fail_safe_active());
        let locked = store.get_settings("A").unwrap().unwrap();
        assert!(locked.values().all(|(_, v)| v == PolicyValue::Empty));

        state.set_fail_safe(false);
        let a = store.get_settings("A").unwrap().unwrap();
        assert_eq!(a.get(Category::Camera), PolicyValue::Error);
    }

    #[test]
    fn test_recovery_is_one_shot() {
        let (orchestrator, _store, notifier, _dir) = setup();
        assert!(orchestrator.recover(FileEvent::Deleted).is_some());
        assert!(orchestrator.recover(FileEvent::Moved).is_none());
        assert_eq!(notifier.0.lock().len(), 2);
    }

    #[test]
    fn test_orchestrator_thread_consumes_events() {
        let (orchestrator, store, _notifier, _dir) = setup();
        let orchestrator = Arc::new(orchestrator);
        let (tx, rx) = mpsc::sync_channel(4);
        let handle = spawn_orchestrator(Arc::clone(&orchestrator), rx).unwrap();

        tx.send(WatchEvent::Observed { kind: FileEvent::Deleted, authorized_window: true }).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while orchestrator.recoveries() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(orchestrator.recoveries(), 1);
        assert!(store.context().watchdog_state().fail_safe_active());
        handle.shutdown();
    }
}
