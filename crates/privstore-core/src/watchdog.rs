//! Watchdog: tamper detection on the backing file
//!
//! A watcher thread periodically fingerprints the database file (inode,
//! length, mtime and a CRC32C of its contents) and compares the result with
//! the fingerprint sealed by the controller at the end of the last authorized
//! transaction. Differences are published as `WatchEvent`s on a bounded
//! channel; the recovery orchestrator consumes them on its own thread.
//!
//! The comparison is made while holding the controller's read lock, taken
//! with a non-blocking try. While a writer is active the tick is skipped, so
//! the store's own writes are never observed half-way. Changes that land
//! between two ticks and are followed by a store write are caught by the
//! controller instead, which reports them on the same channel.
//!
//! States: `Idle` (no watcher) and `Watching`. `Triggered` is transient and
//! lives in the orchestrator.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::StoreContext;
use crate::error::{StoreError, StoreResult};

/// Upper bound on how long a stopping watcher takes to notice.
const SHUTDOWN_SLICE: Duration = Duration::from_millis(25);

/// Identity and content summary of the backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Inode number (0 where the platform has none)
    pub inode: u64,
    pub len: u64,
    pub modified: Option<SystemTime>,
    /// CRC32C of the whole file
    pub checksum: u32,
}

impl Fingerprint {
    /// Fingerprint the file at `path`. `Ok(None)` if it does not exist.
    pub fn capture(path: &Path) -> io::Result<Option<Self>> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(Self {
            inode: inode_of(&meta),
            len: meta.len(),
            modified: meta.modified().ok(),
            checksum: crc32c::crc32c(&bytes),
        }))
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Kind of change observed on the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEvent {
    Modified,
    Deleted,
    Moved,
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FileEvent::Modified => "database modified",
            FileEvent::Deleted => "database deleted",
            FileEvent::Moved => "database moved",
        };
        f.write_str(text)
    }
}

/// Message from the watcher to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// A change to the backing file, with the authorized-window flag as it
    /// stood when the change was observed
    Observed { kind: FileEvent, authorized_window: bool },
    /// The watcher thread ended without being asked to
    WatcherLost { authorized_window: bool },
}

/// Decide whether an event is tampering.
///
/// Modifications inside the authorized window are the store's own writes.
/// Deletion and moves are suspicious regardless of the window.
pub fn classify(event: &WatchEvent) -> Option<FileEvent> {
    match *event {
        WatchEvent::Observed { kind: FileEvent::Modified, authorized_window: true } => None,
        WatchEvent::Observed { kind, .. } => Some(kind),
        WatchEvent::WatcherLost { .. } => None,
    }
}

/// Compare the file at `path` with the sealed baseline.
pub fn observe(path: &Path, sealed: Option<&Fingerprint>) -> io::Result<Option<FileEvent>> {
    let Some(sealed) = sealed else {
        // Nothing authorized yet, nothing to protect
        return Ok(None);
    };
    let event = match Fingerprint::capture(path)? {
        None => Some(FileEvent::Deleted),
        Some(current) if current.inode != sealed.inode => Some(FileEvent::Moved),
        Some(current) if current != *sealed => Some(FileEvent::Modified),
        Some(_) => None,
    };
    Ok(event)
}

/// Watcher lifecycle as seen by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    Idle,
    Watching,
}

/// Handle to a running watcher thread.
/// Dropping this handle signals the thread to stop.
pub struct WatcherHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WatcherHandle {
    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Owner of the watcher: installs, stops and replaces it.
pub struct Watchdog {
    ctx: Arc<StoreContext>,
    path: PathBuf,
    cadence: Duration,
    events: SyncSender<WatchEvent>,
    watcher: Mutex<Option<WatcherHandle>>,
}

impl Watchdog {
    pub fn new(ctx: Arc<StoreContext>, config: &Config, events: SyncSender<WatchEvent>) -> Self {
        ctx.watchdog_state().attach_reporter(events.clone());
        Self {
            ctx,
            path: config.db_path.clone(),
            cadence: config.watchdog_poll_interval,
            events,
            watcher: Mutex::new(None),
        }
    }

    /// Idle -> Watching. No-op if a live watcher is installed.
    pub fn start(&self) -> StoreResult<()> {
        let mut slot = self.watcher.lock();
        if slot.as_ref().map_or(false, WatcherHandle::is_running) {
            return Ok(());
        }
        if let Some(dead) = slot.take() {
            dead.shutdown();
        }
        *slot = Some(self.spawn()?);
        info!(path = %self.path.display(), "started watching database");
        Ok(())
    }

    /// Watching -> Idle.
    pub fn stop(&self) {
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
            info!(path = %self.path.display(), "stopped watching database");
        }
    }

    /// Replace a watcher that ended unexpectedly. The authorized-window flag
    /// lives in the shared state, so the replacement sees the same window.
    pub fn reinstall(&self, authorized_window: bool) -> StoreResult<()> {
        let current = self.ctx.watchdog_state().authorized_window_open();
        warn!(
            last_known = authorized_window,
            current,
            "watcher lost, installing a replacement"
        );
        self.start()
    }

    pub fn status(&self) -> WatchdogStatus {
        match self.watcher.lock().as_ref() {
            Some(handle) if handle.is_running() => WatchdogStatus::Watching,
            _ => WatchdogStatus::Idle,
        }
    }

    /// Sender side of the event channel, for injecting events.
    pub fn sender(&self) -> SyncSender<WatchEvent> {
        self.events.clone()
    }

    fn spawn(&self) -> StoreResult<WatcherHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let watch = WatchLoop {
            ctx: Arc::clone(&self.ctx),
            path: self.path.clone(),
            cadence: self.cadence,
            events: self.events.clone(),
            shutdown: Arc::clone(&shutdown),
        };

        let thread = thread::Builder::new()
            .name("privstore-watchdog".to_string())
            .spawn(move || watch.run())
            .map_err(|e| StoreError::io(&self.path, e))?;

        Ok(WatcherHandle { shutdown, thread: Some(thread) })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.shutdown();
        }
    }
}

/// State owned by the watcher thread.
struct WatchLoop {
    ctx: Arc<StoreContext>,
    path: PathBuf,
    cadence: Duration,
    events: SyncSender<WatchEvent>,
    shutdown: Arc<AtomicBool>,
}

impl WatchLoop {
    fn run(self) {
        // Reports WatcherLost if this thread unwinds or returns without a shutdown request
        let _notice = LostNotice {
            ctx: Arc::clone(&self.ctx),
            events: self.events.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };
        let mut last_reported: Option<FileEvent> = None;

        loop {
            if !self.sleep_cadence() {
                return;
            }

            let observed = {
                let Some(_guard) = self.ctx.try_observe() else { continue };
                let sealed = self.ctx.watchdog_state().sealed();
                let authorized_window = self.ctx.watchdog_state().authorized_window_open();
                match observe(&self.path, sealed.as_ref()) {
                    Ok(kind) => kind.map(|kind| (kind, authorized_window)),
                    Err(e) => {
                        warn!(error = %e, "could not fingerprint database");
                        continue;
                    }
                }
            };

            match observed {
                Some((kind, authorized_window)) if last_reported != Some(kind) => {
                    warn!(event = %kind, "detected change to database");
                    self.publish(WatchEvent::Observed { kind, authorized_window });
                    last_reported = Some(kind);
                }
                Some(_) => {}
                None => last_reported = None,
            }
        }
    }

    /// Sleep one cadence. Returns false once shutdown was requested.
    fn sleep_cadence(&self) -> bool {
        let wake_time = Instant::now() + self.cadence;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= wake_time {
                return true;
            }
            thread::sleep(SHUTDOWN_SLICE.min(wake_time - now));
        }
    }

    fn publish(&self, event: WatchEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("event channel full, dropping duplicate trigger"),
            Err(TrySendError::Disconnected(_)) => debug!("event channel closed"),
        }
    }
}

struct LostNotice {
    ctx: Arc<StoreContext>,
    events: SyncSender<WatchEvent>,
    shutdown: Arc<AtomicBool>,
}

impl Drop for LostNotice {
    fn drop(&mut self) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let authorized_window = self.ctx.watchdog_state().authorized_window_open();
        let _ = self.events.try_send(WatchEvent::WatcherLost { authorized_window });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    impl Watchdog {
        fn watcher_id(&self) -> Option<thread::ThreadId> {
            let slot = self.watcher.lock();
            slot.as_ref().and_then(|h| h.thread.as_ref()).map(|t| t.thread().id())
        }
    }

    fn setup() -> (Arc<StoreContext>, Config, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::testing(dir.path());
        let ctx = Arc::new(StoreContext::new(&config));
        {
            let conn = ctx.handle().create().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        }
        // Seal the freshly created file
        drop(ctx.write().unwrap());
        (ctx, config, dir)
    }

    #[test]
    fn test_classify() {
        let modified = |authorized_window| WatchEvent::Observed { kind: FileEvent::Modified, authorized_window };
        assert_eq!(classify(&modified(false)), Some(FileEvent::Modified));
        assert_eq!(classify(&modified(true)), None);

        for kind in [FileEvent::Deleted, FileEvent::Moved] {
            for authorized_window in [false, true] {
                let event = WatchEvent::Observed { kind, authorized_window };
                assert_eq!(classify(&event), Some(kind));
            }
        }
        assert_eq!(classify(&WatchEvent::WatcherLost { authorized_window: true }), None);
    }

    #[test]
    fn test_observe_detects_changes() {
        let (ctx, config, _dir) = setup();
        let sealed = ctx.watchdog_state().sealed();
        assert!(sealed.is_some());
        assert_eq!(observe(&config.db_path, sealed.as_ref()).unwrap(), None);

        // Unauthorized write through a separate connection
        let conn = rusqlite::Connection::open(&config.db_path).unwrap();
        conn.execute("INSERT INTO t (x) VALUES (1)", []).unwrap();
        drop(conn);
        assert_eq!(observe(&config.db_path, sealed.as_ref()).unwrap(), Some(FileEvent::Modified));

        std::fs::remove_file(&config.db_path).unwrap();
        assert_eq!(observe(&config.db_path, sealed.as_ref()).unwrap(), Some(FileEvent::Deleted));
    }

    #[cfg(unix)]
    #[test]
    fn test_observe_detects_replacement() {
        let (ctx, config, dir) = setup();
        let sealed = ctx.watchdog_state().sealed();
        let other = dir.path().join("other.db");
        std::fs::copy(&config.db_path, &other).unwrap();
        std::fs::rename(&other, &config.db_path).unwrap();
        assert_eq!(observe(&config.db_path, sealed.as_ref()).unwrap(), Some(FileEvent::Moved));
    }

    #[test]
    fn test_observe_without_baseline() {
        let dir = TempDir::new().unwrap();
        assert_eq!(observe(&dir.path().join("privacy.db"), None).unwrap(), None);
    }

    #[test]
    fn test_authorized_writes_not_reported() {
        let (ctx, config, _dir) = setup();
        let (tx, rx) = mpsc::sync_channel(4);
        let watchdog = Watchdog::new(Arc::clone(&ctx), &config, tx);
        watchdog.start().unwrap();
        assert_eq!(watchdog.status(), WatchdogStatus::Watching);

        for i in 0..5 {
            let _access = ctx.write().unwrap();
            ctx.handle()
                .with_conn(|conn| Ok(conn.execute("INSERT INTO t (x) VALUES (?1)", [i])?))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err());

        watchdog.stop();
        assert_eq!(watchdog.status(), WatchdogStatus::Idle);
    }

    #[test]
    fn test_unauthorized_write_reported_once() {
        let (ctx, config, _dir) = setup();
        let (tx, rx) = mpsc::sync_channel(4);
        let watchdog = Watchdog::new(Arc::clone(&ctx), &config, tx);
        watchdog.start().unwrap();

        let conn = rusqlite::Connection::open(&config.db_path).unwrap();
        conn.execute("INSERT INTO t (x) VALUES (7)", []).unwrap();
        drop(conn);

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, WatchEvent::Observed { kind: FileEvent::Modified, authorized_window: false });
        std::thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err(), "same change must not be reported twice");
        watchdog.stop();
    }

    #[test]
    fn test_tamper_then_write_reaches_channel() {
        let (ctx, mut config, _dir) = setup();
        // No poll can happen during the test
        config.watchdog_poll_interval = Duration::from_secs(60);
        let (tx, rx) = mpsc::sync_channel(4);
        let watchdog = Watchdog::new(Arc::clone(&ctx), &config, tx);
        watchdog.start().unwrap();

        let conn = rusqlite::Connection::open(&config.db_path).unwrap();
        conn.execute("INSERT INTO t (x) VALUES (9)", []).unwrap();
        drop(conn);
        drop(ctx.write().unwrap());

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(classify(&event), Some(FileEvent::Modified));
        watchdog.stop();
    }

    #[test]
    fn test_start_is_idempotent() {
        let (ctx, config, _dir) = setup();
        let (tx, _rx) = mpsc::sync_channel(4);
        let watchdog = Watchdog::new(ctx, &config, tx);
        watchdog.start().unwrap();
        let first = watchdog.watcher_id();
        watchdog.start().unwrap();
        assert_eq!(watchdog.watcher_id(), first);
        watchdog.reinstall(false).unwrap();
        assert_eq!(watchdog.watcher_id(), first, "live watcher is kept");
        watchdog.stop();
        assert_eq!(watchdog.watcher_id(), None);
        watchdog.start().unwrap();
        assert_ne!(watchdog.watcher_id(), first);
    }
}
