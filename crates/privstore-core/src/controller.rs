//! Concurrency controller
//!
//! One `StoreContext` per store instance: a reader/writer lock guarding every
//! store operation, a counter of in-flight accessors deciding when the backing
//! handle may be closed, and the watchdog's shared state.
//!
//! Access is handed out as RAII guards. A `WriteAccess` is an authorized
//! transaction: the watchdog's authorized window is open from the moment the
//! write lock is taken until the guard drops, and on drop the current file
//! fingerprint is sealed as the new baseline before the window closes.
//! Operations that need to run inside an already-open window take
//! `&WriteAccess` instead of locking again.
//!
//! Before the window opens the file is compared with the sealed baseline. A
//! difference there happened outside any authorized transaction: it is
//! reported as tampering and the baseline is left alone, so a legitimate
//! write can never launder a foreign change. A file missing when the window
//! closes is reported the same way and never unseals the baseline. Only a
//! rebuild (`write_rebuild`) accepts the file as it then stands.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::handle::DbHandle;
use crate::watchdog::{observe, FileEvent, Fingerprint, WatchEvent};

/// Flags shared between the controller, the watcher and the recovery path.
pub struct WatchdogState {
    /// Set while the store's own writes are in progress
    authorized_window: AtomicBool,
    /// Set on tamper detection; cleared only by an administrative call
    fail_safe: AtomicBool,
    /// Fingerprint of the backing file at the end of the last authorized transaction
    sealed: Mutex<Option<Fingerprint>>,
    /// Orchestrator inbox for tampering found by the controller itself
    reporter: Mutex<Option<SyncSender<WatchEvent>>>,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self {
            authorized_window: AtomicBool::new(false),
            fail_safe: AtomicBool::new(false),
            sealed: Mutex::new(None),
            reporter: Mutex::new(None),
        }
    }

    pub fn authorized_window_open(&self) -> bool {
        self.authorized_window.load(Ordering::Acquire)
    }

    pub fn fail_safe_active(&self) -> bool {
        self.fail_safe.load(Ordering::Acquire)
    }

    /// Administrative set/clear.
    pub fn set_fail_safe(&self, active: bool) {
        warn!(active, "fail-safe mode changed");
        self.fail_safe.store(active, Ordering::Release);
    }

    /// Activate fail-safe. Returns false if it was already active.
    pub fn enter_fail_safe(&self) -> bool {
        self.fail_safe
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn sealed(&self) -> Option<Fingerprint> {
        self.sealed.lock().clone()
    }

    pub(crate) fn seal(&self, fingerprint: Fingerprint) {
        *self.sealed.lock() = Some(fingerprint);
    }

    /// Route tamper reports to the event channel the watcher publishes on.
    pub(crate) fn attach_reporter(&self, events: SyncSender<WatchEvent>) {
        *self.reporter.lock() = Some(events);
    }

    /// Publish a change that happened outside any authorized window.
    pub(crate) fn report_tamper(&self, kind: FileEvent) {
        let event = WatchEvent::Observed { kind, authorized_window: false };
        match self.reporter.lock().as_ref().map(|events| events.try_send(event)) {
            Some(Ok(())) => {}
            Some(Err(TrySendError::Full(_))) => debug!("event channel full, dropping duplicate trigger"),
            Some(Err(TrySendError::Disconnected(_))) => debug!("event channel closed"),
            None => warn!(event = %kind, "no watchdog attached, tamper left for the next poll"),
        }
    }
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared lock, access counter, handle and watchdog state for one store.
pub struct StoreContext {
    lock: RwLock<()>,
    /// Thread currently holding the write lock
    writer: Mutex<Option<ThreadId>>,
    access_count: AtomicUsize,
    auto_close_idle: AtomicBool,
    handle: DbHandle,
    watchdog: WatchdogState,
}

impl StoreContext {
    pub fn new(config: &Config) -> Self {
        Self {
            lock: RwLock::new(()),
            writer: Mutex::new(None),
            access_count: AtomicUsize::new(0),
            auto_close_idle: AtomicBool::new(config.auto_close_idle_handle),
            handle: DbHandle::new(&config.db_path, config.max_query_attempts),
            watchdog: WatchdogState::new(),
        }
    }

    pub fn handle(&self) -> &DbHandle {
        &self.handle
    }

    pub fn watchdog_state(&self) -> &WatchdogState {
        &self.watchdog
    }

    /// Accessors currently inside a store operation.
    pub fn access_count(&self) -> usize {
        self.access_count.load(Ordering::Acquire)
    }

    pub fn auto_close_idle(&self) -> bool {
        self.auto_close_idle.load(Ordering::Relaxed)
    }

    pub fn set_auto_close_idle(&self, enabled: bool) {
        self.auto_close_idle.store(enabled, Ordering::Relaxed);
    }

    /// Shared access. Blocks while a writer holds the lock.
    pub fn read(&self) -> StoreResult<ReadAccess<'_>> {
        self.refuse_reentry()?;
        self.announce();
        trace!("read lock: acquiring");
        let guard = self.lock.read();
        trace!("read lock: acquired");
        Ok(ReadAccess { ctx: self, _guard: guard })
    }

    /// Exclusive access inside an authorized window.
    pub fn write(&self) -> StoreResult<WriteAccess<'_>> {
        self.acquire_write(false)
    }

    /// Exclusive access for wiping and recreating the backing file. The
    /// baseline check is skipped and whatever file exists when the guard
    /// drops becomes the new baseline.
    pub(crate) fn write_rebuild(&self) -> StoreResult<WriteAccess<'_>> {
        self.acquire_write(true)
    }

    fn acquire_write(&self, rebuild: bool) -> StoreResult<WriteAccess<'_>> {
        self.refuse_reentry()?;
        self.announce();
        trace!("write lock: acquiring");
        let guard = self.lock.write();
        *self.writer.lock() = Some(thread::current().id());
        let tampered = if rebuild { None } else { self.check_baseline() };
        self.begin_authorized_transaction();
        trace!("write lock: acquired");
        Ok(WriteAccess { ctx: self, _guard: guard, tampered, rebuild })
    }

    /// Non-blocking shared lock for observers that never touch the handle.
    /// Returns None while a writer is active.
    pub fn try_observe(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.lock.try_read()
    }

    fn refuse_reentry(&self) -> StoreResult<()> {
        if *self.writer.lock() == Some(thread::current().id()) {
            warn!("refusing to re-acquire the store lock from the thread that holds it");
            return Err(StoreError::NestedTransaction);
        }
        Ok(())
    }

    fn announce(&self) {
        let threads = self.access_count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(threads, "store accessor announced");
    }

    /// Called once per finished accessor, before its lock is released.
    fn release(&self) {
        let previous = self
            .access_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);
        trace!(threads = remaining, "store accessor released");
        if remaining == 0 && self.auto_close_idle() {
            self.handle.close();
        }
    }

    /// Compare the file with the baseline while no authorized write is in
    /// progress. Returns the change if there was one.
    fn check_baseline(&self) -> Option<FileEvent> {
        let sealed = self.watchdog.sealed();
        match observe(self.handle.path(), sealed.as_ref()) {
            Ok(Some(kind)) => {
                warn!(event = %kind, "database changed since the last authorized write");
                self.watchdog.report_tamper(kind);
                Some(kind)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "could not fingerprint database before write");
                None
            }
        }
    }

    fn begin_authorized_transaction(&self) {
        self.watchdog.authorized_window.store(true, Ordering::Release);
    }

    /// Seal the file as it stands now, then close the window.
    fn end_authorized_transaction(&self, tampered: Option<FileEvent>, rebuild: bool) {
        if let Some(kind) = tampered {
            warn!(event = %kind, "keeping the last trusted fingerprint");
        } else {
            match Fingerprint::capture(self.handle.path()) {
                Ok(Some(fingerprint)) => self.watchdog.seal(fingerprint),
                Ok(None) if rebuild => warn!("database missing after rebuild"),
                Ok(None) => {
                    if self.watchdog.sealed().is_some() {
                        warn!("database vanished during an authorized write");
                        self.watchdog.report_tamper(FileEvent::Deleted);
                    }
                }
                Err(e) => warn!(error = %e, "could not fingerprint database after write"),
            }
        }
        self.watchdog.authorized_window.store(false, Ordering::Release);
        debug!("authorized transaction ended");
    }
}

/// Shared access guard.
pub struct ReadAccess<'a> {
    ctx: &'a StoreContext,
    _guard: RwLockReadGuard<'a, ()>,
}

impl Drop for ReadAccess<'_> {
    fn drop(&mut self) {
        self.ctx.release();
    }
}

/// Exclusive access guard; the authorized window is open for its lifetime.
pub struct WriteAccess<'a> {
    ctx: &'a StoreContext,
    _guard: RwLockWriteGuard<'a, ()>,
    /// Foreign change found when the lock was taken
    tampered: Option<FileEvent>,
    rebuild: bool,
}

impl WriteAccess<'_> {
    pub fn context(&self) -> &StoreContext {
        self.ctx
    }

    pub fn tampered(&self) -> Option<FileEvent> {
        self.tampered
    }
}

impl Drop for WriteAccess<'_> {
    fn drop(&mut self) {
        self.ctx.release();
        self.ctx.end_authorized_transaction(self.tampered, self.rebuild);
        *self.ctx.writer.lock() = None;
        trace!("write lock: released");
    }
}
