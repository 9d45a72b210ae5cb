//! Store engine: settings persistence with a write-through cache.
//!
//! SettingsStore owns the backing database, the plain-text mirror tree and
//! the settings cache. Every operation runs inside a `StoreContext` critical
//! section: reads under the shared lock, mutations under the exclusive lock
//! with the watchdog's authorized window open.
//!
//! **Read path**: fail-safe check, then cache, then database (populating the cache)
//! **Write path**: database transaction + mirror files, commit, then cache
//!
//! Public operations report integrity and mirror failures as `Ok(false)` or
//! `Ok(None)` after logging them. A stale handle that survives every retry
//! and a refused nested lock are returned as errors.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::TransactionBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::SettingsCache;
use crate::config::Config;
use crate::controller::{StoreContext, WriteAccess};
use crate::error::{StoreError, StoreResult};
use crate::external::PackageSource;
use crate::migration;
use crate::mirror::MirrorTree;
use crate::record::SettingRecord;
use crate::schema::{self, SCHEMA_VERSION, TABLE_SETTINGS};

/// Settings store: backing database + mirror files + cache.
///
/// All public methods take `&self` and may be called from many threads.
pub struct SettingsStore {
    config: Config,
    ctx: Arc<StoreContext>,
    cache: SettingsCache,
    mirror: MirrorTree,
    packages: Arc<dyn PackageSource>,
    use_cache: AtomicBool,
}

impl SettingsStore {
    /// Open or create the store described by `config`.
    ///
    /// Creates the database and mirror root if missing, migrates an older
    /// schema (followed by a purge of uninstalled applications), and fills
    /// the cache for every installed application.
    pub fn open(config: Config, packages: Arc<dyn PackageSource>) -> StoreResult<Self> {
        config.validate()?;
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let store = Self {
            ctx: Arc::new(StoreContext::new(&config)),
            cache: SettingsCache::new(),
            mirror: MirrorTree::new(&config.settings_dir),
            use_cache: AtomicBool::new(config.use_cache),
            packages,
            config,
        };

        {
            let access = store.ctx.write()?;
            store.initialize_locked(&access)?;
            let version = store
                .ctx
                .handle()
                .with_conn(|conn| migration::stored_version(conn))?;
            if version < SCHEMA_VERSION {
                store.migrate_locked(&access)?;
            }
        }

        let filled = store.fill_cache();
        info!(
            path = %store.config.db_path.display(),
            cached = filled,
            "settings store ready"
        );
        Ok(store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared controller state, for the watchdog and orchestrator.
    pub fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    pub fn cache(&self) -> &SettingsCache {
        &self.cache
    }

    pub fn mirror(&self) -> &MirrorTree {
        &self.mirror
    }

    pub fn packages(&self) -> &Arc<dyn PackageSource> {
        &self.packages
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache.load(Ordering::Relaxed)
    }

    pub fn set_use_cache(&self, enabled: bool) {
        self.use_cache.store(enabled, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Global settings
    // ------------------------------------------------------------------

    pub fn get_value(&self, name: &str) -> StoreResult<Option<String>> {
        let _access = self.ctx.read()?;
        let result = self.ctx.handle().with_read_conn(|conn| schema::get_value(conn, name));
        settle("get_value", result, None)
    }

    pub fn set_value(&self, name: &str, value: &str) -> StoreResult<bool> {
        let _access = self.ctx.write()?;
        let result = self
            .ctx
            .handle()
            .with_conn(|conn| schema::set_value(conn, name, value))
            .map(|()| true);
        settle("set_value", result, false)
    }

    // ------------------------------------------------------------------
    // Per-application settings
    // ------------------------------------------------------------------

    /// Settings for one application.
    ///
    /// While fail-safe is active every application gets the locked-down
    /// record and storage is not touched.
    pub fn get_settings(&self, app_id: &str) -> StoreResult<Option<SettingRecord>> {
        if self.ctx.watchdog_state().fail_safe_active() {
            debug!(app_id, "fail-safe active, returning locked-down settings");
            return Ok(Some(SettingRecord::locked_down(app_id)));
        }
        if self.use_cache() {
            if let Some(record) = self.cache.get(app_id) {
                return Ok(Some(record));
            }
        }
        self.read_through(app_id)
    }

    /// Read from the database regardless of cache and fail-safe state.
    pub fn fill_settings(&self, app_id: &str) -> StoreResult<Option<SettingRecord>> {
        self.read_through(app_id)
    }

    /// Load every installed application into the cache. Returns the number of
    /// records found.
    pub fn fill_cache(&self) -> usize {
        let mut installed: Vec<String> = self.packages.installed_packages().into_iter().collect();
        installed.sort();
        let mut filled = 0;
        for app_id in &installed {
            match self.fill_settings(app_id) {
                Ok(Some(_)) => filled += 1,
                Ok(None) => {}
                Err(e) => warn!(app_id = %app_id, error = %e, "could not fill cache"),
            }
        }
        debug!(installed = installed.len(), filled, "filled settings cache");
        filled
    }

    fn read_through(&self, app_id: &str) -> StoreResult<Option<SettingRecord>> {
        let _access = self.ctx.read()?;
        let result = self.ctx.handle().with_read_conn(|conn| schema::load_record(conn, app_id));
        let record = settle("get_settings", result, None)?;
        if let Some(record) = &record {
            self.cache.insert_clean(record.clone());
        }
        Ok(record)
    }

    /// Insert or update the settings of `record.app_id`.
    pub fn save_settings(&self, record: &SettingRecord) -> StoreResult<bool> {
        let access = self.ctx.write()?;
        let result = self.save_locked(&access, record).map(|_| true);
        settle("save_settings", result, false)
    }

    /// Remove the settings of one application. `Ok(false)` if none were stored.
    pub fn delete_settings(&self, app_id: &str) -> StoreResult<bool> {
        let access = self.ctx.write()?;
        let result = self.delete_locked(&access, app_id);
        settle("delete_settings", result, false)
    }

    /// Remove every application not in `installed`.
    pub fn purge_settings(&self, installed: &HashSet<String>) -> StoreResult<bool> {
        let access = self.ctx.write()?;
        let result = self.purge_locked(&access, installed).map(|_| true);
        settle("purge_settings", result, false)
    }

    // ------------------------------------------------------------------
    // Operations inside an open authorized window
    // ------------------------------------------------------------------

    /// Persist one record. Returns the stored copy with its row id.
    pub(crate) fn save_locked(
        &self,
        _access: &WriteAccess<'_>,
        record: &SettingRecord,
    ) -> StoreResult<SettingRecord> {
        let mirror = &self.mirror;
        let id = self.ctx.handle().with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = schema::save_record(&tx, record)?;
            let undo = mirror.write(record)?;
            if let Err(e) = tx.commit() {
                undo.restore();
                return Err(e.into());
            }
            Ok(id)
        })?;

        let mut stored = record.clone();
        stored.id = Some(id);
        self.cache.update(stored.clone());
        debug!(app_id = %stored.app_id, id, "saved settings");
        Ok(stored)
    }

    fn delete_locked(&self, _access: &WriteAccess<'_>, app_id: &str) -> StoreResult<bool> {
        let mirror = &self.mirror;
        let removed = self.ctx.handle().with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = schema::delete_record(&tx, app_id)?;
            let undo = mirror.remove(app_id)?;
            if let Err(e) = tx.commit() {
                undo.restore();
                return Err(e.into());
            }
            Ok(removed)
        })?;

        self.cache.remove(app_id);
        if removed == 0 {
            warn!(app_id, "no stored settings to delete");
        }
        Ok(removed > 0)
    }

    pub(crate) fn purge_locked(
        &self,
        _access: &WriteAccess<'_>,
        installed: &HashSet<String>,
    ) -> StoreResult<Vec<String>> {
        let mirror = &self.mirror;
        let removed = self.ctx.handle().with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = schema::purge_records(&tx, installed)?;
            let (dirs, undo) = mirror.purge_except(installed)?;
            if let Err(e) = tx.commit() {
                undo.restore();
                return Err(e.into());
            }
            debug!(rows = removed.len(), dirs = dirs.len(), "purged uninstalled applications");
            Ok(removed)
        })?;

        for app_id in &removed {
            self.cache.remove(app_id);
        }
        for record in self.cache.snapshot() {
            if !installed.contains(&record.app_id) {
                self.cache.remove(&record.app_id);
            }
        }
        if !removed.is_empty() {
            info!(removed = ?removed, "purged settings");
        }
        Ok(removed)
    }

    fn migrate_locked(&self, access: &WriteAccess<'_>) -> StoreResult<()> {
        let mirror = &self.mirror;
        let version = self
            .ctx
            .handle()
            .with_conn(|conn| migration::migrate(conn, mirror))?;
        info!(version, "settings schema up to date");
        let installed = self.packages.installed_packages();
        self.purge_locked(access, &installed)?;
        Ok(())
    }

    /// Create the mirror root and, if the database has no settings table, the
    /// full current layout.
    pub(crate) fn initialize_locked(&self, _access: &WriteAccess<'_>) -> StoreResult<()> {
        self.mirror.ensure_root()?;
        let mut conn = self.ctx.handle().create()?;
        if !schema::table_exists(&conn, TABLE_SETTINGS)? {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            schema::create_tables(&tx)?;
            tx.commit()?;
            info!(path = %self.config.db_path.display(), "created settings database");
        }
        Ok(())
    }

    /// Delete the database, its companions and the whole mirror tree.
    pub(crate) fn wipe_locked(&self, _access: &WriteAccess<'_>) -> StoreResult<()> {
        self.ctx.handle().close();
        remove_if_present(&self.config.db_path)?;
        for companion in self.config.companion_paths() {
            remove_if_present(&companion)?;
        }
        self.mirror.remove_all()?;
        warn!(path = %self.config.db_path.display(), "wiped settings database and mirror files");
        Ok(())
    }

    /// Re-insert every cached record into a freshly initialized store.
    /// Returns the application ids that could not be restored. The cache is
    /// empty afterwards either way.
    pub(crate) fn replay_cache_locked(&self, access: &WriteAccess<'_>) -> Vec<String> {
        self.cache.mark_all_new();
        let mut failed = Vec::new();
        for record in self.cache.pending() {
            match self.save_locked(access, &record) {
                Ok(_) => {
                    self.cache.remove(&record.app_id);
                }
                Err(e) => {
                    error!(app_id = %record.app_id, error = %e, "could not restore settings");
                    failed.push(record.app_id);
                }
            }
        }
        self.cache.clear();
        failed
    }
}

/// Fold non-fatal failures into `fallback`, logging them.
fn settle<T>(op: &'static str, result: StoreResult<T>, fallback: T) -> StoreResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e @ StoreError::StaleHandle { .. }) => {
            error!(op, error = %e, "database unavailable");
            Err(e)
        }
        Err(e) => {
            error!(op, error = %e, "operation failed, rolled back");
            Ok(fallback)
        }
    }
}

fn remove_if_present(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
