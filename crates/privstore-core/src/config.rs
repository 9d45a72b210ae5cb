//! Configuration management for PrivStore
//!
//! Provides layout presets for a system-wide install and for tests,
//! plus validation of the tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Database file name inside the store root.
pub const DATABASE_FILE_NAME: &str = "privacy.db";

/// Mirror directory name inside the store root.
pub const SETTINGS_DIR_NAME: &str = "privacy";

/// Bound on close-and-reopen attempts for a stale handle.
pub const DEFAULT_MAX_QUERY_ATTEMPTS: u32 = 5;

/// PrivStore configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing relational file
    pub db_path: PathBuf,
    /// Root of the per-application plain-text mirror tree
    pub settings_dir: PathBuf,
    /// How often the watcher fingerprints the backing file
    pub watchdog_poll_interval: Duration,
    /// Capacity of the bounded watcher -> orchestrator event channel
    pub event_channel_capacity: usize,
    /// Attempts per query before a stale handle becomes fatal
    pub max_query_attempts: u32,
    /// Close the handle whenever the access counter drops to zero
    pub auto_close_idle_handle: bool,
    /// Serve reads from the cache when possible
    pub use_cache: bool,
    /// Install the watcher when the service starts
    pub start_watchdog: bool,
}

impl Config {
    /// System-wide layout: `<root>/privacy.db` plus `<root>/privacy/`.
    pub fn system<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            db_path: root.join(DATABASE_FILE_NAME),
            settings_dir: root.join(SETTINGS_DIR_NAME),
            watchdog_poll_interval: Duration::from_millis(500),
            event_channel_capacity: 16,
            max_query_attempts: DEFAULT_MAX_QUERY_ATTEMPTS,
            auto_close_idle_handle: false,
            use_cache: true,
            start_watchdog: true,
        }
    }

    /// Same layout as `system`, with a fast watcher cadence.
    pub fn testing<P: AsRef<Path>>(root: P) -> Self {
        Self {
            watchdog_poll_interval: Duration::from_millis(20),
            ..Self::system(root)
        }
    }

    /// Companion rollback journal written next to the database.
    pub fn journal_path(&self) -> PathBuf {
        companion_path(&self.db_path, "-journal")
    }

    /// Every file SQLite may create next to the database.
    pub fn companion_paths(&self) -> Vec<PathBuf> {
        ["-journal", "-wal", "-shm"]
            .iter()
            .map(|suffix| companion_path(&self.db_path, suffix))
            .collect()
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_query_attempts == 0 {
            return Err(StoreError::Config("max_query_attempts must be > 0".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(StoreError::Config("event_channel_capacity must be > 0".into()));
        }
        if self.watchdog_poll_interval.as_millis() == 0 {
            return Err(StoreError::Config("watchdog_poll_interval must be > 0".into()));
        }
        if self.db_path == self.settings_dir {
            return Err(StoreError::Config(
                "settings_dir must differ from db_path".into(),
            ));
        }
        if self.db_path.file_name().is_none() {
            return Err(StoreError::Config("db_path must name a file".into()));
        }
        Ok(())
    }
}

fn companion_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        assert!(Config::system("/data/system").validate().is_ok());
        assert!(Config::testing("/tmp/privstore").validate().is_ok());
    }

    #[test]
    fn test_system_layout() {
        let config = Config::system("/data/system");
        assert_eq!(config.db_path, PathBuf::from("/data/system/privacy.db"));
        assert_eq!(config.settings_dir, PathBuf::from("/data/system/privacy"));
        assert_eq!(config.journal_path(), PathBuf::from("/data/system/privacy.db-journal"));
        assert_eq!(config.max_query_attempts, 5);
        assert!(!config.auto_close_idle_handle);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::system("/data/system");
        config.max_query_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::system("/data/system");
        config.settings_dir = config.db_path.clone();
        assert!(config.validate().is_err());

        let mut config = Config::system("/data/system");
        config.event_channel_capacity = 0;
        assert!(config.validate().is_err());
    }
}
