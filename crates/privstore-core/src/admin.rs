//! Administrative surface
//!
//! Global flags, fail-safe control, purge, schema version and runtime debug
//! flags. Debug flags are string keyed; every flag has an integer view and
//! boolean flags also have a boolean view.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::error::StoreResult;
use crate::record::{SETTING_DB_VERSION, SETTING_ENABLED, SETTING_NOTIFICATIONS_ENABLED, VALUE_FALSE, VALUE_TRUE};
use crate::store::SettingsStore;

/// Runtime tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugFlag {
    /// Serve reads from the cache
    UseCache,
    /// Close the database handle when idle
    AutoCloseDb,
    /// Stale-handle retry bound
    MaxQueryAttempts,
}

impl DebugFlag {
    pub const ALL: [DebugFlag; 3] = [DebugFlag::UseCache, DebugFlag::AutoCloseDb, DebugFlag::MaxQueryAttempts];

    pub fn name(self) -> &'static str {
        match self {
            DebugFlag::UseCache => "use_cache",
            DebugFlag::AutoCloseDb => "auto_close_db",
            DebugFlag::MaxQueryAttempts => "max_query_attempts",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.name() == name)
    }

    pub fn is_bool(self) -> bool {
        !matches!(self, DebugFlag::MaxQueryAttempts)
    }
}

impl fmt::Display for DebugFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Administrative operations on one store.
#[derive(Clone)]
pub struct Admin {
    store: Arc<SettingsStore>,
}

impl Admin {
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self { store }
    }

    pub fn set_enabled(&self, enabled: bool) -> StoreResult<bool> {
        self.store.set_value(SETTING_ENABLED, flag_value(enabled))
    }

    /// Missing flag reads as enabled, the value written on creation.
    pub fn is_enabled(&self) -> StoreResult<bool> {
        Ok(self.store.get_value(SETTING_ENABLED)?.map_or(true, |v| v == VALUE_TRUE))
    }

    pub fn set_notifications_enabled(&self, enabled: bool) -> StoreResult<bool> {
        self.store.set_value(SETTING_NOTIFICATIONS_ENABLED, flag_value(enabled))
    }

    pub fn notifications_enabled(&self) -> StoreResult<bool> {
        Ok(self
            .store
            .get_value(SETTING_NOTIFICATIONS_ENABLED)?
            .map_or(true, |v| v == VALUE_TRUE))
    }

    /// Set or clear fail-safe mode.
    pub fn set_fail_safe(&self, active: bool) {
        self.store.context().watchdog_state().set_fail_safe(active);
    }

    pub fn is_fail_safe_active(&self) -> bool {
        self.store.context().watchdog_state().fail_safe_active()
    }

    /// Remove settings of every application that is no longer installed.
    pub fn purge(&self) -> StoreResult<bool> {
        let installed = self.store.packages().installed_packages();
        self.store.purge_settings(&installed)
    }

    /// Stored schema version, None if missing or unparsable.
    pub fn db_version(&self) -> StoreResult<Option<u32>> {
        Ok(self
            .store
            .get_value(SETTING_DB_VERSION)?
            .and_then(|v| v.trim().parse().ok()))
    }

    /// False for an unknown flag or a negative retry bound.
    pub fn set_debug_flag_int(&self, name: &str, value: i64) -> bool {
        let Some(flag) = DebugFlag::from_name(name) else { return false };
        match flag {
            DebugFlag::MaxQueryAttempts => {
                let Ok(attempts) = u32::try_from(value) else { return false };
                self.store.context().handle().set_max_attempts(attempts);
            }
            DebugFlag::UseCache | DebugFlag::AutoCloseDb => self.apply_bool(flag, value != 0),
        }
        info!(flag = %flag, value, "debug flag changed");
        true
    }

    pub fn get_debug_flag_int(&self, name: &str) -> Option<i64> {
        DebugFlag::from_name(name).map(|flag| self.flag_int(flag))
    }

    /// False for an unknown or non-boolean flag.
    pub fn set_debug_flag_bool(&self, name: &str, value: bool) -> bool {
        match DebugFlag::from_name(name) {
            Some(flag) if flag.is_bool() => {
                self.apply_bool(flag, value);
                info!(flag = %flag, value, "debug flag changed");
                true
            }
            _ => false,
        }
    }

    pub fn get_debug_flag_bool(&self, name: &str) -> Option<bool> {
        match DebugFlag::from_name(name) {
            Some(flag) if flag.is_bool() => Some(self.flag_int(flag) != 0),
            _ => None,
        }
    }

    /// Every flag with its integer value.
    pub fn debug_flags(&self) -> Vec<(&'static str, i64)> {
        DebugFlag::ALL.iter().map(|flag| (flag.name(), self.flag_int(*flag))).collect()
    }

    fn apply_bool(&self, flag: DebugFlag, value: bool) {
        match flag {
            DebugFlag::UseCache => self.store.set_use_cache(value),
            DebugFlag::AutoCloseDb => self.store.context().set_auto_close_idle(value),
            DebugFlag::MaxQueryAttempts => {}
        }
    }

    fn flag_int(&self, flag: DebugFlag) -> i64 {
        match flag {
            DebugFlag::UseCache => i64::from(self.store.use_cache()),
            DebugFlag::AutoCloseDb => i64::from(self.store.context().auto_close_idle()),
            DebugFlag::MaxQueryAttempts => i64::from(self.store.context().handle().max_attempts()),
        }
    }
}

fn flag_value(enabled: bool) -> &'static str {
    if enabled { VALUE_TRUE } else { VALUE_FALSE }
}
