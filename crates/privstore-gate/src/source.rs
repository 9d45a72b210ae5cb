//! Where a gate gets its settings from.

use std::sync::Arc;

use privstore_core::record::{SETTING_ENABLED, VALUE_TRUE};
use privstore_core::{PrivacyService, SettingRecord, SettingsStore};
use tracing::warn;

/// Read-only view of the settings store used by gated accessors.
pub trait SettingsSource: Send + Sync {
    /// Settings for one application, None if none are stored.
    fn settings_for(&self, app_id: &str) -> Option<SettingRecord>;

    /// Whether policy enforcement is switched on.
    fn is_enabled(&self) -> bool;
}

impl SettingsSource for SettingsStore {
    fn settings_for(&self, app_id: &str) -> Option<SettingRecord> {
        match self.get_settings(app_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(app_id, error = %e, "settings unavailable for gated access");
                None
            }
        }
    }

    /// An unreadable flag counts as enabled, so policy still applies.
    fn is_enabled(&self) -> bool {
        match self.get_value(SETTING_ENABLED) {
            Ok(value) => value.map_or(true, |v| v == VALUE_TRUE),
            Err(e) => {
                warn!(error = %e, "could not read enabled flag");
                true
            }
        }
    }
}

impl SettingsSource for PrivacyService {
    fn settings_for(&self, app_id: &str) -> Option<SettingRecord> {
        self.store().settings_for(app_id)
    }

    fn is_enabled(&self) -> bool {
        self.store().is_enabled()
    }
}

impl<S: SettingsSource + ?Sized> SettingsSource for Arc<S> {
    fn settings_for(&self, app_id: &str) -> Option<SettingRecord> {
        (**self).settings_for(app_id)
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }
}
