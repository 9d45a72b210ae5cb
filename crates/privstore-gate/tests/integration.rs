//! Integration tests: gated accessors over a real settings store.

use std::sync::Arc;

use tempfile::TempDir;

use privstore_core::{
    Category, Config, LogNotifier, PolicyValue, PrivacyService, SettingRecord, SettingsStore,
    StaticPackages,
};
use privstore_gate::{GateConfig, GateError, PolicyGatedAccessor, SettingsSource};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_store() -> (Arc<SettingsStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let packages = Arc::new(StaticPackages::new(["com.example.maps"]));
    let store = SettingsStore::open(Config::testing(dir.path()), packages).unwrap();
    (Arc::new(store), dir)
}

fn location_gate<S: SettingsSource>(source: S) -> PolicyGatedAccessor<S, impl Fn() -> (f64, f64), (f64, f64)> {
    PolicyGatedAccessor::new(
        source,
        GateConfig::new(Category::LocationGps),
        || (48.8584, 2.2945),
        || (0.0, 0.0),
    )
}

// ---------------------------------------------------------------------------
// Gated access
// ---------------------------------------------------------------------------

#[test]
fn test_gate_follows_stored_settings() {
    let (store, _dir) = test_store();
    let gate = location_gate(Arc::clone(&store));

    assert_eq!(gate.get(Some("com.example.maps")).unwrap(), (48.8584, 2.2945));

    let record = SettingRecord::new("com.example.maps").with(Category::LocationGps, PolicyValue::Empty);
    assert!(store.save_settings(&record).unwrap());
    assert_eq!(gate.get(Some("com.example.maps")).unwrap(), (0.0, 0.0));

    let record = record.with(Category::LocationGps, PolicyValue::Error);
    assert!(store.save_settings(&record).unwrap());
    assert_eq!(
        gate.get(Some("com.example.maps")),
        Err(GateError::Denied { category: Category::LocationGps })
    );
}

#[test]
fn test_disabled_subsystem_bypasses_gate() {
    let (store, _dir) = test_store();
    let record = SettingRecord::new("com.example.maps").with(Category::LocationGps, PolicyValue::Error);
    store.save_settings(&record).unwrap();
    assert!(store.set_value("enabled", "0").unwrap());

    let gate = location_gate(Arc::clone(&store));
    assert!(gate.get(Some("com.example.maps")).is_ok());
}

#[test]
fn test_fail_safe_hands_out_empty_values() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::testing(dir.path());
    config.start_watchdog = false;
    let service = Arc::new(
        PrivacyService::start(config, Arc::new(StaticPackages::new(["a"])), Arc::new(LogNotifier)).unwrap(),
    );
    let gate = PolicyGatedAccessor::with_default_empty(
        Arc::clone(&service),
        GateConfig::new(Category::Contacts),
        || vec!["Ada Lovelace".to_string()],
    );
    assert_eq!(gate.get(Some("a")).unwrap().len(), 1);

    service.admin().set_fail_safe(true);
    assert!(gate.get(Some("a")).unwrap().is_empty());
    assert!(gate.get(None).unwrap().len() == 1, "unresolved caller follows the gate default");

    let strict = PolicyGatedAccessor::with_default_empty(
        Arc::clone(&service),
        GateConfig::new(Category::Contacts).deny_by_default(),
        || vec!["Ada Lovelace".to_string()],
    );
    assert!(strict.get(None).unwrap().is_empty());
}
