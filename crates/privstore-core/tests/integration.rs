//! Integration tests: the assembled store, watcher and recovery path.
//!
//! Each test runs against its own on-disk store in a temporary directory.

use std::collections::HashSet;
use std::fs;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::Connection;
use tempfile::TempDir;

use privstore_core::{
    Category, Config, FileEvent, Notification, Notifier, PolicyValue, PrivacyService, SettingRecord,
    SettingsStore, StaticPackages, WatchEvent,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CollectingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    fn snapshot(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

fn test_store(installed: &[&str]) -> (SettingsStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let packages = Arc::new(StaticPackages::new(installed.iter().copied()));
    let store = SettingsStore::open(Config::testing(dir.path()), packages).unwrap();
    (store, dir)
}

fn test_service(installed: &[&str], watch: bool) -> (PrivacyService, Arc<CollectingNotifier>, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::testing(dir.path());
    config.start_watchdog = watch;
    let packages = Arc::new(StaticPackages::new(installed.iter().copied()));
    let notifier = Arc::new(CollectingNotifier::default());
    let service = PrivacyService::start(config, packages, notifier.clone()).unwrap();
    (service, notifier, dir)
}

/// Service whose watcher never gets to poll during a test, so anything it
/// reacts to was reported by the store itself.
fn quiet_watch_service(installed: &[&str]) -> (PrivacyService, Arc<CollectingNotifier>, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::testing(dir.path());
    config.watchdog_poll_interval = Duration::from_secs(60);
    let packages = Arc::new(StaticPackages::new(installed.iter().copied()));
    let notifier = Arc::new(CollectingNotifier::default());
    let service = PrivacyService::start(config, packages, notifier.clone()).unwrap();
    (service, notifier, dir)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn names(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

#[test]
fn test_round_trip_every_category() {
    let (store, _dir) = test_store(&[]);
    let cycle = [PolicyValue::Real, PolicyValue::Empty, PolicyValue::Error];
    let mut record = SettingRecord::new("com.example.maps");
    for (i, category) in Category::ALL.iter().enumerate() {
        record.set(*category, cycle[i % 3]);
    }
    record.allowed_contacts = [17, 3, 42].into_iter().collect();
    record.default_deny = true;

    assert!(store.save_settings(&record).unwrap());
    let cached = store.get_settings("com.example.maps").unwrap().unwrap();
    assert!(cached.same_settings(&record));

    store.cache().clear();
    let stored = store.get_settings("com.example.maps").unwrap().unwrap();
    assert!(stored.same_settings(&record));
    assert!(stored.id.is_some());
}

#[test]
fn test_global_value_last_write_wins() {
    let (store, _dir) = test_store(&[]);
    assert!(store.set_value("enabled", "1").unwrap());
    assert_eq!(store.get_value("enabled").unwrap().as_deref(), Some("1"));
    assert!(store.set_value("enabled", "0").unwrap());
    assert_eq!(store.get_value("enabled").unwrap().as_deref(), Some("0"));
}

#[test]
fn test_purge_keeps_installed() {
    let (store, dir) = test_store(&[]);
    for app in ["A", "B", "C"] {
        assert!(store.save_settings(&SettingRecord::new(app)).unwrap());
    }
    assert!(dir.path().join("privacy").join("C").is_dir());

    assert!(store.purge_settings(&names(&["A", "B"])).unwrap());
    store.cache().clear();
    assert!(store.get_settings("A").unwrap().is_some());
    assert!(store.get_settings("B").unwrap().is_some());
    assert!(store.get_settings("C").unwrap().is_none());
    assert!(!dir.path().join("privacy").join("C").exists());
}

#[test]
fn test_delete_missing_leaves_others() {
    let (store, _dir) = test_store(&[]);
    let kept = SettingRecord::new("kept").with(Category::Sms, PolicyValue::Error);
    store.save_settings(&kept).unwrap();

    assert!(!store.delete_settings("never-saved").unwrap());
    store.cache().clear();
    assert!(store.get_settings("kept").unwrap().unwrap().same_settings(&kept));
}

#[test]
fn test_readers_run_while_writer_waits() {
    let (store, _dir) = test_store(&[]);
    store.save_settings(&SettingRecord::new("shared")).unwrap();
    store.set_use_cache(false);
    let store = Arc::new(store);

    let readers = 4;
    let barrier = Arc::new(Barrier::new(readers));
    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                for _ in 0..20 {
                    barrier.wait();
                    assert!(store.get_settings("shared").unwrap().is_some());
                }
            })
        })
        .collect();

    for i in 0..20 {
        let value = if i % 2 == 0 { PolicyValue::Error } else { PolicyValue::Real };
        assert!(store.save_settings(&SettingRecord::new("shared").with(Category::Camera, value)).unwrap());
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(store.context().access_count(), 0);
}

#[test]
fn test_cache_miss_reads_overlap() {
    let (store, _dir) = test_store(&[]);
    store.save_settings(&SettingRecord::new("shared")).unwrap();
    store.set_use_cache(false);
    let store = Arc::new(store);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let slow_reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let _access = store.context().read().unwrap();
            store
                .context()
                .handle()
                .with_read_conn(|_| {
                    entered_tx.send(()).unwrap();
                    Ok(release_rx.recv_timeout(Duration::from_secs(5)).is_ok())
                })
                .unwrap()
        })
    };

    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(store.get_settings("shared").unwrap().is_some());
    release_tx.send(()).unwrap();
    assert!(slow_reader.join().unwrap(), "cache-miss read queued behind another reader");
}

#[test]
fn test_stale_handle_reopened_after_file_swap() {
    let (store, dir) = test_store(&[]);
    store.save_settings(&SettingRecord::new("a")).unwrap();
    store.set_use_cache(false);

    // Swap an identical copy in under the open handle
    let db = dir.path().join("privacy.db");
    let copy = dir.path().join("copy.db");
    fs::copy(&db, &copy).unwrap();
    fs::rename(&copy, &db).unwrap();

    assert!(store.get_settings("a").unwrap().is_some());
    assert!(store.save_settings(&SettingRecord::new("b")).unwrap());
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[test]
fn test_migrates_version_one_store() {
    let dir = TempDir::new().unwrap();
    let config = Config::testing(dir.path());
    {
        let conn = Connection::open(&config.db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE version (version TEXT);
             CREATE TABLE settings (
                _id INTEGER PRIMARY KEY AUTOINCREMENT,
                packageName TEXT,
                uid INTEGER,
                cameraSetting INTEGER,
                systemLogsSetting INTEGER
             );
             INSERT INTO settings (packageName, uid, cameraSetting, systemLogsSetting)
                VALUES ('com.legacy', 10001, 2, 1);
             INSERT INTO settings (packageName, uid, cameraSetting, systemLogsSetting)
                VALUES ('com.removed', 10002, 0, 0);",
        )
        .unwrap();
    }
    let legacy_dir = config.settings_dir.join("com.legacy").join("10001");
    fs::create_dir_all(&legacy_dir).unwrap();
    fs::write(legacy_dir.join("systemLogsSetting"), b"1").unwrap();
    let removed_dir = config.settings_dir.join("com.removed").join("10002");
    fs::create_dir_all(&removed_dir).unwrap();
    fs::write(removed_dir.join("systemLogsSetting"), b"0").unwrap();

    let packages = Arc::new(StaticPackages::new(["com.legacy"]));
    let store = SettingsStore::open(config.clone(), packages).unwrap();

    assert_eq!(store.get_value("db_version").unwrap().as_deref(), Some("4"));
    let flattened = config.settings_dir.join("com.legacy");
    assert_eq!(fs::read_to_string(flattened.join("systemLogsSetting")).unwrap(), "1");
    assert!(!legacy_dir.exists());
    // Purge after migration drops what is no longer installed
    assert!(!config.settings_dir.join("com.removed").exists());
    assert!(store.get_settings("com.removed").unwrap().is_none());

    let record = store.get_settings("com.legacy").unwrap().unwrap();
    assert_eq!(record.get(Category::Camera), PolicyValue::Error);
    assert_eq!(record.get(Category::SystemLogs), PolicyValue::Empty);
}

// ---------------------------------------------------------------------------
// Tamper detection and recovery
// ---------------------------------------------------------------------------

#[test]
fn test_simulated_modification_enters_fail_safe() {
    let (service, notifier, _dir) = test_service(&[], false);
    let store = service.store();
    store.save_settings(&SettingRecord::new("A")).unwrap();

    let sender = service.watchdog().sender();
    sender.send(WatchEvent::Observed { kind: FileEvent::Modified, authorized_window: false }).unwrap();
    assert!(wait_until(Duration::from_secs(5), || service.orchestrator().recoveries() == 1));

    for app in ["A", "never-saved"] {
        let record = store.get_settings(app).unwrap().unwrap();
        assert!(record.values().all(|(_, v)| v == PolicyValue::Empty), "{app} not locked down");
        assert!(record.default_deny);
    }
    assert_eq!(
        notifier.snapshot().first(),
        Some(&Notification::FailSafeTriggered { reason: "database modified".into() })
    );

    service.admin().set_fail_safe(false);
    assert!(store.get_settings("never-saved").unwrap().is_none());
}

#[test]
fn test_recovery_replays_cached_records() {
    let (service, notifier, _dir) = test_service(&[], false);
    let store = service.store();
    let a = SettingRecord::new("A").with(Category::Camera, PolicyValue::Error);
    let b = SettingRecord::new("B").with(Category::NetworkInfo, PolicyValue::Real);
    assert!(store.save_settings(&a).unwrap());
    assert!(store.save_settings(&b).unwrap());

    let report = service.orchestrator().recover(FileEvent::Deleted).unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(report.restored, 2);
    assert_eq!(notifier.snapshot().last(), Some(&Notification::RecoveryComplete));

    // Fail-safe survives recovery until cleared
    assert!(service.admin().is_fail_safe_active());
    service.admin().set_fail_safe(false);
    assert!(store.get_settings("A").unwrap().unwrap().same_settings(&a));
    assert!(store.get_settings("B").unwrap().unwrap().same_settings(&b));
    assert_eq!(
        store.mirror().read("A", Category::SystemLogs).unwrap(),
        Some(PolicyValue::Real)
    );
}

#[test]
fn test_external_write_detected() {
    let (service, notifier, dir) = test_service(&["A"], true);
    let store = service.store();
    store.save_settings(&SettingRecord::new("A").with(Category::Contacts, PolicyValue::Error)).unwrap();

    // Our own writes never trip the watcher
    thread::sleep(Duration::from_millis(100));
    assert!(!service.admin().is_fail_safe_active());

    let conn = Connection::open(dir.path().join("privacy.db")).unwrap();
    conn.execute("UPDATE settings SET contactsSetting = 0", []).unwrap();
    drop(conn);

    assert!(wait_until(Duration::from_secs(10), || {
        notifier.snapshot().contains(&Notification::RecoveryComplete)
    }));
    assert!(service.admin().is_fail_safe_active());

    // The rebuilt store holds the cached value, not the tampered one
    service.admin().set_fail_safe(false);
    let record = store.get_settings("A").unwrap().unwrap();
    assert_eq!(record.get(Category::Contacts), PolicyValue::Error);
}

#[test]
fn test_tamper_followed_by_write_recovers() {
    let (service, notifier, dir) = quiet_watch_service(&["A", "B"]);
    let store = service.store();
    let a = SettingRecord::new("A").with(Category::Camera, PolicyValue::Error);
    assert!(store.save_settings(&a).unwrap());

    let conn = Connection::open(dir.path().join("privacy.db")).unwrap();
    conn.execute("UPDATE settings SET cameraSetting = 0", []).unwrap();
    drop(conn);

    // A legitimate write before the next poll must not hide the change
    let b = SettingRecord::new("B").with(Category::Sms, PolicyValue::Empty);
    assert!(store.save_settings(&b).unwrap());

    assert!(wait_until(Duration::from_secs(10), || {
        notifier.snapshot().contains(&Notification::RecoveryComplete)
    }));
    assert_eq!(
        notifier.snapshot()[0],
        Notification::FailSafeTriggered { reason: "database modified".into() }
    );

    service.admin().set_fail_safe(false);
    assert!(store.get_settings("A").unwrap().unwrap().same_settings(&a));
    assert!(store.get_settings("B").unwrap().unwrap().same_settings(&b));
    assert_eq!(service.orchestrator().recoveries(), 1);
}

#[test]
fn test_delete_followed_by_write_recovers() {
    let (service, notifier, dir) = quiet_watch_service(&["A"]);
    let store = service.store();
    let a = SettingRecord::new("A").with(Category::LocationGps, PolicyValue::Error);
    assert!(store.save_settings(&a).unwrap());

    let db = dir.path().join("privacy.db");
    fs::remove_file(&db).unwrap();
    // Cannot reach the database; the outcome only matters to the caller
    let _ = store.save_settings(&SettingRecord::new("B"));

    assert!(wait_until(Duration::from_secs(10), || {
        notifier.snapshot().contains(&Notification::RecoveryComplete)
    }));
    assert_eq!(
        notifier.snapshot()[0],
        Notification::FailSafeTriggered { reason: "database deleted".into() }
    );
    assert!(db.exists());

    // The rebuilt store is writable again and holds the cached values
    service.admin().set_fail_safe(false);
    assert!(store.get_settings("A").unwrap().unwrap().same_settings(&a));
    assert!(store.save_settings(&SettingRecord::new("C")).unwrap());
}

#[test]
fn test_deleted_database_rebuilt() {
    let (service, notifier, dir) = test_service(&[], true);
    service.store().save_settings(&SettingRecord::new("A")).unwrap();

    fs::remove_file(dir.path().join("privacy.db")).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        notifier.snapshot().contains(&Notification::RecoveryComplete)
    }));
    assert_eq!(
        notifier.snapshot()[0],
        Notification::FailSafeTriggered { reason: "database deleted".into() }
    );
    assert!(dir.path().join("privacy.db").exists());

    // Only one recovery for one incident
    thread::sleep(Duration::from_millis(200));
    assert_eq!(service.orchestrator().recoveries(), 1);
    service.shutdown();
}
