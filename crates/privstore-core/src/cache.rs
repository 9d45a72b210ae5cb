//! Settings cache
//!
//! In-memory map from application identifier to its last known record. Every
//! successful save writes through to the cache, so after the first load the
//! cache is authoritative for reads. It doubles as the recovery source: if
//! the backing file is tampered with, the cached records are replayed into a
//! fresh database.
//!
//! Entries carry a status flag:
//! - `Clean`: matches the backing file
//! - `Dirty`: saved since it was loaded
//! - `New`: must be re-inserted (set on every entry during recovery)

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::record::SettingRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Clean,
    Dirty,
    New,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: SettingRecord,
    pub status: CacheStatus,
}

/// Application id -> record map, shared by all store operations.
pub struct SettingsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Copy of the cached record.
    pub fn get(&self, app_id: &str) -> Option<SettingRecord> {
        self.entries.read().get(app_id).map(|e| e.record.clone())
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.entries.read().contains_key(app_id)
    }

    pub fn status(&self, app_id: &str) -> Option<CacheStatus> {
        self.entries.read().get(app_id).map(|e| e.status)
    }

    /// Record as loaded from the backing file.
    pub fn insert_clean(&self, record: SettingRecord) {
        let key = record.app_id.clone();
        self.entries.write().insert(key, CacheEntry { record, status: CacheStatus::Clean });
    }

    /// Record as just saved.
    pub fn update(&self, record: SettingRecord) {
        let key = record.app_id.clone();
        self.entries.write().insert(key, CacheEntry { record, status: CacheStatus::Dirty });
    }

    pub fn remove(&self, app_id: &str) -> Option<SettingRecord> {
        self.entries.write().remove(app_id).map(|e| e.record)
    }

    /// Flag every entry for re-insertion. Row ids are dropped because the
    /// database they referred to is gone.
    pub fn mark_all_new(&self) {
        for entry in self.entries.write().values_mut() {
            entry.record.id = None;
            entry.status = CacheStatus::New;
        }
    }

    /// Records waiting for re-insertion, in application id order.
    pub fn pending(&self) -> Vec<SettingRecord> {
        let mut pending: Vec<SettingRecord> = self
            .entries
            .read()
            .values()
            .filter(|e| e.status == CacheStatus::New)
            .map(|e| e.record.clone())
            .collect();
        pending.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        pending
    }

    /// All cached records, in application id order.
    pub fn snapshot(&self) -> Vec<SettingRecord> {
        let mut records: Vec<SettingRecord> =
            self.entries.read().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        records
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for SettingsCache {
    fn default() -> Self {
        Self::new()
    }
}
