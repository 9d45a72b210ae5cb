//! PrivStore Core: tamper-aware privacy settings store
//!
//! Persists per-application privacy policy records in a SQLite file and keeps
//! them trustworthy when the file is tampered with directly.
//!
//! # Architecture
//!
//! - **Store**: SQLite tables plus a plain-text mirror tree for two categories
//! - **Cache**: write-through, full population, doubles as the recovery source
//! - **Controller**: one reader/writer lock per store, access counting, and
//!   the authorized window that marks the store's own writes
//! - **Watchdog**: polling watcher that fingerprints the database file
//! - **Recovery**: on tamper, fail-safe mode plus a rebuild from the cache
//!
//! Each store carries its own `StoreContext`; there is no process-wide
//! state, so several stores can live side by side.

pub mod admin;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod external;
pub mod handle;
pub mod migration;
pub mod mirror;
pub mod platform_durability;
pub mod record;
pub mod recovery;
pub mod schema;
pub mod service;
pub mod store;
pub mod watchdog;

// Re-export key types for convenience
pub use admin::{Admin, DebugFlag};
pub use cache::{CacheStatus, SettingsCache};
pub use config::Config;
pub use controller::{ReadAccess, StoreContext, WatchdogState, WriteAccess};
pub use error::{StoreError, StoreResult};
pub use external::{LogNotifier, Notification, Notifier, PackageSource, StaticPackages};
pub use record::{Category, PolicyValue, SettingRecord};
pub use recovery::{RecoveryOrchestrator, RecoveryReport};
pub use service::PrivacyService;
pub use store::SettingsStore;
pub use watchdog::{FileEvent, WatchEvent, Watchdog, WatchdogStatus};
