//! Collaborators supplied by the host
//!
//! The store needs to know which applications are installed (for the startup
//! cache fill and for purging) and somewhere to send fail-safe notifications.
//! Both are traits so the host platform and tests can plug in their own.

use std::collections::HashSet;
use std::fmt;

use parking_lot::RwLock;
use tracing::{error, info, warn};

/// Source of the currently installed application identifiers.
pub trait PackageSource: Send + Sync {
    fn installed_packages(&self) -> HashSet<String>;
}

/// A fixed set of installed applications, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticPackages {
    packages: RwLock<HashSet<String>>,
}

impl StaticPackages {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { packages: RwLock::new(packages.into_iter().map(Into::into).collect()) }
    }

    pub fn insert(&self, app_id: impl Into<String>) {
        self.packages.write().insert(app_id.into());
    }

    pub fn remove(&self, app_id: &str) -> bool {
        self.packages.write().remove(app_id)
    }
}

impl PackageSource for StaticPackages {
    fn installed_packages(&self) -> HashSet<String> {
        self.packages.read().clone()
    }
}

/// Events reported to the host about tamper handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Fail-safe mode was entered
    FailSafeTriggered { reason: String },
    /// Every cached record was restored
    RecoveryComplete,
    /// These applications could not be restored
    RecoveryIncomplete { failed: Vec<String> },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::FailSafeTriggered { reason } => write!(f, "fail-safe triggered: {reason}"),
            Notification::RecoveryComplete => f.write_str("recovery complete"),
            Notification::RecoveryIncomplete { failed } => {
                write!(f, "recovery incomplete for {}", failed.join(", "))
            }
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::FailSafeTriggered { reason } => error!(reason = %reason, "fail-safe triggered"),
            Notification::RecoveryComplete => info!("recovery complete"),
            Notification::RecoveryIncomplete { failed } => {
                warn!(failed = ?failed, "recovery incomplete")
            }
        }
    }
}
