//! Policy-gated accessor
//!
//! Wraps a data accessor and consults the settings store before delegating.
//! The data category and the default for unknown callers are configuration,
//! so one type covers every protected accessor.

use std::fmt;

use privstore_core::{Category, PolicyValue};
use tracing::{debug, trace};

use crate::source::SettingsSource;

/// Per-accessor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Category the wrapped accessor exposes
    pub category: Category,
    /// Deny callers that cannot be resolved or have no stored settings
    pub default_deny: bool,
}

impl GateConfig {
    pub fn new(category: Category) -> Self {
        Self { category, default_deny: false }
    }

    pub fn deny_by_default(mut self) -> Self {
        self.default_deny = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("access to {category:?} denied by privacy settings")]
    Denied { category: Category },
}

/// What a gate does for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Call the wrapped accessor
    Delegate,
    /// Return the empty value
    Empty,
    /// Fail the access
    Deny,
}

impl From<PolicyValue> for Decision {
    fn from(value: PolicyValue) -> Self {
        match value {
            PolicyValue::Real => Decision::Delegate,
            PolicyValue::Empty => Decision::Empty,
            PolicyValue::Error => Decision::Deny,
        }
    }
}

/// An accessor returning `T`, gated on the caller's settings.
pub struct PolicyGatedAccessor<S, F, T> {
    source: S,
    config: GateConfig,
    accessor: F,
    empty: Box<dyn Fn() -> T + Send + Sync>,
}

impl<S, F, T> PolicyGatedAccessor<S, F, T>
where
    S: SettingsSource,
    F: Fn() -> T,
{
    /// `empty` produces the value handed out instead of real data.
    pub fn new<E>(source: S, config: GateConfig, accessor: F, empty: E) -> Self
    where
        E: Fn() -> T + Send + Sync + 'static,
    {
        Self { source, config, accessor, empty: Box::new(empty) }
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Decide without calling anything.
    pub fn decide(&self, caller: Option<&str>) -> Decision {
        if !self.source.is_enabled() {
            trace!(category = ?self.config.category, "enforcement disabled");
            return Decision::Delegate;
        }
        let fallback = if self.config.default_deny { Decision::Empty } else { Decision::Delegate };
        let Some(app_id) = caller else {
            debug!(category = ?self.config.category, "caller unresolved");
            return fallback;
        };
        match self.source.settings_for(app_id) {
            Some(record) => Decision::from(record.get(self.config.category)),
            None => fallback,
        }
    }

    /// Run the gated access for `caller`.
    pub fn get(&self, caller: Option<&str>) -> Result<T, GateError> {
        match self.decide(caller) {
            Decision::Delegate => Ok((self.accessor)()),
            Decision::Empty => Ok((self.empty)()),
            Decision::Deny => {
                debug!(app_id = ?caller, category = ?self.config.category, "access denied");
                Err(GateError::Denied { category: self.config.category })
            }
        }
    }
}

impl<S, F, T> PolicyGatedAccessor<S, F, T>
where
    S: SettingsSource,
    F: Fn() -> T,
    T: Default + 'static,
{
    /// Gate with `T::default()` as the empty value.
    pub fn with_default_empty(source: S, config: GateConfig, accessor: F) -> Self {
        Self::new(source, config, accessor, T::default)
    }
}

impl<S, F, T> fmt::Debug for PolicyGatedAccessor<S, F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyGatedAccessor").field("config", &self.config).finish_non_exhaustive()
    }
}
