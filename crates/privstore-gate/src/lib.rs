//! PrivStore gated accessors
//!
//! Consumers of protected data (telephony, location, accounts, ...) wrap
//! their accessors in a `PolicyGatedAccessor`. Each call looks up the
//! caller's settings through a `SettingsSource` and either delegates, hands
//! out an empty value, or fails, according to the tri-state value stored for
//! the accessor's category.
//!
//! Resolving which application is calling is the consumer's job; the gate
//! only receives the result, `None` when it could not be resolved.

pub mod gate;
pub mod source;

pub use gate::{Decision, GateConfig, GateError, PolicyGatedAccessor};
pub use source::SettingsSource;
