//! Signal abstraction layer.
//!
//! - [`store`] - signal records and diagnostic snapshots
//! - [`dispatch`] - subscriber bookkeeping and deferred writes
//! - [`registry`] - registration, token-checked writes, edge-triggered
//!   notification

pub mod dispatch;
pub mod registry;
pub mod store;

pub use dispatch::{SubscriptionId, WriteQueue};
pub use registry::{SignalHandle, SignalRegistry};
pub use store::{SignalChange, SignalSnapshot, SignalStore};

use e84_common::signal::SignalName;
use thiserror::Error;

/// Signal registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    /// Signal already registered.
    #[error("signal '{0}' already registered")]
    DuplicateSignal(SignalName),

    /// Signal not registered.
    #[error("signal '{0}' not registered")]
    UnknownSignal(SignalName),

    /// Write attempted by a caller that does not own the signal.
    #[error("caller is not the authorized writer for '{0}'")]
    WrongDirection(SignalName),

    /// A dispatch cascade failed to quiesce, or the registry was entered
    /// re-entrantly from inside a callback.
    #[error("re-entrant signal dispatch on '{0}'")]
    ReentrantDispatch(SignalName),
}
