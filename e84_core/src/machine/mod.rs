//! E84 handshake state machine.
//!
//! - [`state`] - state and transfer-direction enums
//! - [`table`] - declarative transition table and guard predicates
//! - [`timer`] - TP timer service (min-heap, generation-counter cancel)
//! - [`engine`] - the interpreter executing the table

pub mod engine;
pub mod state;
pub mod table;
pub mod timer;

pub use engine::{E84Machine, MachineCtx};
pub use state::{E84State, TransferDirection};
pub use table::TransitionTable;

use e84_common::signal::SignalName;
use e84_common::timer::TimerId;
use thiserror::Error;

use crate::port::PortFault;

/// Handshake fault classification, carried by fault and diagnostic
/// events and latched on the machine while in an error state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaultKind {
    /// A protocol timer elapsed.
    #[error("{0} expired")]
    TimerExpired(TimerId),

    /// Carrier-stage select lines were invalid at VALID.
    #[error("invalid carrier stage select")]
    InvalidCarrierStage,

    /// More than one transition guard was satisfiable; table order won.
    #[error("ambiguous guards satisfied in {state}")]
    AmbiguousGuard { state: crate::machine::state::E84State },

    /// An AMHS input rose in a state with no transition consuming it.
    #[error("unexpected input {0}")]
    UnexpectedInput(SignalName),

    /// The physical load port faulted.
    #[error(transparent)]
    Port(#[from] PortFault),

    /// ES dropped; outputs were forced safe.
    #[error("emergency stop")]
    EmergencyStop,
}
