//! E84 Core
//!
//! Equipment-side implementation of the SEMI E84 parallel-I/O handshake
//! used to coordinate AMHS transports with equipment load ports during
//! carrier load and unload.
//!
//! # Module Structure
//!
//! - [`signal`] - named boolean signals with edge-triggered observers
//! - [`machine`] - the handshake state machine, transition table and
//!   TP timer service
//! - [`port`] - load-port contract, digital and ASCII variants, and the
//!   coordinator reconciling handshake phase with physical port state
//! - [`event`] - the bounded event queue and observer stream types
//! - [`controller`] - the facade owning lifecycle, mode and dispatch
//!
//! # Architecture
//!
//! All protocol state lives on one dispatch thread draining a bounded
//! queue. Transport input threads, the timer service and the operator
//! surface are producers; external consumers read snapshots and the
//! observer event stream, never live state.

pub mod controller;
pub mod event;
pub mod machine;
pub mod port;
pub mod signal;

pub use controller::{Controller, ControllerError, Flow};
pub use event::{Event, OperatorCommand};
pub use machine::{E84Machine, E84State, FaultKind, TransferDirection};
pub use port::{LoadPort, LoadPortState, PortFault, PortSensors};
pub use signal::{SignalError, SignalRegistry};
