//! Event queue types and the observer stream.
//!
//! All controller state is mutated on one dispatch thread draining a
//! bounded multi-producer queue of [`Event`]s. Transport input threads,
//! the timer service and the operator surface are the producers.

use std::time::{Duration, SystemTime};

use crossbeam::channel::{bounded, Receiver, Sender};

use e84_common::config::ControllerMode;
use e84_common::signal::SignalName;
use e84_common::timer::TimerId;

use crate::machine::state::E84State;
use crate::machine::FaultKind;
use crate::port::PortEvent;
use crate::signal::SignalSnapshot;

/// Bound on the main event queue. Producers block briefly when the
/// dispatch thread falls behind rather than growing without limit.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Create the main event queue.
pub fn event_queue() -> (Sender<Event>, Receiver<Event>) {
    bounded(EVENT_QUEUE_DEPTH)
}

// ─── Event ──────────────────────────────────────────────────────────

/// One unit of work for the dispatch thread.
#[derive(Debug, Clone)]
pub enum Event {
    /// An AMHS input line changed at the transport boundary.
    SignalEdge {
        name: SignalName,
        level: bool,
        /// Source timestamp; preserves wall-clock order when dispatch lags.
        at: SystemTime,
    },
    /// A protocol timer elapsed. Stale generations are discarded.
    TimerFired { timer: TimerId, generation: u64 },
    /// Report from the load-port transport.
    Port(PortEvent),
    /// Operator surface command.
    Operator(OperatorCommand),
    /// Drain and exit.
    Shutdown,
}

/// Commands accepted from the operator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Clear a latched error state. Gated: rejected while AMHS inputs
    /// are active or the port is unclean.
    Reset,
    /// Change the controller mode.
    SetMode(ControllerMode),
    /// Drop ES and force outputs safe.
    RequestStop,
}

// ─── Observer stream ────────────────────────────────────────────────

/// Read-only event stream for the operator surface / GUI.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged {
        from: E84State,
        to: E84State,
        trigger: &'static str,
        at: SystemTime,
    },
    SignalChanged {
        name: SignalName,
        level: bool,
        at: SystemTime,
    },
    TimerArmed {
        timer: TimerId,
        duration: Duration,
    },
    TimerFired {
        timer: TimerId,
    },
    /// A fault that latched the machine in an error state.
    Fault(FaultKind),
    /// A diagnostic that did not change state (ambiguous guards,
    /// unexpected inputs).
    Diagnostic(FaultKind),
    ModeChanged(ControllerMode),
}

/// One completed transition with its evidence, kept in the facade
/// history ring for replay and audit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub at: SystemTime,
    pub from: E84State,
    pub to: E84State,
    pub trigger: &'static str,
    /// Registry snapshot taken right after the transition committed.
    pub snapshot: SignalSnapshot,
}
