//! Load-port abstraction.
//!
//! The state machine is written against two narrow contracts:
//! [`LoadPort`], implemented by the digital-line and ASCII-serial
//! transport variants, and [`PortControl`], implemented by the
//! [`coordinator::LoadPortCoordinator`] that reconciles handshake phase
//! with physical port state. Swapping transport variants is a startup
//! decision.

pub mod ascii;
pub mod coordinator;
pub mod digital;
pub mod sim;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use e84_common::signal::SignalName;

use crate::event::Event;
use crate::machine::state::TransferDirection;

// ─── Errors ─────────────────────────────────────────────────────────

/// Transport-layer failures, below the port abstraction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response within the per-command deadline.
    #[error("serial response timed out")]
    SerialTimeout,

    /// Response line did not match the protocol grammar.
    #[error("malformed serial frame: {0}")]
    SerialFraming(String),

    /// Digital I/O card not reachable.
    #[error("digital I/O unavailable: {0}")]
    DigitalIoUnavailable(String),

    /// Transport worker is no longer running.
    #[error("transport worker unavailable")]
    Unavailable,
}

/// Physical load-port failures surfaced to the handshake machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortFault {
    /// Actuator did not reach its commanded position in time.
    #[error("actuator did not complete in time")]
    ActuatorTimeout,

    /// Sensor levels form an impossible combination.
    #[error("inconsistent sensors: {0}")]
    SensorInconsistent(String),

    /// Carrier placement or port motion failed.
    #[error("placement failure: {0}")]
    PlacementFailure(String),

    /// Underlying transport failed after retry.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ─── Sensors ────────────────────────────────────────────────────────

/// One physical port sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortSensor {
    CarrierPresent,
    Clamped,
    Docked,
    PlacementOk,
}

impl PortSensor {
    pub const ALL: [PortSensor; 4] = [
        Self::CarrierPresent,
        Self::Clamped,
        Self::Docked,
        Self::PlacementOk,
    ];

    /// The internal registry signal mirroring this sensor.
    pub const fn signal(self) -> SignalName {
        match self {
            Self::CarrierPresent => SignalName::CarrierPresent,
            Self::Clamped => SignalName::Clamped,
            Self::Docked => SignalName::Docked,
            Self::PlacementOk => SignalName::PlacementOk,
        }
    }

    /// Inverse of [`PortSensor::signal`].
    pub const fn from_signal(name: SignalName) -> Option<Self> {
        match name {
            SignalName::CarrierPresent => Some(Self::CarrierPresent),
            SignalName::Clamped => Some(Self::Clamped),
            SignalName::Docked => Some(Self::Docked),
            SignalName::PlacementOk => Some(Self::PlacementOk),
            _ => None,
        }
    }
}

/// Current sensor levels of the load port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSensors {
    pub carrier_present: bool,
    pub clamped: bool,
    pub docked: bool,
    pub placement_ok: bool,
}

impl PortSensors {
    #[inline]
    pub fn get(&self, sensor: PortSensor) -> bool {
        match sensor {
            PortSensor::CarrierPresent => self.carrier_present,
            PortSensor::Clamped => self.clamped,
            PortSensor::Docked => self.docked,
            PortSensor::PlacementOk => self.placement_ok,
        }
    }

    #[inline]
    pub fn set(&mut self, sensor: PortSensor, level: bool) {
        match sensor {
            PortSensor::CarrierPresent => self.carrier_present = level,
            PortSensor::Clamped => self.clamped = level,
            PortSensor::Docked => self.docked = level,
            PortSensor::PlacementOk => self.placement_ok = level,
        }
    }

    /// Port can accept a carrier: docked, empty, clamp released.
    pub fn ready_for_load(&self) -> bool {
        self.docked && !self.carrier_present && !self.clamped
    }

    /// Port can give up its carrier: docked, loaded, clamp released.
    pub fn ready_for_unload(&self) -> bool {
        self.docked && self.carrier_present && !self.clamped
    }

    /// First impossible sensor combination, if any.
    pub fn inconsistency(&self) -> Option<&'static str> {
        if self.clamped && !self.carrier_present {
            return Some("clamped without carrier");
        }
        if self.placement_ok && !self.carrier_present {
            return Some("placement confirmed without carrier");
        }
        None
    }
}

// ─── Port state model ───────────────────────────────────────────────

/// Derived physical state of the load port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadPortState {
    Idle,
    Docking,
    DockedEmpty,
    DockedLoaded,
    Undocking,
    Fault,
}

impl core::fmt::Display for LoadPortState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Docking => "DOCKING",
            Self::DockedEmpty => "DOCKED_EMPTY",
            Self::DockedLoaded => "DOCKED_LOADED",
            Self::Undocking => "UNDOCKING",
            Self::Fault => "FAULT",
        };
        f.write_str(s)
    }
}

// ─── Events and notices ─────────────────────────────────────────────

/// Asynchronous reports from a [`LoadPort`] implementation, delivered
/// through the main event queue.
#[derive(Debug, Clone)]
pub enum PortEvent {
    /// One sensor changed level.
    SensorChanged {
        sensor: PortSensor,
        level: bool,
        at: SystemTime,
    },
    /// A prepare command finished.
    PrepareComplete { result: Result<(), PortFault> },
    /// Spontaneous port fault (alarm, transport breakdown).
    Fault { fault: PortFault },
}

/// Coordinator-level summary handed to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortNotice {
    /// The port finished preparing for the pending transfer.
    Prepared,
    /// Prepare failed; the handshake must not advance.
    PrepareFailed(PortFault),
    /// The port faulted outside of a prepare.
    Faulted(PortFault),
}

// ─── Contracts ──────────────────────────────────────────────────────

/// Transport-variant contract: what a physical load port can do.
///
/// Completions of `prepare_for_*` are asynchronous and arrive as
/// [`PortEvent::PrepareComplete`] on the event queue registered via
/// `connect`.
pub trait LoadPort: Send {
    /// Register the event sink and start transport I/O.
    fn connect(&mut self, events: crossbeam::channel::Sender<Event>) -> Result<(), PortFault>;

    /// Begin preparing the port to receive a carrier.
    fn prepare_for_load(&mut self) -> Result<(), PortFault>;

    /// Begin preparing the port to give up its carrier.
    fn prepare_for_unload(&mut self) -> Result<(), PortFault>;

    /// Current sensor levels.
    fn report(&self) -> PortSensors;

    /// Drive the port to the safest reachable state. Synchronous and
    /// re-entrant.
    fn emergency_safe(&mut self);

    /// Clear latched port faults and re-home.
    fn reset(&mut self) -> Result<(), PortFault>;

    /// Stop worker threads. Called once at controller shutdown.
    fn shutdown(&mut self);
}

/// Machine-facing face of the load-port coordinator.
pub trait PortControl {
    /// Command preparation for a transfer. Idempotent while a prepare
    /// for the same direction is pending or complete; a failed prepare
    /// stays failed until [`PortControl::release`] or a reset.
    fn prepare(&mut self, direction: TransferDirection) -> Result<(), PortFault>;

    /// True once the pending prepare has completed successfully.
    fn is_prepared(&self) -> bool;

    /// Port is docked, fault-free and not in motion.
    fn handoff_ready(&self) -> bool;

    /// Drive the port safe. Synchronous and re-entrant.
    fn emergency_safe(&mut self);

    /// The handshake completed; release the prepare latch.
    fn handoff_complete(&mut self, direction: TransferDirection);

    /// The machine returned to idle; clear any prepare progress.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_predicates() {
        let empty = PortSensors {
            docked: true,
            ..Default::default()
        };
        assert!(empty.ready_for_load());
        assert!(!empty.ready_for_unload());

        let loaded = PortSensors {
            docked: true,
            carrier_present: true,
            ..Default::default()
        };
        assert!(!loaded.ready_for_load());
        assert!(loaded.ready_for_unload());

        let clamped = PortSensors {
            docked: true,
            carrier_present: true,
            clamped: true,
            ..Default::default()
        };
        assert!(!clamped.ready_for_unload());

        let undocked = PortSensors::default();
        assert!(!undocked.ready_for_load());
    }

    #[test]
    fn sensor_signal_mapping() {
        assert_eq!(
            PortSensor::CarrierPresent.signal(),
            SignalName::CarrierPresent
        );
        assert_eq!(PortSensor::PlacementOk.signal(), SignalName::PlacementOk);
    }

    #[test]
    fn inconsistency_detection() {
        let ok = PortSensors {
            docked: true,
            carrier_present: true,
            clamped: true,
            placement_ok: true,
        };
        assert_eq!(ok.inconsistency(), None);

        let phantom_clamp = PortSensors {
            docked: true,
            clamped: true,
            ..Default::default()
        };
        assert!(phantom_clamp.inconsistency().is_some());

        let phantom_placement = PortSensors {
            docked: true,
            placement_ok: true,
            ..Default::default()
        };
        assert!(phantom_placement.inconsistency().is_some());
    }

    #[test]
    fn get_set_roundtrip() {
        let mut sensors = PortSensors::default();
        for sensor in PortSensor::ALL {
            assert!(!sensors.get(sensor));
            sensors.set(sensor, true);
            assert!(sensors.get(sensor));
        }
    }
}
