//! Load-port coordinator.
//!
//! Sits between the handshake machine and the transport variant:
//! machine commands become port operations, port events become
//! internal-signal writes plus [`PortNotice`]s for the machine. The
//! coordinator also derives the physical [`LoadPortState`] from the
//! sensor levels and flags impossible combinations.

use tracing::{debug, info, warn};

use crate::event::Event;
use crate::machine::state::TransferDirection;
use crate::signal::{SignalError, SignalHandle, SignalRegistry};

use super::{
    LoadPort, LoadPortState, PortControl, PortEvent, PortFault, PortNotice, PortSensor,
    PortSensors,
};

// ─── Prepare tracking ───────────────────────────────────────────────

/// Progress of the pending prepare command. A failure latches until
/// the machine releases the selection or the port is reset.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PrepareProgress {
    Idle,
    InFlight(TransferDirection),
    Ready(TransferDirection),
    Failed(PortFault),
}

/// Writer handles for the four internal sensor signals.
#[derive(Debug, Clone)]
pub struct SensorHandles {
    pub carrier_present: SignalHandle,
    pub clamped: SignalHandle,
    pub docked: SignalHandle,
    pub placement_ok: SignalHandle,
}

impl SensorHandles {
    fn get(&self, sensor: PortSensor) -> &SignalHandle {
        match sensor {
            PortSensor::CarrierPresent => &self.carrier_present,
            PortSensor::Clamped => &self.clamped,
            PortSensor::Docked => &self.docked,
            PortSensor::PlacementOk => &self.placement_ok,
        }
    }
}

// ─── LoadPortCoordinator ────────────────────────────────────────────

/// Reconciles the handshake phase with the physical port.
pub struct LoadPortCoordinator {
    port: Box<dyn LoadPort>,
    sensors: PortSensors,
    state: LoadPortState,
    prepare: PrepareProgress,
    handles: SensorHandles,
    fault: Option<PortFault>,
}

impl std::fmt::Debug for LoadPortCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadPortCoordinator")
            .field("sensors", &self.sensors)
            .field("state", &self.state)
            .field("prepare", &self.prepare)
            .field("fault", &self.fault)
            .finish()
    }
}

impl LoadPortCoordinator {
    pub fn new(port: Box<dyn LoadPort>, handles: SensorHandles) -> Self {
        let sensors = port.report();
        let mut coordinator = Self {
            port,
            sensors,
            state: LoadPortState::Idle,
            prepare: PrepareProgress::Idle,
            handles,
            fault: None,
        };
        coordinator.derive_state();
        coordinator
    }

    /// Start transport I/O and mirror the initial sensor levels into the
    /// registry.
    pub fn connect(
        &mut self,
        events: crossbeam::channel::Sender<Event>,
        registry: &mut SignalRegistry,
    ) -> Result<(), PortFault> {
        self.port.connect(events)?;
        self.sensors = self.port.report();
        self.mirror_all(registry)
            .map_err(|e| PortFault::PlacementFailure(e.to_string()))?;
        self.derive_state();
        info!(state = %self.state, "load port connected");
        Ok(())
    }

    /// Derived physical port state.
    #[inline]
    pub fn state(&self) -> LoadPortState {
        self.state
    }

    /// Cached sensor levels.
    #[inline]
    pub fn sensors(&self) -> PortSensors {
        self.sensors
    }

    /// Latched port fault, if any.
    #[inline]
    pub fn fault(&self) -> Option<&PortFault> {
        self.fault.as_ref()
    }

    /// Reset gating: no latched fault, no motion in flight.
    pub fn clean_for_reset(&self) -> bool {
        self.fault.is_none() && !matches!(self.prepare, PrepareProgress::InFlight(_))
    }

    /// Process one transport report. Returns the notice for the
    /// handshake machine, if the report warrants one.
    pub fn handle_event(
        &mut self,
        event: PortEvent,
        registry: &mut SignalRegistry,
    ) -> Result<Option<PortNotice>, SignalError> {
        match event {
            PortEvent::SensorChanged { sensor, level, .. } => {
                self.sensors.set(sensor, level);
                registry.write(self.handles.get(sensor), level)?;
                self.derive_state();
                debug!(sensor = ?sensor, level, state = %self.state, "port sensor changed");

                if self.fault.is_none() {
                    if let Some(reason) = self.sensors.inconsistency() {
                        let fault = PortFault::SensorInconsistent(reason.to_string());
                        self.fault = Some(fault.clone());
                        self.state = LoadPortState::Fault;
                        return Ok(Some(PortNotice::Faulted(fault)));
                    }
                }
                Ok(None)
            }
            PortEvent::PrepareComplete { result } => match result {
                Ok(()) => match self.prepare {
                    PrepareProgress::InFlight(direction) => {
                        self.prepare = PrepareProgress::Ready(direction);
                        self.derive_state();
                        Ok(Some(PortNotice::Prepared))
                    }
                    _ => {
                        debug!("prepare completion without a pending prepare");
                        Ok(None)
                    }
                },
                Err(fault) => {
                    self.prepare = PrepareProgress::Failed(fault.clone());
                    self.derive_state();
                    Ok(Some(PortNotice::PrepareFailed(fault)))
                }
            },
            PortEvent::Fault { fault } => {
                warn!(%fault, "load port fault");
                self.fault = Some(fault.clone());
                self.state = LoadPortState::Fault;
                Ok(Some(PortNotice::Faulted(fault)))
            }
        }
    }

    /// Clear latched faults and re-home the port.
    pub fn reset(&mut self, registry: &mut SignalRegistry) -> Result<(), PortFault> {
        self.port.reset()?;
        self.fault = None;
        self.prepare = PrepareProgress::Idle;
        self.sensors = self.port.report();
        self.mirror_all(registry)
            .map_err(|e| PortFault::PlacementFailure(e.to_string()))?;
        self.derive_state();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.port.shutdown();
    }

    fn mirror_all(&mut self, registry: &mut SignalRegistry) -> Result<(), SignalError> {
        for sensor in PortSensor::ALL {
            registry.write(self.handles.get(sensor), self.sensors.get(sensor))?;
        }
        Ok(())
    }

    fn derive_state(&mut self) {
        self.state = if self.fault.is_some() {
            LoadPortState::Fault
        } else {
            match self.prepare {
                PrepareProgress::InFlight(TransferDirection::Load) => LoadPortState::Docking,
                PrepareProgress::InFlight(TransferDirection::Unload) => LoadPortState::Undocking,
                _ => {
                    if self.sensors.docked && self.sensors.carrier_present {
                        LoadPortState::DockedLoaded
                    } else if self.sensors.docked {
                        LoadPortState::DockedEmpty
                    } else {
                        LoadPortState::Idle
                    }
                }
            }
        };
    }
}

impl PortControl for LoadPortCoordinator {
    fn prepare(&mut self, direction: TransferDirection) -> Result<(), PortFault> {
        // Idempotent while the same prepare is pending or done; a
        // latched failure stays failed for this selection.
        match &self.prepare {
            PrepareProgress::InFlight(d) | PrepareProgress::Ready(d) if *d == direction => {
                return Ok(())
            }
            PrepareProgress::Failed(fault) => return Err(fault.clone()),
            _ => {}
        }
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }

        let result = match direction {
            TransferDirection::Load => self.port.prepare_for_load(),
            TransferDirection::Unload => self.port.prepare_for_unload(),
        };
        match result {
            Ok(()) => {
                self.prepare = PrepareProgress::InFlight(direction);
                self.derive_state();
                Ok(())
            }
            Err(fault) => {
                self.prepare = PrepareProgress::Failed(fault.clone());
                Err(fault)
            }
        }
    }

    fn is_prepared(&self) -> bool {
        matches!(self.prepare, PrepareProgress::Ready(_))
    }

    fn handoff_ready(&self) -> bool {
        self.fault.is_none()
            && matches!(
                self.state,
                LoadPortState::DockedEmpty | LoadPortState::DockedLoaded
            )
    }

    fn emergency_safe(&mut self) {
        self.port.emergency_safe();
        self.prepare = PrepareProgress::Idle;
        self.derive_state();
    }

    fn handoff_complete(&mut self, direction: TransferDirection) {
        debug!(%direction, "handoff complete");
        self.prepare = PrepareProgress::Idle;
        self.derive_state();
    }

    fn release(&mut self) {
        self.prepare = PrepareProgress::Idle;
        self.derive_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::sim::RecordingPort;
    use e84_common::signal::{Polarity, SignalName};
    use std::time::SystemTime;

    fn setup() -> (SignalRegistry, LoadPortCoordinator) {
        let mut registry = SignalRegistry::new();
        let mut handle = |name: SignalName| {
            registry
                .register(name, name.direction(), Polarity::ActiveHigh)
                .unwrap()
        };
        let handles = SensorHandles {
            carrier_present: handle(SignalName::CarrierPresent),
            clamped: handle(SignalName::Clamped),
            docked: handle(SignalName::Docked),
            placement_ok: handle(SignalName::PlacementOk),
        };
        let port = RecordingPort::docked_empty();
        let coordinator = LoadPortCoordinator::new(Box::new(port), handles);
        (registry, coordinator)
    }

    fn sensor(sensor: PortSensor, level: bool) -> PortEvent {
        PortEvent::SensorChanged {
            sensor,
            level,
            at: SystemTime::now(),
        }
    }

    #[test]
    fn initial_state_from_port_report() {
        let (_, coordinator) = setup();
        assert_eq!(coordinator.state(), LoadPortState::DockedEmpty);
        assert!(coordinator.handoff_ready());
        assert!(!coordinator.is_prepared());
    }

    #[test]
    fn sensor_changes_mirror_into_registry() {
        let (mut registry, mut coordinator) = setup();
        let notice = coordinator
            .handle_event(sensor(PortSensor::CarrierPresent, true), &mut registry)
            .unwrap();
        assert_eq!(notice, None);
        assert!(registry.level(SignalName::CarrierPresent));
        assert_eq!(coordinator.state(), LoadPortState::DockedLoaded);
    }

    #[test]
    fn prepare_lifecycle() {
        let (mut registry, mut coordinator) = setup();
        coordinator.prepare(TransferDirection::Load).unwrap();
        assert_eq!(coordinator.state(), LoadPortState::Docking);
        assert!(!coordinator.is_prepared());
        // Not handoff-ready while in motion.
        assert!(!coordinator.handoff_ready());

        // Idempotent for the same direction.
        coordinator.prepare(TransferDirection::Load).unwrap();

        let notice = coordinator
            .handle_event(PortEvent::PrepareComplete { result: Ok(()) }, &mut registry)
            .unwrap();
        assert_eq!(notice, Some(PortNotice::Prepared));
        assert!(coordinator.is_prepared());
        assert_eq!(coordinator.state(), LoadPortState::DockedEmpty);

        coordinator.handoff_complete(TransferDirection::Load);
        assert!(!coordinator.is_prepared());
    }

    #[test]
    fn prepare_failure_latches_for_the_selection() {
        let (mut registry, mut coordinator) = setup();
        coordinator.prepare(TransferDirection::Unload).unwrap();
        let fault = PortFault::PlacementFailure("DOCK_FAIL".to_string());
        let notice = coordinator
            .handle_event(
                PortEvent::PrepareComplete {
                    result: Err(fault.clone()),
                },
                &mut registry,
            )
            .unwrap();
        assert_eq!(notice, Some(PortNotice::PrepareFailed(fault.clone())));
        assert!(!coordinator.is_prepared());

        // Re-issuing for the same selection fails immediately; it does
        // not silently retry the port.
        assert_eq!(coordinator.prepare(TransferDirection::Unload), Err(fault));

        // Releasing the selection clears the latch.
        coordinator.release();
        coordinator.prepare(TransferDirection::Unload).unwrap();
    }

    #[test]
    fn inconsistent_sensors_fault_the_port() {
        let (mut registry, mut coordinator) = setup();
        // Clamp without a carrier is impossible.
        let notice = coordinator
            .handle_event(sensor(PortSensor::Clamped, true), &mut registry)
            .unwrap();
        assert!(matches!(
            notice,
            Some(PortNotice::Faulted(PortFault::SensorInconsistent(_)))
        ));
        assert_eq!(coordinator.state(), LoadPortState::Fault);
        assert!(!coordinator.handoff_ready());
        assert!(!coordinator.clean_for_reset());
    }

    #[test]
    fn port_fault_latches_until_reset() {
        let (mut registry, mut coordinator) = setup();
        coordinator
            .handle_event(
                PortEvent::Fault {
                    fault: PortFault::ActuatorTimeout,
                },
                &mut registry,
            )
            .unwrap();
        assert_eq!(coordinator.state(), LoadPortState::Fault);
        assert!(matches!(
            coordinator.prepare(TransferDirection::Load),
            Err(PortFault::ActuatorTimeout)
        ));

        coordinator.reset(&mut registry).unwrap();
        assert!(coordinator.fault().is_none());
        assert_eq!(coordinator.state(), LoadPortState::DockedEmpty);
    }

    #[test]
    fn emergency_safe_clears_prepare() {
        let (_, mut coordinator) = setup();
        coordinator.prepare(TransferDirection::Load).unwrap();
        coordinator.emergency_safe();
        assert!(!coordinator.is_prepared());
        assert_eq!(coordinator.state(), LoadPortState::DockedEmpty);
    }
}
