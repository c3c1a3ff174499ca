//! Digital-line load port and AMHS line bridge.
//!
//! The core never sees card models. It talks to a [`DigitalIo`]
//! capability: 16 input and 16 output lines per card, grouped as two
//! 8-bit ports, addressed by `(card, port, bit)`. Which line carries
//! which E84 signal is data-driven configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use e84_common::config::{DigitalConfig, LineAddress, LineMapping};
use e84_common::signal::{Polarity, SignalDirection};

use crate::event::Event;
use crate::machine::state::TransferDirection;
use crate::signal::SignalRegistry;

use super::{LoadPort, PortEvent, PortFault, PortSensor, PortSensors, TransportError};

/// Sensor-confirmation deadline for prepare commands.
pub const DEFAULT_ACTUATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval of the prepare-deadline monitor thread.
const MONITOR_TICK: Duration = Duration::from_millis(50);

// ─── DigitalIo capability ───────────────────────────────────────────

/// Change notification from the I/O driver: raw line level, before
/// polarity decoding.
pub type LineCallback = Box<dyn FnMut(LineAddress, bool) + Send>;

/// Abstract digital I/O card stack.
///
/// Implementations must support multiple subscribed callbacks (the AMHS
/// bridge and the load port both listen) and must not call back into
/// themselves from a callback.
pub trait DigitalIo: Send {
    /// Raw level of a line.
    fn read_line(&mut self, line: LineAddress) -> Result<bool, TransportError>;

    /// Drive an output line.
    fn write_line(&mut self, line: LineAddress, level: bool) -> Result<(), TransportError>;

    /// Register a change callback for input lines.
    fn subscribe(&mut self, callback: LineCallback) -> Result<(), TransportError>;
}

/// Shared handle to the I/O driver.
pub type SharedIo = Arc<Mutex<dyn DigitalIo>>;

fn lock_io(io: &SharedIo) -> std::sync::MutexGuard<'_, dyn DigitalIo + 'static> {
    io.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── DigitalBridge ──────────────────────────────────────────────────

/// Carries the AMHS handshake lines between the I/O driver and the
/// signal registry: input edges become queue events, output changes are
/// written through to their lines.
pub struct DigitalBridge {
    io: SharedIo,
    inputs: Vec<LineMapping>,
    outputs: Vec<LineMapping>,
}

impl DigitalBridge {
    pub fn new(io: SharedIo, config: &DigitalConfig) -> Self {
        let (inputs, outputs): (Vec<LineMapping>, Vec<LineMapping>) = config
            .mapping
            .iter()
            .filter(|m| m.signal.direction() != SignalDirection::Internal)
            .cloned()
            .partition(|m| m.signal.direction() == SignalDirection::Input);
        Self {
            io,
            inputs,
            outputs,
        }
    }

    /// Start posting input edges into the event queue.
    pub fn connect(&self, events: Sender<Event>) -> Result<(), TransportError> {
        let inputs = self.inputs.clone();
        lock_io(&self.io).subscribe(Box::new(move |line, raw| {
            if let Some(mapping) = inputs.iter().find(|m| m.address() == line) {
                let _ = events.send(Event::SignalEdge {
                    name: mapping.signal,
                    level: mapping.polarity.decode(raw),
                    at: SystemTime::now(),
                });
            }
        }))?;
        info!(inputs = self.inputs.len(), "digital AMHS bridge connected");
        Ok(())
    }

    /// Subscribe output signals so every committed level change is
    /// driven onto its physical line.
    pub fn attach_outputs(&self, registry: &mut SignalRegistry) {
        for mapping in &self.outputs {
            let io = Arc::clone(&self.io);
            let address = mapping.address();
            let polarity = mapping.polarity;
            let signal = mapping.signal;
            registry.subscribe(
                mapping.signal,
                Box::new(move |change, _, _| {
                    if let Err(e) = lock_io(&io).write_line(address, polarity.encode(change.new)) {
                        warn!(%signal, error = %e, "output line write failed");
                    }
                }),
            );
        }
    }

    /// Drive the current output levels once, at startup.
    pub fn sync_outputs(&self, registry: &SignalRegistry) -> Result<(), TransportError> {
        let mut io = lock_io(&self.io);
        for mapping in &self.outputs {
            let level = registry.level(mapping.signal);
            io.write_line(mapping.address(), mapping.polarity.encode(level))?;
        }
        Ok(())
    }
}

// ─── DigitalLoadPort ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PendingPrepare {
    direction: TransferDirection,
    deadline: Instant,
}

/// Load port whose sensors arrive on digital lines.
///
/// The port mechanism runs its own motion; this variant watches the
/// sensor lines and reports prepare completion when they reach the
/// target combination. A prepare that the sensors never confirm elapses
/// as `ActuatorTimeout`.
pub struct DigitalLoadPort {
    io: SharedIo,
    sensor_map: Vec<(PortSensor, LineAddress, Polarity)>,
    sensors: Arc<Mutex<PortSensors>>,
    pending: Arc<Mutex<Option<PendingPrepare>>>,
    events: Option<Sender<Event>>,
    actuator_timeout: Duration,
    running: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl DigitalLoadPort {
    pub fn new(io: SharedIo, config: &DigitalConfig) -> Result<Self, PortFault> {
        Self::with_timeout(io, config, DEFAULT_ACTUATOR_TIMEOUT)
    }

    pub fn with_timeout(
        io: SharedIo,
        config: &DigitalConfig,
        actuator_timeout: Duration,
    ) -> Result<Self, PortFault> {
        let mut sensor_map = Vec::new();
        for mapping in &config.mapping {
            if let Some(sensor) = PortSensor::from_signal(mapping.signal) {
                sensor_map.push((sensor, mapping.address(), mapping.polarity));
            }
        }

        // Initial levels straight off the lines.
        let mut sensors = PortSensors::default();
        {
            let mut guard = lock_io(&io);
            for (sensor, address, polarity) in &sensor_map {
                let raw = guard.read_line(*address)?;
                sensors.set(*sensor, polarity.decode(raw));
            }
        }

        Ok(Self {
            io,
            sensor_map,
            sensors: Arc::new(Mutex::new(sensors)),
            pending: Arc::new(Mutex::new(None)),
            events: None,
            actuator_timeout,
            running: Arc::new(AtomicBool::new(false)),
            monitor: None,
        })
    }

    fn satisfied(direction: TransferDirection, sensors: &PortSensors) -> bool {
        match direction {
            TransferDirection::Load => sensors.ready_for_load(),
            TransferDirection::Unload => sensors.ready_for_unload(),
        }
    }

    fn begin_prepare(&mut self, direction: TransferDirection) -> Result<(), PortFault> {
        let events = self.events.clone().ok_or(TransportError::Unavailable)?;
        let sensors = *self.sensors.lock().unwrap_or_else(|p| p.into_inner());
        if Self::satisfied(direction, &sensors) {
            let _ = events.send(Event::Port(PortEvent::PrepareComplete { result: Ok(()) }));
            return Ok(());
        }
        debug!(%direction, "digital prepare waiting on sensors");
        *self.pending.lock().unwrap_or_else(|p| p.into_inner()) = Some(PendingPrepare {
            direction,
            deadline: Instant::now() + self.actuator_timeout,
        });
        Ok(())
    }
}

impl LoadPort for DigitalLoadPort {
    fn connect(&mut self, events: Sender<Event>) -> Result<(), PortFault> {
        self.events = Some(events.clone());

        // Sensor edges: mirror, report, and complete pending prepares.
        let sensor_map = self.sensor_map.clone();
        let sensors = Arc::clone(&self.sensors);
        let pending = Arc::clone(&self.pending);
        let edge_events = events.clone();
        lock_io(&self.io)
            .subscribe(Box::new(move |line, raw| {
                let Some((sensor, _, polarity)) =
                    sensor_map.iter().find(|(_, a, _)| *a == line)
                else {
                    return;
                };
                let level = polarity.decode(raw);
                let now_sensors = {
                    let mut guard = sensors.lock().unwrap_or_else(|p| p.into_inner());
                    if guard.get(*sensor) == level {
                        return;
                    }
                    guard.set(*sensor, level);
                    *guard
                };
                let _ = edge_events.send(Event::Port(PortEvent::SensorChanged {
                    sensor: *sensor,
                    level,
                    at: SystemTime::now(),
                }));

                let mut pending_guard = pending.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(p) = *pending_guard {
                    if DigitalLoadPort::satisfied(p.direction, &now_sensors) {
                        *pending_guard = None;
                        let _ = edge_events
                            .send(Event::Port(PortEvent::PrepareComplete { result: Ok(()) }));
                    }
                }
            }))
            .map_err(PortFault::from)?;

        // Deadline monitor for prepares the sensors never confirm.
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let pending = Arc::clone(&self.pending);
        let monitor = thread::Builder::new()
            .name("e84-digital-monitor".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(MONITOR_TICK);
                    let mut guard = pending.lock().unwrap_or_else(|p| p.into_inner());
                    if guard.is_some_and(|p| Instant::now() >= p.deadline) {
                        *guard = None;
                        drop(guard);
                        let _ = events.send(Event::Port(PortEvent::PrepareComplete {
                            result: Err(PortFault::ActuatorTimeout),
                        }));
                    }
                }
            })
            .expect("failed to spawn digital monitor thread");
        self.monitor = Some(monitor);
        Ok(())
    }

    fn prepare_for_load(&mut self) -> Result<(), PortFault> {
        self.begin_prepare(TransferDirection::Load)
    }

    fn prepare_for_unload(&mut self) -> Result<(), PortFault> {
        self.begin_prepare(TransferDirection::Unload)
    }

    fn report(&self) -> PortSensors {
        *self.sensors.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emergency_safe(&mut self) {
        // The port mechanism is self-contained; the safest action is to
        // stop expecting motion. Re-entrant: clearing twice is fine.
        *self.pending.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn reset(&mut self) -> Result<(), PortFault> {
        *self.pending.lock().unwrap_or_else(|p| p.into_inner()) = None;
        let mut fresh = PortSensors::default();
        {
            let mut io = lock_io(&self.io);
            for (sensor, address, polarity) in &self.sensor_map {
                fresh.set(*sensor, polarity.decode(io.read_line(*address)?));
            }
        }
        *self.sensors.lock().unwrap_or_else(|p| p.into_inner()) = fresh;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
    }
}

impl Drop for DigitalLoadPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}
