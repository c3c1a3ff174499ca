//! Simulated transport collaborators.
//!
//! Used by the daemon's simulation mode and by tests: an in-memory
//! digital I/O card stack, a scripted-free ASCII load port that behaves
//! like a well-mannered LPT, and a direct [`LoadPort`] double with
//! externally controllable sensors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crossbeam::channel::Sender;
use tracing::debug;

use e84_common::config::LineAddress;

use crate::event::Event;
use crate::port::ascii::{bitmap_from_sensors, LineTransport};
use crate::port::digital::{DigitalIo, LineCallback};
use crate::port::{LoadPort, PortEvent, PortFault, PortSensor, PortSensors, TransportError};

// ─── LoopbackIo ─────────────────────────────────────────────────────

/// In-memory digital I/O: lines live in a map, input changes are driven
/// by [`LoopbackIo::set_line`] and fan out to subscribers.
#[derive(Default)]
pub struct LoopbackIo {
    lines: HashMap<LineAddress, bool>,
    callbacks: Vec<LineCallback>,
}

impl LoopbackIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current raw level of a line.
    pub fn line(&self, line: LineAddress) -> bool {
        self.lines.get(&line).copied().unwrap_or(false)
    }

    /// Drive an input line from outside and notify subscribers.
    ///
    /// Callbacks run while the caller holds the I/O lock; they must not
    /// call back into the I/O.
    pub fn set_line(&mut self, line: LineAddress, level: bool) {
        let previous = self.lines.insert(line, level);
        if previous == Some(level) {
            return;
        }
        for callback in &mut self.callbacks {
            callback(line, level);
        }
    }
}

impl DigitalIo for LoopbackIo {
    fn read_line(&mut self, line: LineAddress) -> Result<bool, TransportError> {
        Ok(self.line(line))
    }

    fn write_line(&mut self, line: LineAddress, level: bool) -> Result<(), TransportError> {
        debug!(%line, level, "loopback output write");
        self.lines.insert(line, level);
        Ok(())
    }

    fn subscribe(&mut self, callback: LineCallback) -> Result<(), TransportError> {
        self.callbacks.push(callback);
        Ok(())
    }
}

// ─── SimLpt ─────────────────────────────────────────────────────────

/// Pod and latch state of the simulated LPT, shared with the test or
/// simulation driver.
#[derive(Debug, Clone, Copy)]
pub struct SimLptState {
    pub sensors: PortSensors,
    /// Respond `ERR:<code>` to the next LOAD/UNLOAD.
    pub fail_next: Option<&'static str>,
}

impl Default for SimLptState {
    fn default() -> Self {
        Self {
            sensors: PortSensors {
                docked: true,
                ..Default::default()
            },
            fail_next: None,
        }
    }
}

impl SimLptState {
    /// A carrier arrives on the port plate.
    pub fn place_pod(&mut self) {
        self.sensors.carrier_present = true;
        self.sensors.placement_ok = true;
    }

    /// The carrier is picked off the port plate.
    pub fn remove_pod(&mut self) {
        self.sensors.carrier_present = false;
        self.sensors.placement_ok = false;
        self.sensors.clamped = false;
    }
}

/// A well-behaved simulated LPT speaking the ASCII verb set.
pub struct SimLpt {
    state: Arc<Mutex<SimLptState>>,
    pending: Option<String>,
}

impl SimLpt {
    /// The transport plus a shared handle for driving pod state.
    pub fn shared() -> (Self, Arc<Mutex<SimLptState>>) {
        let state = Arc::new(Mutex::new(SimLptState::default()));
        (
            Self {
                state: state.clone(),
                pending: None,
            },
            state,
        )
    }

    fn respond(&self, verb: &str) -> String {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match verb {
            "LOAD" => {
                if let Some(code) = state.fail_next.take() {
                    return format!("ERR:{code}");
                }
                if state.sensors.carrier_present {
                    "ERR:OCCUPIED".to_string()
                } else {
                    state.sensors.clamped = false;
                    "READY".to_string()
                }
            }
            "UNLOAD" => {
                if let Some(code) = state.fail_next.take() {
                    return format!("ERR:{code}");
                }
                if !state.sensors.carrier_present {
                    "ERR:EMPTY".to_string()
                } else {
                    state.sensors.clamped = false;
                    "READY".to_string()
                }
            }
            "STATUS" => format!("STATUS:{:02X}", bitmap_from_sensors(&state.sensors)),
            "RESET" | "STOP" => "OK".to_string(),
            _ => "ERR:UNK".to_string(),
        }
    }
}

impl LineTransport for SimLpt {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.pending = Some(self.respond(line.trim()));
        Ok(())
    }

    fn recv_line(&mut self, _timeout: Duration) -> Result<String, TransportError> {
        self.pending.take().ok_or(TransportError::SerialTimeout)
    }
}

// ─── RecordingPort ──────────────────────────────────────────────────

#[derive(Default)]
struct RecordingInner {
    sensors: Mutex<PortSensors>,
    events: Mutex<Option<Sender<Event>>>,
    prepare_fault: Mutex<Option<PortFault>>,
    safe_calls: AtomicUsize,
    resets: AtomicUsize,
}

/// External control surface for a [`RecordingPort`].
#[derive(Clone, Default)]
pub struct RecordingPortHandle {
    inner: Arc<RecordingInner>,
}

impl RecordingPortHandle {
    /// Flip a sensor and report it through the event queue.
    pub fn set_sensor(&self, sensor: PortSensor, level: bool) {
        {
            let mut sensors = self.inner.sensors.lock().unwrap();
            if sensors.get(sensor) == level {
                return;
            }
            sensors.set(sensor, level);
        }
        if let Some(events) = self.inner.events.lock().unwrap().clone() {
            let _ = events.send(Event::Port(PortEvent::SensorChanged {
                sensor,
                level,
                at: SystemTime::now(),
            }));
        }
    }

    /// Make subsequent prepares complete with the given fault.
    pub fn fail_prepares(&self, fault: PortFault) {
        *self.inner.prepare_fault.lock().unwrap() = Some(fault);
    }

    pub fn clear_prepare_fault(&self) {
        *self.inner.prepare_fault.lock().unwrap() = None;
    }

    /// Report a spontaneous port fault.
    pub fn raise_fault(&self, fault: PortFault) {
        if let Some(events) = self.inner.events.lock().unwrap().clone() {
            let _ = events.send(Event::Port(PortEvent::Fault { fault }));
        }
    }

    pub fn safe_calls(&self) -> usize {
        self.inner.safe_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.inner.resets.load(Ordering::SeqCst)
    }
}

/// Deterministic in-process [`LoadPort`]: prepares complete immediately
/// through the event queue, sensors are driven by the handle.
#[derive(Default)]
pub struct RecordingPort {
    handle: RecordingPortHandle,
}

impl RecordingPort {
    /// Docked, empty, clamp released: ready to load.
    pub fn docked_empty() -> Self {
        let port = Self::default();
        port.handle.inner.sensors.lock().unwrap().docked = true;
        port
    }

    /// Docked with a seated carrier: ready to unload.
    pub fn docked_loaded() -> Self {
        let port = Self::default();
        {
            let mut sensors = port.handle.inner.sensors.lock().unwrap();
            sensors.docked = true;
            sensors.carrier_present = true;
            sensors.placement_ok = true;
        }
        port
    }

    pub fn handle(&self) -> RecordingPortHandle {
        self.handle.clone()
    }

    fn complete_prepare(&self) {
        let result = match self.handle.inner.prepare_fault.lock().unwrap().clone() {
            Some(fault) => Err(fault),
            None => Ok(()),
        };
        if let Some(events) = self.handle.inner.events.lock().unwrap().clone() {
            let _ = events.send(Event::Port(PortEvent::PrepareComplete { result }));
        }
    }
}

impl LoadPort for RecordingPort {
    fn connect(&mut self, events: Sender<Event>) -> Result<(), PortFault> {
        *self.handle.inner.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn prepare_for_load(&mut self) -> Result<(), PortFault> {
        self.complete_prepare();
        Ok(())
    }

    fn prepare_for_unload(&mut self) -> Result<(), PortFault> {
        self.complete_prepare();
        Ok(())
    }

    fn report(&self) -> PortSensors {
        *self.handle.inner.sensors.lock().unwrap()
    }

    fn emergency_safe(&mut self) {
        self.handle.inner.safe_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&mut self) -> Result<(), PortFault> {
        self.handle.inner.resets.fetch_add(1, Ordering::SeqCst);
        *self.handle.inner.prepare_fault.lock().unwrap() = None;
        Ok(())
    }

    fn shutdown(&mut self) {
        *self.handle.inner.events.lock().unwrap() = None;
    }
}
