//! ASCII-serial load port.
//!
//! Talks to a line-oriented collaborator (CR framing lives behind
//! [`LineTransport`]) with the verbs `LOAD`, `UNLOAD`, `STATUS`,
//! `RESET`, `STOP`. A single worker thread owns the transport and a
//! request queue with at most one command in flight, a per-command
//! reply deadline, and one retry on transport error. `STATUS` polling
//! feeds the same sensor pipeline as the digital variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use e84_common::config::AsciiConfig;

use crate::event::Event;
use crate::machine::state::TransferDirection;

use super::{LoadPort, PortEvent, PortFault, PortSensor, PortSensors, TransportError};

/// Interval between unsolicited `STATUS` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Pause before the single re-issue of a command answered `BUSY`.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

// ─── Transport collaborator ─────────────────────────────────────────

/// Line-oriented request/response collaborator. Serial framing (8-N-1,
/// CR termination) is its concern, not the core's.
pub trait LineTransport: Send {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Next response line, without its terminator.
    fn recv_line(&mut self, timeout: Duration) -> Result<String, TransportError>;
}

// ─── Response grammar ───────────────────────────────────────────────

/// Parsed load-port response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsciiResponse {
    Ok,
    Busy,
    Ready,
    Done,
    Err(String),
    Status(PortSensors),
}

/// Sensor levels from a `STATUS:<bitmap>` payload.
///
/// Bit 0 carrier present, bit 1 clamped, bit 2 docked, bit 3 placement.
pub fn sensors_from_bitmap(bits: u8) -> PortSensors {
    PortSensors {
        carrier_present: bits & 0x01 != 0,
        clamped: bits & 0x02 != 0,
        docked: bits & 0x04 != 0,
        placement_ok: bits & 0x08 != 0,
    }
}

/// Inverse of [`sensors_from_bitmap`].
pub fn bitmap_from_sensors(sensors: &PortSensors) -> u8 {
    (sensors.carrier_present as u8)
        | (sensors.clamped as u8) << 1
        | (sensors.docked as u8) << 2
        | (sensors.placement_ok as u8) << 3
}

/// Parse one response line.
pub fn parse_response(line: &str) -> Result<AsciiResponse, TransportError> {
    let line = line.trim();
    match line {
        "OK" => Ok(AsciiResponse::Ok),
        "BUSY" => Ok(AsciiResponse::Busy),
        "READY" => Ok(AsciiResponse::Ready),
        "DONE" => Ok(AsciiResponse::Done),
        _ => {
            if let Some(code) = line.strip_prefix("ERR:") {
                return Ok(AsciiResponse::Err(code.to_string()));
            }
            if let Some(bitmap) = line.strip_prefix("STATUS:") {
                let bits = u8::from_str_radix(bitmap, 16)
                    .map_err(|_| TransportError::SerialFraming(line.to_string()))?;
                return Ok(AsciiResponse::Status(sensors_from_bitmap(bits)));
            }
            Err(TransportError::SerialFraming(line.to_string()))
        }
    }
}

// ─── AsciiLoadPort ──────────────────────────────────────────────────

#[derive(Debug)]
enum AsciiRequest {
    Prepare(TransferDirection),
    Reset,
}

/// Load port driven over the ASCII serial protocol.
pub struct AsciiLoadPort {
    transport: Option<Box<dyn LineTransport>>,
    reply_timeout: Duration,
    poll_interval: Duration,
    cmd_tx: Option<Sender<AsciiRequest>>,
    cmd_rx: Option<Receiver<AsciiRequest>>,
    sensors: Arc<Mutex<PortSensors>>,
    safe: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AsciiLoadPort {
    pub fn new(transport: Box<dyn LineTransport>, config: &AsciiConfig) -> Self {
        Self::with_poll_interval(transport, config, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        transport: Box<dyn LineTransport>,
        config: &AsciiConfig,
        poll_interval: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        Self {
            transport: Some(transport),
            reply_timeout: Duration::from_millis(config.reply_timeout_ms),
            poll_interval,
            cmd_tx: Some(cmd_tx),
            cmd_rx: Some(cmd_rx),
            sensors: Arc::new(Mutex::new(PortSensors::default())),
            safe: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn enqueue(&self, request: AsciiRequest) -> Result<(), PortFault> {
        let tx = self.cmd_tx.as_ref().ok_or(TransportError::Unavailable)?;
        tx.send(request)
            .map_err(|_| TransportError::Unavailable)?;
        Ok(())
    }
}

impl LoadPort for AsciiLoadPort {
    fn connect(&mut self, events: Sender<Event>) -> Result<(), PortFault> {
        let transport = self.transport.take().ok_or(TransportError::Unavailable)?;
        let requests = self.cmd_rx.take().ok_or(TransportError::Unavailable)?;

        let worker = AsciiWorker {
            transport,
            requests,
            events,
            sensors: Arc::clone(&self.sensors),
            reply_timeout: self.reply_timeout,
            poll_interval: self.poll_interval,
            safe: Arc::clone(&self.safe),
            stop: Arc::clone(&self.stop),
            poll_fault_reported: false,
        };
        self.worker = Some(
            thread::Builder::new()
                .name("e84-ascii".to_string())
                .spawn(move || worker.run())
                .expect("failed to spawn ascii worker thread"),
        );
        Ok(())
    }

    fn prepare_for_load(&mut self) -> Result<(), PortFault> {
        self.enqueue(AsciiRequest::Prepare(TransferDirection::Load))
    }

    fn prepare_for_unload(&mut self) -> Result<(), PortFault> {
        self.enqueue(AsciiRequest::Prepare(TransferDirection::Unload))
    }

    fn report(&self) -> PortSensors {
        *self.sensors.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emergency_safe(&mut self) {
        // Flag-based so it is synchronous and re-entrant; the worker
        // turns it into a single STOP.
        self.safe.store(true, Ordering::SeqCst);
    }

    fn reset(&mut self) -> Result<(), PortFault> {
        self.enqueue(AsciiRequest::Reset)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the worker immediately.
        self.cmd_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AsciiLoadPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Worker ─────────────────────────────────────────────────────────

struct AsciiWorker {
    transport: Box<dyn LineTransport>,
    requests: Receiver<AsciiRequest>,
    events: Sender<Event>,
    sensors: Arc<Mutex<PortSensors>>,
    reply_timeout: Duration,
    poll_interval: Duration,
    safe: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    poll_fault_reported: bool,
}

impl AsciiWorker {
    fn run(mut self) {
        info!("ascii load port worker started");
        self.poll_status();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                let _ = self.command("STOP");
                break;
            }
            if self.safe.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.command("STOP") {
                    warn!(error = %e, "emergency STOP failed");
                }
            }

            match self.requests.recv_timeout(self.poll_interval) {
                Ok(AsciiRequest::Prepare(direction)) => self.prepare(direction),
                Ok(AsciiRequest::Reset) => {
                    if let Err(e) = self.command("RESET") {
                        warn!(error = %e, "RESET failed");
                    }
                    self.poll_status();
                }
                Err(RecvTimeoutError::Timeout) => self.poll_status(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("ascii load port worker stopped");
    }

    fn exchange(&mut self, verb: &str) -> Result<AsciiResponse, TransportError> {
        self.transport.send_line(verb)?;
        let line = self.transport.recv_line(self.reply_timeout)?;
        parse_response(&line)
    }

    /// One command, one retry on transport error.
    fn command(&mut self, verb: &str) -> Result<AsciiResponse, TransportError> {
        match self.exchange(verb) {
            Ok(response) => Ok(response),
            Err(first) => {
                debug!(verb, error = %first, "transport error, retrying once");
                self.exchange(verb)
            }
        }
    }

    fn prepare(&mut self, direction: TransferDirection) {
        let verb = match direction {
            TransferDirection::Load => "LOAD",
            TransferDirection::Unload => "UNLOAD",
        };
        let mut outcome = self.command(verb);
        if matches!(outcome, Ok(AsciiResponse::Busy)) {
            thread::sleep(BUSY_RETRY_DELAY);
            outcome = self.command(verb);
        }

        let result = match outcome {
            Ok(AsciiResponse::Ok | AsciiResponse::Ready | AsciiResponse::Done) => Ok(()),
            Ok(AsciiResponse::Busy) => {
                Err(PortFault::PlacementFailure("port busy".to_string()))
            }
            Ok(AsciiResponse::Err(code)) => Err(PortFault::PlacementFailure(code)),
            Ok(AsciiResponse::Status(_)) => Err(PortFault::Transport(
                TransportError::SerialFraming("unexpected STATUS reply".to_string()),
            )),
            Err(e) => Err(PortFault::Transport(e)),
        };
        let _ = self
            .events
            .send(Event::Port(PortEvent::PrepareComplete { result }));
        self.poll_status();
    }

    fn poll_status(&mut self) {
        match self.command("STATUS") {
            Ok(AsciiResponse::Status(fresh)) => {
                self.poll_fault_reported = false;
                let previous = {
                    let mut guard = self.sensors.lock().unwrap_or_else(|p| p.into_inner());
                    let previous = *guard;
                    *guard = fresh;
                    previous
                };
                for sensor in PortSensor::ALL {
                    if previous.get(sensor) != fresh.get(sensor) {
                        let _ = self.events.send(Event::Port(PortEvent::SensorChanged {
                            sensor,
                            level: fresh.get(sensor),
                            at: SystemTime::now(),
                        }));
                    }
                }
            }
            Ok(other) => {
                warn!(?other, "unexpected STATUS reply");
                self.report_poll_fault(TransportError::SerialFraming(format!(
                    "unexpected STATUS reply: {other:?}"
                )));
            }
            Err(e) => {
                self.report_poll_fault(e);
            }
        }
    }

    /// One fault event per failure streak; a good poll re-arms it.
    fn report_poll_fault(&mut self, error: TransportError) {
        if !self.poll_fault_reported {
            self.poll_fault_reported = true;
            let _ = self.events.send(Event::Port(PortEvent::Fault {
                fault: PortFault::Transport(error),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        script: VecDeque<Result<String, TransportError>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<String, TransportError>>) -> (Self, Arc<Mutex<Vec<String>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    script: script.into(),
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    impl LineTransport for ScriptedTransport {
        fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn recv_line(&mut self, _timeout: Duration) -> Result<String, TransportError> {
            self.script
                .pop_front()
                .unwrap_or(Err(TransportError::SerialTimeout))
        }
    }

    fn ascii_config() -> AsciiConfig {
        AsciiConfig {
            port: "test".to_string(),
            baud: 9600,
            reply_timeout_ms: 100,
        }
    }

    fn spawn_port(
        script: Vec<Result<String, TransportError>>,
    ) -> (
        AsciiLoadPort,
        crossbeam::channel::Receiver<Event>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let (transport, sent) = ScriptedTransport::new(script);
        let mut port = AsciiLoadPort::with_poll_interval(
            Box::new(transport),
            &ascii_config(),
            Duration::from_secs(30),
        );
        let (tx, rx) = crossbeam::channel::unbounded();
        port.connect(tx).unwrap();
        (port, rx, sent)
    }

    fn next_prepare_result(
        rx: &crossbeam::channel::Receiver<Event>,
    ) -> Result<(), PortFault> {
        loop {
            match rx.recv_timeout(Duration::from_secs(2)).expect("event") {
                Event::Port(PortEvent::PrepareComplete { result }) => return result,
                _ => continue,
            }
        }
    }

    #[test]
    fn parse_simple_responses() {
        assert_eq!(parse_response("OK").unwrap(), AsciiResponse::Ok);
        assert_eq!(parse_response("BUSY").unwrap(), AsciiResponse::Busy);
        assert_eq!(parse_response("READY").unwrap(), AsciiResponse::Ready);
        assert_eq!(parse_response("DONE").unwrap(), AsciiResponse::Done);
        assert_eq!(
            parse_response("ERR:DOCK_FAIL").unwrap(),
            AsciiResponse::Err("DOCK_FAIL".to_string())
        );
    }

    #[test]
    fn parse_status_bitmap() {
        let parsed = parse_response("STATUS:0D").unwrap();
        let sensors = match parsed {
            AsciiResponse::Status(s) => s,
            other => panic!("expected status, got {other:?}"),
        };
        assert!(sensors.carrier_present);
        assert!(!sensors.clamped);
        assert!(sensors.docked);
        assert!(sensors.placement_ok);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_response("STATUS:ZZ"),
            Err(TransportError::SerialFraming(_))
        ));
        assert!(matches!(
            parse_response("HELLO"),
            Err(TransportError::SerialFraming(_))
        ));
    }

    #[test]
    fn bitmap_roundtrip() {
        for bits in 0..=0x0Fu8 {
            assert_eq!(bitmap_from_sensors(&sensors_from_bitmap(bits)), bits);
        }
    }

    #[test]
    fn initial_status_poll_reports_sensors() {
        let (mut port, rx, sent) = spawn_port(vec![Ok("STATUS:04".to_string())]);
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Event::Port(PortEvent::SensorChanged { sensor, level, .. }) => {
                assert_eq!(sensor, PortSensor::Docked);
                assert!(level);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        port.shutdown();
        assert_eq!(sent.lock().unwrap().first().map(String::as_str), Some("STATUS"));
        assert_eq!(port.report().docked, true);
    }

    #[test]
    fn prepare_load_succeeds() {
        let (mut port, rx, sent) = spawn_port(vec![
            Ok("STATUS:04".to_string()),
            Ok("OK".to_string()),
            Ok("STATUS:04".to_string()),
        ]);
        port.prepare_for_load().unwrap();
        assert_eq!(next_prepare_result(&rx), Ok(()));
        port.shutdown();
        assert!(sent.lock().unwrap().iter().any(|s| s == "LOAD"));
    }

    #[test]
    fn prepare_error_code_becomes_placement_failure() {
        let (mut port, rx, _) = spawn_port(vec![
            Ok("STATUS:04".to_string()),
            Ok("ERR:DOCK_FAIL".to_string()),
            Ok("STATUS:04".to_string()),
        ]);
        port.prepare_for_unload().unwrap();
        assert_eq!(
            next_prepare_result(&rx),
            Err(PortFault::PlacementFailure("DOCK_FAIL".to_string()))
        );
        port.shutdown();
    }

    #[test]
    fn transport_error_retried_once() {
        let (mut port, rx, sent) = spawn_port(vec![
            Ok("STATUS:04".to_string()),
            Err(TransportError::SerialTimeout),
            Ok("OK".to_string()),
            Ok("STATUS:04".to_string()),
        ]);
        port.prepare_for_load().unwrap();
        assert_eq!(next_prepare_result(&rx), Ok(()));
        port.shutdown();
        let sent = sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|s| *s == "LOAD").count(), 2);
    }

    #[test]
    fn persistent_transport_error_faults_prepare() {
        let (mut port, rx, _) = spawn_port(vec![
            Ok("STATUS:04".to_string()),
            Err(TransportError::SerialTimeout),
            Err(TransportError::SerialTimeout),
        ]);
        port.prepare_for_load().unwrap();
        assert_eq!(
            next_prepare_result(&rx),
            Err(PortFault::Transport(TransportError::SerialTimeout))
        );
        port.shutdown();
    }

    #[test]
    fn busy_reply_retried_then_succeeds() {
        let (mut port, rx, sent) = spawn_port(vec![
            Ok("STATUS:04".to_string()),
            Ok("BUSY".to_string()),
            Ok("READY".to_string()),
            Ok("STATUS:04".to_string()),
        ]);
        port.prepare_for_load().unwrap();
        assert_eq!(next_prepare_result(&rx), Ok(()));
        port.shutdown();
        assert_eq!(sent.lock().unwrap().iter().filter(|s| *s == "LOAD").count(), 2);
    }

    #[test]
    fn prepare_after_shutdown_is_unavailable() {
        let (mut port, _rx, _) = spawn_port(vec![Ok("STATUS:04".to_string())]);
        port.shutdown();
        assert!(matches!(
            port.prepare_for_load(),
            Err(PortFault::Transport(TransportError::Unavailable))
        ));
    }
}
