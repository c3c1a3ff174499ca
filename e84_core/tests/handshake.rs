//! Integration: complete load and unload handshakes through the
//! controller facade, driven event by event against a deterministic
//! in-process load port.

use std::time::SystemTime;

use crossbeam::channel::Receiver;

use e84_common::config::{
    AsciiConfig, ControllerConfig, ControllerMode, ControllerSection, InterfaceKind, LogLevel,
};
use e84_common::signal::SignalName;
use e84_common::timer::TimerConfig;
use e84_core::event::ControllerEvent;
use e84_core::port::sim::{RecordingPort, RecordingPortHandle};
use e84_core::port::PortSensor;
use e84_core::{Controller, E84State, Event};

fn test_config() -> ControllerConfig {
    ControllerConfig {
        controller: ControllerSection {
            interface: InterfaceKind::Ascii,
            mode: ControllerMode::Auto,
            log_level: LogLevel::Info,
        },
        timers: TimerConfig::default(),
        digital: None,
        ascii: Some(AsciiConfig::default()),
    }
}

fn controller_over(
    port: RecordingPort,
) -> (Controller, RecordingPortHandle, Receiver<ControllerEvent>) {
    let handle = port.handle();
    let mut controller = Controller::new(&test_config(), Box::new(port)).expect("controller");
    let (obs_tx, obs_rx) = crossbeam::channel::unbounded();
    controller.subscribe_events(obs_tx);
    controller.start().expect("start");
    (controller, handle, obs_rx)
}

fn edge(controller: &mut Controller, name: SignalName, level: bool) {
    controller
        .handle(Event::SignalEdge {
            name,
            level,
            at: SystemTime::now(),
        })
        .expect("edge");
}

fn state_trace(observed: &Receiver<ControllerEvent>) -> Vec<E84State> {
    observed
        .try_iter()
        .filter_map(|e| match e {
            ControllerEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

#[test]
fn happy_load_sequence() {
    let (mut controller, handle, observed) = controller_over(RecordingPort::docked_empty());
    assert_eq!(controller.state(), E84State::Idle);
    assert!(controller.snapshot().level(SignalName::HoAvbl));

    // Selection: direction load, prepare completes through the queue.
    edge(&mut controller, SignalName::Cs1, true);
    assert_eq!(controller.state(), E84State::Selected);
    controller.pump().unwrap();

    edge(&mut controller, SignalName::Valid, true);
    assert_eq!(controller.state(), E84State::TransferReady);
    assert!(controller.snapshot().level(SignalName::LReq));
    assert!(!controller.snapshot().level(SignalName::UReq));

    edge(&mut controller, SignalName::TrReq, true);
    assert_eq!(controller.state(), E84State::ReadyAsserted);
    assert!(controller.snapshot().level(SignalName::Ready));

    edge(&mut controller, SignalName::Busy, true);
    assert_eq!(controller.state(), E84State::TransferInProgress);

    // The carrier lands on the port plate mid-transfer.
    handle.set_sensor(PortSensor::CarrierPresent, true);
    handle.set_sensor(PortSensor::PlacementOk, true);
    controller.pump().unwrap();
    assert!(controller.snapshot().level(SignalName::CarrierPresent));

    edge(&mut controller, SignalName::Busy, false);
    assert_eq!(controller.state(), E84State::TransferInProgress);

    edge(&mut controller, SignalName::Compt, true);
    assert_eq!(controller.state(), E84State::TransferComplete);
    assert!(!controller.snapshot().level(SignalName::LReq));
    assert!(!controller.snapshot().level(SignalName::Ready));

    edge(&mut controller, SignalName::TrReq, false);
    edge(&mut controller, SignalName::Valid, false);
    assert_eq!(controller.state(), E84State::HandoffComplete);

    edge(&mut controller, SignalName::Compt, false);
    edge(&mut controller, SignalName::Cs1, false);
    assert_eq!(controller.state(), E84State::Idle);
    assert!(controller.armed_timer().is_none());

    // Round trip: all outputs back to zero except HO_AVBL.
    let snapshot = controller.snapshot();
    assert!(snapshot.level(SignalName::HoAvbl));
    for name in [SignalName::LReq, SignalName::UReq, SignalName::Ready] {
        assert!(!snapshot.level(name), "{name} asserted after round trip");
    }

    let trace = state_trace(&observed);
    assert_eq!(
        trace,
        vec![
            E84State::Selected,
            E84State::TransferReady,
            E84State::ReadyAsserted,
            E84State::TransferInProgress,
            E84State::TransferComplete,
            E84State::HandoffComplete,
            E84State::Idle,
        ]
    );
}

#[test]
fn happy_unload_sequence() {
    let (mut controller, handle, _observed) = controller_over(RecordingPort::docked_loaded());

    edge(&mut controller, SignalName::Cs0, true);
    assert_eq!(controller.state(), E84State::Selected);
    controller.pump().unwrap();

    edge(&mut controller, SignalName::Valid, true);
    assert_eq!(controller.state(), E84State::TransferReady);
    assert!(controller.snapshot().level(SignalName::UReq));
    assert!(!controller.snapshot().level(SignalName::LReq));

    edge(&mut controller, SignalName::TrReq, true);
    edge(&mut controller, SignalName::Busy, true);

    // The carrier leaves the port plate.
    handle.set_sensor(PortSensor::PlacementOk, false);
    handle.set_sensor(PortSensor::CarrierPresent, false);
    controller.pump().unwrap();

    edge(&mut controller, SignalName::Busy, false);
    edge(&mut controller, SignalName::Compt, true);
    assert_eq!(controller.state(), E84State::TransferComplete);
    assert!(!controller.snapshot().level(SignalName::UReq));

    edge(&mut controller, SignalName::TrReq, false);
    edge(&mut controller, SignalName::Valid, false);
    edge(&mut controller, SignalName::Compt, false);
    edge(&mut controller, SignalName::Cs0, false);
    assert_eq!(controller.state(), E84State::Idle);
    assert!(controller.snapshot().level(SignalName::HoAvbl));
}

#[test]
fn transition_history_records_the_handshake() {
    let (mut controller, _handle, _observed) = controller_over(RecordingPort::docked_empty());

    edge(&mut controller, SignalName::Cs1, true);
    controller.pump().unwrap();
    edge(&mut controller, SignalName::Valid, true);

    let records: Vec<_> = controller.history().collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].from, E84State::Idle);
    assert_eq!(records[0].to, E84State::Selected);
    assert_eq!(records[1].to, E84State::TransferReady);
    // Each record carries the evidence snapshot.
    assert!(records[1].snapshot.level(SignalName::Valid));
    assert!(records[1].snapshot.level(SignalName::LReq));
}

#[test]
fn back_to_back_handshakes() {
    let (mut controller, handle, _observed) = controller_over(RecordingPort::docked_empty());

    for round in 0..2 {
        // Alternate load and unload against the carrier state.
        let (cs, arriving) = if round == 0 {
            (SignalName::Cs1, true)
        } else {
            (SignalName::Cs0, false)
        };
        edge(&mut controller, cs, true);
        controller.pump().unwrap();
        edge(&mut controller, SignalName::Valid, true);
        assert_eq!(controller.state(), E84State::TransferReady, "round {round}");
        edge(&mut controller, SignalName::TrReq, true);
        edge(&mut controller, SignalName::Busy, true);
        handle.set_sensor(PortSensor::CarrierPresent, arriving);
        controller.pump().unwrap();
        edge(&mut controller, SignalName::Busy, false);
        edge(&mut controller, SignalName::Compt, true);
        edge(&mut controller, SignalName::Valid, false);
        edge(&mut controller, SignalName::Compt, false);
        edge(&mut controller, cs, false);
        edge(&mut controller, SignalName::TrReq, false);
        assert_eq!(controller.state(), E84State::Idle, "round {round}");
        assert!(controller.snapshot().level(SignalName::HoAvbl));
    }
}
