//! Integration: the ASCII transport variant end to end, against the
//! simulated serial LPT.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use e84_common::config::{
    AsciiConfig, ControllerConfig, ControllerMode, ControllerSection, InterfaceKind, LogLevel,
};
use e84_common::signal::SignalName;
use e84_common::timer::{TimerConfig, TimerId};
use e84_core::port::ascii::AsciiLoadPort;
use e84_core::port::sim::{SimLpt, SimLptState};
use e84_core::{Controller, E84State, Event, LoadPortState};

fn ascii_config() -> AsciiConfig {
    AsciiConfig {
        port: "sim".to_string(),
        baud: 9600,
        reply_timeout_ms: 500,
    }
}

fn test_config(timers: TimerConfig) -> ControllerConfig {
    ControllerConfig {
        controller: ControllerSection {
            interface: InterfaceKind::Ascii,
            mode: ControllerMode::Auto,
            log_level: LogLevel::Info,
        },
        timers,
        digital: None,
        ascii: Some(ascii_config()),
    }
}

fn ascii_controller(timers: TimerConfig) -> (Controller, Arc<Mutex<SimLptState>>) {
    let (transport, state) = SimLpt::shared();
    let port = AsciiLoadPort::with_poll_interval(
        Box::new(transport),
        &ascii_config(),
        Duration::from_millis(25),
    );
    let controller = Controller::new(&test_config(timers), Box::new(port)).expect("controller");
    (controller, state)
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

fn pump_until(
    controller: &mut Controller,
    deadline: Duration,
    mut predicate: impl FnMut(&Controller) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        controller.pump().expect("pump");
        if predicate(controller) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn ascii_load_handshake_end_to_end() {
    let (mut controller, lpt) = ascii_controller(TimerConfig::default());

    // The initial STATUS poll reports the docked, empty port.
    assert!(pump_until(&mut controller, Duration::from_secs(3), |c| {
        c.port_state() == LoadPortState::DockedEmpty
    }));
    controller.start().expect("start");

    edge(&mut controller, SignalName::Cs1, true);
    assert_eq!(controller.state(), E84State::Selected);

    // LOAD is accepted by the LPT; the prepare completion flows back
    // through the worker thread.
    assert!(pump_until(&mut controller, Duration::from_secs(3), |c| {
        c.state() == E84State::Selected && c.armed_timer().map(|a| a.id) == Some(TimerId::Tp1)
    }));
    edge(&mut controller, SignalName::Valid, true);
    assert!(pump_until(&mut controller, Duration::from_secs(3), |c| {
        c.state() == E84State::TransferReady
    }));
    assert!(controller.snapshot().level(SignalName::LReq));

    edge(&mut controller, SignalName::TrReq, true);
    edge(&mut controller, SignalName::Busy, true);
    assert_eq!(controller.state(), E84State::TransferInProgress);

    // The pod lands; STATUS polling picks the sensors up.
    lpt.lock().unwrap().place_pod();
    assert!(pump_until(&mut controller, Duration::from_secs(3), |c| {
        c.snapshot().level(SignalName::CarrierPresent)
    }));

    edge(&mut controller, SignalName::Busy, false);
    edge(&mut controller, SignalName::Compt, true);
    assert_eq!(controller.state(), E84State::TransferComplete);

    edge(&mut controller, SignalName::TrReq, false);
    edge(&mut controller, SignalName::Valid, false);
    edge(&mut controller, SignalName::Compt, false);
    edge(&mut controller, SignalName::Cs1, false);
    assert_eq!(controller.state(), E84State::Idle);
    assert!(controller.snapshot().level(SignalName::HoAvbl));
    assert!(pump_until(&mut controller, Duration::from_secs(3), |c| {
        c.port_state() == LoadPortState::DockedLoaded
    }));
}

#[test]
fn ascii_prepare_fault_holds_selected_until_tp2() {
    let (mut controller, lpt) = ascii_controller(TimerConfig {
        tp2: Some(150),
        ..Default::default()
    });
    assert!(pump_until(&mut controller, Duration::from_secs(3), |c| {
        c.port_state() == LoadPortState::DockedEmpty
    }));
    controller.start().expect("start");

    // The LPT refuses the dock.
    lpt.lock().unwrap().fail_next = Some("DOCK_FAIL");

    edge(&mut controller, SignalName::Cs1, true);
    assert_eq!(controller.state(), E84State::Selected);

    // The prepare failure comes back but must not move the machine.
    thread::sleep(Duration::from_millis(100));
    controller.pump().unwrap();
    assert_eq!(controller.state(), E84State::Selected);

    // VALID arms TP2; with the port never prepared, TP2 latches.
    edge(&mut controller, SignalName::Valid, true);
    assert_eq!(controller.state(), E84State::Selected);
    assert_eq!(controller.armed_timer().map(|a| a.id), Some(TimerId::Tp2));

    assert!(pump_until(&mut controller, Duration::from_secs(3), |c| {
        c.state() == E84State::ErrorTp2
    }));
    assert!(!controller.snapshot().level(SignalName::LReq));
    assert!(!controller.snapshot().level(SignalName::HoAvbl));
}
