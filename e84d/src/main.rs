//! # E84 Controller Daemon
//!
//! Loads configuration, wires the selected load-port transport variant
//! to the controller core, and runs the dispatch loop until Ctrl-C.
//!
//! Hardware drivers live out of tree; `--simulate` runs against the
//! in-memory I/O stack so the full controller can be exercised without
//! a card rack or a serial LPT.

use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use e84_common::config::{ControllerConfig, InterfaceKind};
use e84_core::port::ascii::AsciiLoadPort;
use e84_core::port::digital::{DigitalBridge, DigitalLoadPort, SharedIo};
use e84_core::port::sim::{LoopbackIo, SimLpt};
use e84_core::port::PortSensor;
use e84_core::{Controller, Event, LoadPort};

#[derive(Debug, Parser)]
#[command(name = "e84d", about = "SEMI E84 load-port handshake controller")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/e84.toml")]
    config: PathBuf,

    /// Run against simulated transports instead of real hardware.
    #[arg(long)]
    simulate: bool,
}

fn init_tracing(config: &ControllerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.controller.log_level.as_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build the transport variant selected by the configuration.
fn build_port(
    config: &ControllerConfig,
    simulate: bool,
) -> Result<(Box<dyn LoadPort>, Option<DigitalBridge>), String> {
    match config.controller.interface {
        InterfaceKind::Digital => {
            if !simulate {
                return Err(
                    "no digital I/O driver linked; run with --simulate or supply one".to_string(),
                );
            }
            let digital = config.digital.as_ref().expect("validated config");
            let raw = Arc::new(Mutex::new(LoopbackIo::new()));
            {
                // Simulated rack boots docked and empty.
                let mut io = raw.lock().expect("fresh lock");
                for mapping in &digital.mapping {
                    if let Some(sensor) = PortSensor::from_signal(mapping.signal) {
                        let level = sensor == PortSensor::Docked;
                        io.set_line(mapping.address(), mapping.polarity.encode(level));
                    }
                }
            }
            let io: SharedIo = raw.clone();
            let bridge = DigitalBridge::new(Arc::clone(&io), digital);
            let port = DigitalLoadPort::new(io, digital).map_err(|e| e.to_string())?;
            Ok((Box::new(port), Some(bridge)))
        }
        InterfaceKind::Ascii => {
            if !simulate {
                return Err(
                    "no serial driver linked; run with --simulate or supply one".to_string(),
                );
            }
            let ascii = config.ascii.as_ref().expect("validated config");
            let (transport, _state) = SimLpt::shared();
            let port = AsciiLoadPort::new(Box::new(transport), ascii);
            Ok((Box::new(port), None))
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match ControllerConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            process::exit(1);
        }
    };
    init_tracing(&config);
    info!(config = %args.config.display(), interface = %config.controller.interface, "e84d starting");

    let (port, bridge) = match build_port(&config, args.simulate) {
        Ok(built) => built,
        Err(reason) => {
            error!(%reason, "transport setup failed");
            process::exit(1);
        }
    };

    let mut controller = match Controller::new(&config, port) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "controller assembly failed");
            process::exit(1);
        }
    };
    if let Some(bridge) = &bridge {
        if let Err(e) = controller.attach_digital_bridge(bridge) {
            error!(error = %e, "digital bridge wiring failed");
            process::exit(1);
        }
    }
    // Transport workers report the initial port state asynchronously;
    // give them a moment before giving up on the start gates.
    let mut started = false;
    for attempt in 0..10 {
        match controller.start() {
            Ok(()) => {
                started = true;
                break;
            }
            Err(e) if attempt == 9 => error!(error = %e, "start refused"),
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(100)),
        }
    }
    if !started {
        process::exit(1);
    }

    let shutdown = controller.sender();
    let dispatch = std::thread::Builder::new()
        .name("e84-dispatch".to_string())
        .spawn(move || controller.run())
        .expect("failed to spawn dispatch thread");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    info!("shutting down");
    let _ = shutdown.send(Event::Shutdown);
    match dispatch.join() {
        Ok(Ok(())) => info!("dispatch loop exited cleanly"),
        Ok(Err(e)) => error!(error = %e, "dispatch loop error"),
        Err(_) => error!("dispatch thread panicked"),
    }
}
