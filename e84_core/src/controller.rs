//! Controller facade.
//!
//! Owns the registry, machine, coordinator and timer service; drains
//! the event queue on one thread. Exposes mode and lifecycle control,
//! gated operator reset, and observer registration for the operator
//! surface: event stream, transition history ring, signal snapshots,
//! armed-timer introspection.

use std::collections::VecDeque;
use std::time::SystemTime;

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{error, info, warn};

use e84_common::config::{ControllerConfig, ControllerMode};
use e84_common::signal::{Polarity, SignalName};

use crate::event::{event_queue, ControllerEvent, Event, OperatorCommand, TransitionRecord};
use crate::machine::engine::OutputHandles;
use crate::machine::state::E84State;
use crate::machine::timer::{ArmedTimer, TimerService};
use crate::machine::{E84Machine, MachineCtx, TransitionTable};
use crate::port::coordinator::{LoadPortCoordinator, SensorHandles};
use crate::port::digital::DigitalBridge;
use crate::port::{LoadPort, LoadPortState, PortFault};
use crate::signal::{SignalChange, SignalError, SignalHandle, SignalRegistry, SignalSnapshot};

/// Transitions kept in the history ring for the operator surface.
pub const HISTORY_DEPTH: usize = 32;

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    /// Start gates not met (mode, port readiness, ES).
    #[error("start refused: {0}")]
    StartRefused(String),

    /// Reset gates not met (AMHS inputs active or port unclean).
    #[error("reset not permitted: {0}")]
    ResetNotPermitted(String),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Port(#[from] PortFault),
}

/// Outcome of processing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

// ─── Controller ─────────────────────────────────────────────────────

/// The E84 controller: lifecycle, mode, error surfacing.
pub struct Controller {
    registry: SignalRegistry,
    machine: E84Machine,
    coordinator: LoadPortCoordinator,
    es: SignalHandle,
    observers: Vec<Sender<ControllerEvent>>,
    history: VecDeque<TransitionRecord>,
    signal_feed: Receiver<SignalChange>,
    queue_tx: Sender<Event>,
    queue_rx: Receiver<Event>,
    started: bool,
    // Owns the thread; dropped (and joined) with the controller.
    _timers: TimerService,
}

impl Controller {
    /// Build a controller over a load-port transport variant.
    ///
    /// Registers the fixed E84 signal set, wires the observer feed,
    /// spawns the timer service and connects the port. The machine
    /// starts in IDLE; call [`Controller::start`] before [`run`].
    ///
    /// [`run`]: Controller::run
    pub fn new(
        config: &ControllerConfig,
        port: Box<dyn LoadPort>,
    ) -> Result<Self, ControllerError> {
        let (queue_tx, queue_rx) = event_queue();

        let mut registry = SignalRegistry::new();
        let mut handles = Vec::with_capacity(SignalName::ALL.len());
        for name in SignalName::ALL {
            let polarity = config
                .digital
                .as_ref()
                .and_then(|d| d.mapping_for(name))
                .map(|m| m.polarity)
                .unwrap_or(Polarity::ActiveHigh);
            handles.push(registry.register(name, name.direction(), polarity)?);
        }
        let take = |name: SignalName| -> SignalHandle {
            handles
                .iter()
                .find(|h| h.name() == name)
                .expect("fixed signal set")
                .clone()
        };

        // Observer feed: every committed change, outputs included.
        let (feed_tx, signal_feed) = crossbeam::channel::unbounded();
        for name in SignalName::ALL {
            let feed = feed_tx.clone();
            registry.subscribe(
                name,
                Box::new(move |change, _, _| {
                    let _ = feed.send(change.clone());
                }),
            );
        }

        let table = TransitionTable::standard();
        table
            .validate()
            .map_err(ControllerError::StartRefused)?;

        let timers = TimerService::spawn(queue_tx.clone());
        let mut machine = E84Machine::new(
            table,
            timers.client(),
            config.timers.clone(),
            OutputHandles {
                l_req: take(SignalName::LReq),
                u_req: take(SignalName::UReq),
                ready: take(SignalName::Ready),
                ho_avbl: take(SignalName::HoAvbl),
            },
            config.controller.mode,
        );
        machine.set_mode(config.controller.mode, &mut registry)?;

        let mut coordinator = LoadPortCoordinator::new(
            port,
            SensorHandles {
                carrier_present: take(SignalName::CarrierPresent),
                clamped: take(SignalName::Clamped),
                docked: take(SignalName::Docked),
                placement_ok: take(SignalName::PlacementOk),
            },
        );
        coordinator.connect(queue_tx.clone(), &mut registry)?;

        info!(
            interface = %config.controller.interface,
            mode = %config.controller.mode,
            "controller assembled"
        );

        Ok(Self {
            registry,
            machine,
            coordinator,
            es: take(SignalName::Es),
            observers: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_DEPTH),
            signal_feed,
            queue_tx,
            queue_rx,
            started: false,
            _timers: timers,
        })
    }

    // ─── Introspection ──────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> E84State {
        self.machine.state()
    }

    #[inline]
    pub fn mode(&self) -> ControllerMode {
        self.machine.mode()
    }

    #[inline]
    pub fn port_state(&self) -> LoadPortState {
        self.coordinator.state()
    }

    /// Currently armed TP timer, if any.
    #[inline]
    pub fn armed_timer(&self) -> Option<ArmedTimer> {
        self.machine.armed().copied()
    }

    /// Consistent signal snapshot for diagnostics.
    pub fn snapshot(&self) -> SignalSnapshot {
        self.registry.snapshot()
    }

    /// The last transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Producer handle for transports, timers and the operator surface.
    pub fn sender(&self) -> Sender<Event> {
        self.queue_tx.clone()
    }

    /// Register an observer channel for the controller event stream.
    pub fn subscribe_events(&mut self, observer: Sender<ControllerEvent>) {
        self.observers.push(observer);
    }

    /// Wire a digital AMHS bridge: input edges flow into the queue,
    /// output changes are driven onto their lines.
    pub fn attach_digital_bridge(&mut self, bridge: &DigitalBridge) -> Result<(), ControllerError> {
        bridge.connect(self.sender()).map_err(PortFault::from)?;
        bridge.attach_outputs(&mut self.registry);
        bridge.sync_outputs(&self.registry).map_err(PortFault::from)?;
        Ok(())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Verify the start gates: AUTO mode, a ready port, ES de-asserted.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        // Absorb transport reports already queued (initial sensor
        // levels) so the gates judge current state.
        self.pump()?;
        if self.machine.mode() != ControllerMode::Auto {
            return Err(ControllerError::StartRefused(format!(
                "mode is {}, not auto",
                self.machine.mode()
            )));
        }
        if !self.registry.level(SignalName::Es) {
            return Err(ControllerError::StartRefused("ES asserted".to_string()));
        }
        if !matches!(
            self.coordinator.state(),
            LoadPortState::DockedEmpty | LoadPortState::DockedLoaded
        ) {
            return Err(ControllerError::StartRefused(format!(
                "load port not ready: {}",
                self.coordinator.state()
            )));
        }
        self.started = true;
        info!("controller started");
        Ok(())
    }

    /// Drain the queue until shutdown. Recoverable errors are logged
    /// and surfaced as events; the loop keeps running.
    pub fn run(&mut self) -> Result<(), ControllerError> {
        if !self.started {
            return Err(ControllerError::StartRefused(
                "run() before start()".to_string(),
            ));
        }
        loop {
            let event = match self.queue_rx.recv() {
                Ok(event) => event,
                Err(_) => return Ok(()), // all producers gone
            };
            match self.handle(event) {
                Ok(Flow::Shutdown) => {
                    self.coordinator.shutdown();
                    info!("controller stopped");
                    return Ok(());
                }
                Ok(Flow::Continue) => {}
                Err(e) => {
                    error!(error = %e, "event dispatch error");
                }
            }
        }
    }

    /// Process every event already queued. Test and embedding hook.
    pub fn pump(&mut self) -> Result<Flow, ControllerError> {
        while let Ok(event) = self.queue_rx.try_recv() {
            if self.handle(event)? == Flow::Shutdown {
                return Ok(Flow::Shutdown);
            }
        }
        Ok(Flow::Continue)
    }

    /// Process one event.
    pub fn handle(&mut self, event: Event) -> Result<Flow, ControllerError> {
        match event {
            Event::Shutdown => return Ok(Flow::Shutdown),
            Event::SignalEdge { name, level, at } => {
                let changed = self.registry.apply_input(name, level, at)?;
                if changed {
                    let change = SignalChange {
                        name,
                        old: !level,
                        new: level,
                        at,
                    };
                    self.machine_signal(&change)?;
                }
            }
            Event::TimerFired { timer, generation } => {
                let record = {
                    let Self {
                        registry,
                        machine,
                        coordinator,
                        observers,
                        history: _,
                        ..
                    } = self;
                    let mut emit = |e: ControllerEvent| Self::fan_out(observers, e);
                    let mut ctx = MachineCtx {
                        registry,
                        port: coordinator,
                        emit: &mut emit,
                    };
                    machine.on_timer(timer, generation, &mut ctx)?
                };
                self.finish_step(record);
            }
            Event::Port(port_event) => {
                let notice = self
                    .coordinator
                    .handle_event(port_event, &mut self.registry)?;
                if let Some(notice) = notice {
                    let record = {
                        let Self {
                            registry,
                            machine,
                            coordinator,
                            observers,
                            ..
                        } = self;
                        let mut emit = |e: ControllerEvent| Self::fan_out(observers, e);
                        let mut ctx = MachineCtx {
                            registry,
                            port: coordinator,
                            emit: &mut emit,
                        };
                        machine.on_port(&notice, &mut ctx)?
                    };
                    self.finish_step(record);
                }
            }
            Event::Operator(command) => self.operator(command)?,
        }
        self.drain_signal_feed();
        Ok(Flow::Continue)
    }

    // ─── Operator surface ───────────────────────────────────────────

    fn operator(&mut self, command: OperatorCommand) -> Result<(), ControllerError> {
        match command {
            OperatorCommand::Reset => match self.reset() {
                Ok(()) => {}
                Err(ControllerError::ResetNotPermitted(reason)) => {
                    warn!(%reason, "operator reset rejected");
                }
                Err(e) => return Err(e),
            },
            OperatorCommand::SetMode(mode) => self.set_mode(mode)?,
            OperatorCommand::RequestStop => self.request_stop()?,
        }
        Ok(())
    }

    /// Change mode. Only AUTO lets the machine assert `HO_AVBL`.
    pub fn set_mode(&mut self, mode: ControllerMode) -> Result<(), ControllerError> {
        self.machine.set_mode(mode, &mut self.registry)?;
        Self::fan_out(&mut self.observers, ControllerEvent::ModeChanged(mode));
        info!(%mode, "mode changed");
        self.drain_signal_feed();
        Ok(())
    }

    /// Drop ES: outputs are forced safe and the machine latches.
    pub fn request_stop(&mut self) -> Result<(), ControllerError> {
        let changed = self.registry.write(&self.es.clone(), false)?;
        if changed {
            let change = SignalChange {
                name: SignalName::Es,
                old: true,
                new: false,
                at: SystemTime::now(),
            };
            self.machine_signal(&change)?;
        }
        self.drain_signal_feed();
        Ok(())
    }

    /// Operator reset.
    ///
    /// A reset in IDLE with no latched fault is an idempotent no-op and
    /// emits nothing. Otherwise it is accepted only with every AMHS
    /// input low and a clean port, per the standard.
    pub fn reset(&mut self) -> Result<(), ControllerError> {
        if self.machine.state() == E84State::Idle && self.machine.latched_fault().is_none() {
            return Ok(());
        }

        let active: Vec<SignalName> = SignalName::AMHS_INPUTS
            .into_iter()
            .filter(|&name| self.registry.level(name))
            .collect();
        if !active.is_empty() {
            let names: Vec<String> = active.iter().map(|n| n.to_string()).collect();
            return Err(ControllerError::ResetNotPermitted(format!(
                "AMHS inputs active: {}",
                names.join(", ")
            )));
        }
        if !self.coordinator.clean_for_reset() {
            return Err(ControllerError::ResetNotPermitted(
                "load port not clean".to_string(),
            ));
        }

        // Restore ES before re-entering IDLE.
        self.registry.write(&self.es.clone(), true)?;
        self.coordinator.reset(&mut self.registry)?;

        let record = {
            let Self {
                registry,
                machine,
                coordinator,
                observers,
                ..
            } = self;
            let mut emit = |e: ControllerEvent| Self::fan_out(observers, e);
            let mut ctx = MachineCtx {
                registry,
                port: coordinator,
                emit: &mut emit,
            };
            machine.reset(&mut ctx)?
        };
        self.finish_step(record);
        self.drain_signal_feed();
        info!("operator reset accepted");
        Ok(())
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn machine_signal(&mut self, change: &SignalChange) -> Result<(), ControllerError> {
        let record = {
            let Self {
                registry,
                machine,
                coordinator,
                observers,
                ..
            } = self;
            let mut emit = |e: ControllerEvent| Self::fan_out(observers, e);
            let mut ctx = MachineCtx {
                registry,
                port: coordinator,
                emit: &mut emit,
            };
            machine.on_signal(change, &mut ctx)?
        };
        self.finish_step(record);
        Ok(())
    }

    fn finish_step(&mut self, record: Option<TransitionRecord>) {
        if let Some(record) = record {
            if self.history.len() == HISTORY_DEPTH {
                self.history.pop_front();
            }
            self.history.push_back(record);
        }
    }

    /// Forward queued signal changes to the observers, dropping
    /// disconnected ones.
    fn drain_signal_feed(&mut self) {
        while let Ok(change) = self.signal_feed.try_recv() {
            Self::fan_out(
                &mut self.observers,
                ControllerEvent::SignalChanged {
                    name: change.name,
                    level: change.new,
                    at: change.at,
                },
            );
        }
    }

    fn fan_out(observers: &mut Vec<Sender<ControllerEvent>>, event: ControllerEvent) {
        observers.retain(|observer| observer.send(event.clone()).is_ok());
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}
