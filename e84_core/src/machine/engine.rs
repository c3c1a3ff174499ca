//! Transition-table interpreter.
//!
//! The machine owns the writer handles for the four handshake outputs,
//! the single armed TP timer, and the latched fault. It never blocks:
//! every entry point reacts to one event and returns. Output levels are
//! functions of state entry, so no output changes without a transition.
//!
//! The registry and coordinator are passed in as collaborators on every
//! call, which keeps the machine testable against fakes.

use std::time::SystemTime;

use tracing::{info, trace, warn};

use e84_common::config::ControllerMode;
use e84_common::signal::{SignalDirection, SignalName};
use e84_common::timer::{TimerConfig, TimerId};

use crate::event::{ControllerEvent, TransitionRecord};
use crate::port::{PortControl, PortFault, PortNotice};
use crate::signal::{SignalChange, SignalError, SignalHandle, SignalRegistry};

use super::state::{E84State, TransferDirection};
use super::table::{expected_rising, GuardCtx, TransitionTable, TriggerKind};
use super::timer::{ArmedTimer, TimerClient};
use super::FaultKind;

// ─── Collaborator context ───────────────────────────────────────────

/// Writer handles for the equipment outputs owned by the machine.
///
/// `ES` stays with the controller facade: dropping it is an operator /
/// safety decision the machine only reacts to.
#[derive(Debug, Clone)]
pub struct OutputHandles {
    pub l_req: SignalHandle,
    pub u_req: SignalHandle,
    pub ready: SignalHandle,
    pub ho_avbl: SignalHandle,
}

/// Collaborators for one machine step.
pub struct MachineCtx<'a> {
    pub registry: &'a mut SignalRegistry,
    pub port: &'a mut dyn PortControl,
    pub emit: &'a mut dyn FnMut(ControllerEvent),
}

// ─── E84Machine ─────────────────────────────────────────────────────

/// The equipment-side E84 handshake machine.
#[derive(Debug)]
pub struct E84Machine {
    state: E84State,
    mode: ControllerMode,
    direction: Option<TransferDirection>,
    table: TransitionTable,
    timers: TimerClient,
    durations: TimerConfig,
    outputs: OutputHandles,
    fault: Option<FaultKind>,
    last_port_fault: Option<PortFault>,
}

impl E84Machine {
    pub fn new(
        table: TransitionTable,
        timers: TimerClient,
        durations: TimerConfig,
        outputs: OutputHandles,
        mode: ControllerMode,
    ) -> Self {
        Self {
            state: E84State::Idle,
            mode,
            direction: None,
            table,
            timers,
            durations,
            outputs,
            fault: None,
            last_port_fault: None,
        }
    }

    #[inline]
    pub fn state(&self) -> E84State {
        self.state
    }

    #[inline]
    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    #[inline]
    pub fn direction(&self) -> Option<TransferDirection> {
        self.direction
    }

    /// The currently armed timer, if any.
    #[inline]
    pub fn armed(&self) -> Option<&ArmedTimer> {
        self.timers.armed()
    }

    /// The latched fault while in an error state.
    #[inline]
    pub fn latched_fault(&self) -> Option<&FaultKind> {
        self.fault.as_ref()
    }

    /// Change mode and re-derive `HO_AVBL`.
    pub fn set_mode(
        &mut self,
        mode: ControllerMode,
        registry: &mut SignalRegistry,
    ) -> Result<(), SignalError> {
        self.mode = mode;
        self.refresh_ho_avbl(registry)
    }

    /// `HO_AVBL` is high exactly while idle, in auto, with no fault.
    fn refresh_ho_avbl(&mut self, registry: &mut SignalRegistry) -> Result<(), SignalError> {
        let level =
            self.state == E84State::Idle && self.mode == ControllerMode::Auto && self.fault.is_none();
        registry.write(&self.outputs.ho_avbl, level)?;
        Ok(())
    }

    // ─── Entry points ───────────────────────────────────────────────

    /// React to a committed signal change.
    pub fn on_signal(
        &mut self,
        change: &SignalChange,
        ctx: &mut MachineCtx<'_>,
    ) -> Result<Option<TransitionRecord>, SignalError> {
        // Emergency wins over everything and bypasses the table.
        if change.name == SignalName::Es && change.falling() && !self.state.is_latched() {
            return self.apply(E84State::EsAsserted, None, "es_drop", ctx);
        }
        self.step(TriggerKind::Signal(change), ctx)
    }

    /// React to a timer expiry. Stale generations are discarded here;
    /// this is the cancellation point the heap never provides.
    pub fn on_timer(
        &mut self,
        id: TimerId,
        generation: u64,
        ctx: &mut MachineCtx<'_>,
    ) -> Result<Option<TransitionRecord>, SignalError> {
        if !self.timers.consume(id, generation) {
            trace!(timer = %id, generation, "stale timer expiry discarded");
            return Ok(None);
        }
        (ctx.emit)(ControllerEvent::TimerFired { timer: id });
        self.step(TriggerKind::Timer(id), ctx)
    }

    /// React to a coordinator notice.
    pub fn on_port(
        &mut self,
        notice: &PortNotice,
        ctx: &mut MachineCtx<'_>,
    ) -> Result<Option<TransitionRecord>, SignalError> {
        match notice {
            PortNotice::PrepareFailed(fault) | PortNotice::Faulted(fault) => {
                self.last_port_fault = Some(fault.clone());
                (ctx.emit)(ControllerEvent::Fault(FaultKind::Port(fault.clone())));
            }
            PortNotice::Prepared => {}
        }
        self.step(TriggerKind::Port(notice), ctx)
    }

    /// Operator reset. Gating (inputs idle, port clean) is the facade's
    /// responsibility; this unconditionally re-enters IDLE.
    pub fn reset(
        &mut self,
        ctx: &mut MachineCtx<'_>,
    ) -> Result<Option<TransitionRecord>, SignalError> {
        self.timers.cancel();
        self.fault = None;
        self.last_port_fault = None;
        self.apply(E84State::Idle, None, "operator_reset", ctx)
    }

    // ─── Table interpretation ───────────────────────────────────────

    fn step(
        &mut self,
        trigger: TriggerKind<'_>,
        ctx: &mut MachineCtx<'_>,
    ) -> Result<Option<TransitionRecord>, SignalError> {
        let prepared = ctx.port.is_prepared();
        let port_ready = ctx.port.handoff_ready();

        let matches = {
            let gctx = GuardCtx {
                store: ctx.registry.store(),
                trigger,
                mode: self.mode,
                prepared,
                port_ready,
            };
            self.table.matching(self.state, &gctx)
        };

        if matches.is_empty() {
            if let TriggerKind::Signal(change) = trigger {
                if change.rising()
                    && change.name.direction() == SignalDirection::Input
                    && !expected_rising(self.state).contains(&change.name)
                {
                    warn!(state = %self.state, signal = %change.name, "unexpected input");
                    (ctx.emit)(ControllerEvent::Diagnostic(FaultKind::UnexpectedInput(
                        change.name,
                    )));
                }
            }
            return Ok(None);
        }

        if matches.len() > 1 {
            // Protocol violation: table order decides, but say so.
            warn!(state = %self.state, rows = matches.len(), "ambiguous guards");
            (ctx.emit)(ControllerEvent::Diagnostic(FaultKind::AmbiguousGuard {
                state: self.state,
            }));
        }

        let row = self.table.row(matches[0]);
        let (to, arms, label) = (row.to, row.arms, row.label);
        self.apply(to, arms, label, ctx)
    }

    fn apply(
        &mut self,
        to: E84State,
        arms: Option<TimerId>,
        label: &'static str,
        ctx: &mut MachineCtx<'_>,
    ) -> Result<Option<TransitionRecord>, SignalError> {
        // Leaving a state releases its timer; stale expirations are
        // discarded by generation on dequeue.
        self.timers.cancel();

        let from = self.state;
        self.state = to;
        self.on_enter(to, ctx)?;
        // HO_AVBL is high exactly in IDLE; every transition re-derives it.
        self.refresh_ho_avbl(ctx.registry)?;

        if let Some(id) = arms {
            let duration = self.durations.duration(id);
            self.timers.arm(id, duration);
            (ctx.emit)(ControllerEvent::TimerArmed {
                timer: id,
                duration,
            });
        }

        let at = SystemTime::now();
        info!(%from, %to, trigger = label, "state change");
        (ctx.emit)(ControllerEvent::StateChanged {
            from,
            to,
            trigger: label,
            at,
        });

        Ok(Some(TransitionRecord {
            at,
            from,
            to,
            trigger: label,
            snapshot: ctx.registry.snapshot(),
        }))
    }

    /// State-entry output assertions and side effects.
    fn on_enter(&mut self, state: E84State, ctx: &mut MachineCtx<'_>) -> Result<(), SignalError> {
        match state {
            E84State::Idle => {
                self.direction = None;
                ctx.port.release();
                self.drop_handshake_outputs(ctx.registry)?;
                self.refresh_ho_avbl(ctx.registry)?;
            }
            E84State::Selected => {
                let cs_0 = ctx.registry.level(SignalName::Cs0);
                let cs_1 = ctx.registry.level(SignalName::Cs1);
                match TransferDirection::from_cs_lines(cs_0, cs_1) {
                    Some(direction) => {
                        self.direction = Some(direction);
                        if let Err(fault) = ctx.port.prepare(direction) {
                            // Stay selected; TP2 will report the stall if
                            // the port never comes around.
                            self.last_port_fault = Some(fault.clone());
                            (ctx.emit)(ControllerEvent::Fault(FaultKind::Port(fault)));
                        }
                    }
                    None => {
                        // The invalid-CS rows take it from here.
                        warn!(cs_0, cs_1, "selection without a decodable direction");
                    }
                }
            }
            E84State::TransferReady => match self.direction {
                Some(direction) => {
                    let (request, other) = match direction {
                        TransferDirection::Load => (&self.outputs.l_req, &self.outputs.u_req),
                        TransferDirection::Unload => (&self.outputs.u_req, &self.outputs.l_req),
                    };
                    ctx.registry.write(request, true)?;
                    ctx.registry.write(other, false)?;
                }
                None => warn!("transfer ready without a latched direction"),
            },
            E84State::ReadyAsserted => {
                ctx.registry.write(&self.outputs.ready, true)?;
            }
            E84State::TransferInProgress => {}
            E84State::TransferComplete => {
                self.drop_handshake_outputs(ctx.registry)?;
            }
            E84State::HandoffComplete => {
                if let Some(direction) = self.direction {
                    ctx.port.handoff_complete(direction);
                }
            }
            E84State::ErrorTp1
            | E84State::ErrorTp2
            | E84State::ErrorTp3
            | E84State::ErrorTp4
            | E84State::ErrorTp5 => {
                let id = match state {
                    E84State::ErrorTp1 => TimerId::Tp1,
                    E84State::ErrorTp2 => TimerId::Tp2,
                    E84State::ErrorTp3 => TimerId::Tp3,
                    E84State::ErrorTp4 => TimerId::Tp4,
                    _ => TimerId::Tp5,
                };
                self.latch_fault(FaultKind::TimerExpired(id), ctx)?;
            }
            E84State::ErrorInvalidCs => {
                self.latch_fault(FaultKind::InvalidCarrierStage, ctx)?;
            }
            E84State::ErrorPort => {
                let fault = self
                    .last_port_fault
                    .take()
                    .unwrap_or(PortFault::PlacementFailure("unreported".to_string()));
                self.latch_fault(FaultKind::Port(fault), ctx)?;
            }
            E84State::EsAsserted => {
                self.fault = Some(FaultKind::EmergencyStop);
                self.drop_handshake_outputs(ctx.registry)?;
                self.refresh_ho_avbl(ctx.registry)?;
                ctx.port.emergency_safe();
                (ctx.emit)(ControllerEvent::Fault(FaultKind::EmergencyStop));
            }
        }
        Ok(())
    }

    fn latch_fault(
        &mut self,
        kind: FaultKind,
        ctx: &mut MachineCtx<'_>,
    ) -> Result<(), SignalError> {
        warn!(fault = %kind, "handshake fault latched");
        self.fault = Some(kind.clone());
        self.drop_handshake_outputs(ctx.registry)?;
        self.refresh_ho_avbl(ctx.registry)?;
        (ctx.emit)(ControllerEvent::Fault(kind));
        Ok(())
    }

    fn drop_handshake_outputs(&self, registry: &mut SignalRegistry) -> Result<(), SignalError> {
        registry.write(&self.outputs.l_req, false)?;
        registry.write(&self.outputs.u_req, false)?;
        registry.write(&self.outputs.ready, false)?;
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
