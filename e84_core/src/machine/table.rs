//! Declarative E84 transition table.
//!
//! Encoded as data rather than a state `match` so the machine can be
//! replayed against recorded signal traces and audited row by row.
//! Guards are small named predicates over the registry store plus the
//! triggering event; a row fires when all of its guards hold. Rows for
//! one state are written mutually exclusive, so more than one match is
//! a genuine protocol violation (reported as an ambiguous-guard
//! diagnostic; the first row in table order still wins).

use e84_common::config::ControllerMode;
use e84_common::signal::SignalName;
use e84_common::timer::TimerId;

use crate::port::PortNotice;
use crate::signal::{SignalChange, SignalStore};

use super::state::E84State;

// ─── Trigger and context ────────────────────────────────────────────

/// The event a guard evaluation is reacting to.
#[derive(Debug, Clone, Copy)]
pub enum TriggerKind<'a> {
    Signal(&'a SignalChange),
    Timer(TimerId),
    Port(&'a PortNotice),
}

/// Everything a guard may consult.
pub struct GuardCtx<'a> {
    pub store: &'a SignalStore,
    pub trigger: TriggerKind<'a>,
    pub mode: ControllerMode,
    /// Coordinator finished preparing for the pending transfer.
    pub prepared: bool,
    /// Coordinator reports the port docked, fault-free and still.
    pub port_ready: bool,
}

impl GuardCtx<'_> {
    fn change(&self) -> Option<&SignalChange> {
        match self.trigger {
            TriggerKind::Signal(change) => Some(change),
            _ => None,
        }
    }

    fn rising(&self, name: SignalName) -> bool {
        self.change()
            .is_some_and(|c| c.name == name && c.rising())
    }

    fn falling(&self, name: SignalName) -> bool {
        self.change()
            .is_some_and(|c| c.name == name && c.falling())
    }
}

// ─── Guards ─────────────────────────────────────────────────────────

/// Named guard predicate. A row fires when all of its guards hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Either carrier-stage line rose.
    CsRising,
    /// Both CS lines are high (protocol violation).
    BothCsHigh,
    /// At least one CS line is high.
    AnyCsHigh,
    /// Both CS lines are low.
    CsAllLow,
    ValidRising,
    ValidHigh,
    ValidLow,
    ValidFalling,
    TrReqRising,
    BusyRising,
    BusyLow,
    ComptHigh,
    /// TR_REQ, BUSY, COMPT and CONT are all low.
    HandshakeQuiet,
    ModeAuto,
    PortHandoffReady,
    PortPrepared,
    PortNotPrepared,
    /// Trigger is the coordinator's prepare completion.
    PrepareCompleted,
    /// Trigger is a port fault or prepare failure.
    PortFaulted,
    /// Trigger is the expiry of the given timer.
    TimerExpired(TimerId),
}

impl Guard {
    pub fn eval(self, ctx: &GuardCtx<'_>) -> bool {
        let store = ctx.store;
        match self {
            Self::CsRising => ctx.rising(SignalName::Cs0) || ctx.rising(SignalName::Cs1),
            Self::BothCsHigh => store.level(SignalName::Cs0) && store.level(SignalName::Cs1),
            Self::AnyCsHigh => store.level(SignalName::Cs0) || store.level(SignalName::Cs1),
            Self::CsAllLow => !store.level(SignalName::Cs0) && !store.level(SignalName::Cs1),
            Self::ValidRising => ctx.rising(SignalName::Valid),
            Self::ValidHigh => store.level(SignalName::Valid),
            Self::ValidLow => !store.level(SignalName::Valid),
            Self::ValidFalling => ctx.falling(SignalName::Valid),
            Self::TrReqRising => ctx.rising(SignalName::TrReq),
            Self::BusyRising => ctx.rising(SignalName::Busy),
            Self::BusyLow => !store.level(SignalName::Busy),
            Self::ComptHigh => store.level(SignalName::Compt),
            Self::HandshakeQuiet => {
                !store.level(SignalName::TrReq)
                    && !store.level(SignalName::Busy)
                    && !store.level(SignalName::Compt)
                    && !store.level(SignalName::Cont)
            }
            Self::ModeAuto => ctx.mode == ControllerMode::Auto,
            Self::PortHandoffReady => ctx.port_ready,
            Self::PortPrepared => ctx.prepared,
            Self::PortNotPrepared => !ctx.prepared,
            Self::PrepareCompleted => {
                matches!(ctx.trigger, TriggerKind::Port(PortNotice::Prepared))
            }
            Self::PortFaulted => matches!(
                ctx.trigger,
                TriggerKind::Port(PortNotice::PrepareFailed(_) | PortNotice::Faulted(_))
            ),
            Self::TimerExpired(id) => matches!(ctx.trigger, TriggerKind::Timer(t) if t == id),
        }
    }
}

// ─── Transition rows ────────────────────────────────────────────────

/// One transition row. Output assertions live in the machine's
/// state-entry function, so a row only names where to go and which
/// timer to arm.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: E84State,
    /// Stable label recorded in transition history and logs.
    pub label: &'static str,
    pub guards: Vec<Guard>,
    pub to: E84State,
    /// Timer armed on entry. `None` leaves no timer armed.
    pub arms: Option<TimerId>,
}

impl Transition {
    pub fn fires(&self, ctx: &GuardCtx<'_>) -> bool {
        self.guards.iter().all(|g| g.eval(ctx))
    }
}

/// The canonical E84 transition table, immutable after construction.
#[derive(Debug)]
pub struct TransitionTable {
    rows: Vec<Transition>,
}

impl TransitionTable {
    /// The standard equipment-side handshake table.
    pub fn standard() -> Self {
        use E84State::*;
        use Guard::*;

        let row = |from, label, guards: Vec<Guard>, to, arms| Transition {
            from,
            label,
            guards,
            to,
            arms,
        };

        let rows = vec![
            // ── IDLE ────────────────────────────────────────────────
            row(
                Idle,
                "cs_select",
                vec![CsRising, ModeAuto, PortHandoffReady, HandshakeQuiet],
                Selected,
                Some(TimerId::Tp1),
            ),
            // ── SELECTED ────────────────────────────────────────────
            row(
                Selected,
                "both_cs_high",
                vec![BothCsHigh],
                ErrorInvalidCs,
                None,
            ),
            row(
                Selected,
                "valid_without_cs",
                vec![ValidRising, CsAllLow],
                ErrorInvalidCs,
                None,
            ),
            row(
                Selected,
                "valid_port_ready",
                vec![ValidRising, AnyCsHigh, PortPrepared],
                TransferReady,
                Some(TimerId::Tp2),
            ),
            row(
                Selected,
                "valid_awaiting_port",
                vec![ValidRising, AnyCsHigh, PortNotPrepared],
                Selected,
                Some(TimerId::Tp2),
            ),
            row(
                Selected,
                "port_prepared",
                vec![PrepareCompleted, ValidHigh],
                TransferReady,
                Some(TimerId::Tp2),
            ),
            row(
                Selected,
                "selection_abandoned",
                vec![CsAllLow, ValidLow],
                Idle,
                None,
            ),
            row(
                Selected,
                "tp1_expired",
                vec![TimerExpired(TimerId::Tp1)],
                ErrorTp1,
                None,
            ),
            row(
                Selected,
                "tp2_expired",
                vec![TimerExpired(TimerId::Tp2)],
                ErrorTp2,
                None,
            ),
            // ── TRANSFER_READY ──────────────────────────────────────
            row(
                TransferReady,
                "tr_req",
                vec![TrReqRising],
                ReadyAsserted,
                Some(TimerId::Tp3),
            ),
            row(
                TransferReady,
                "tp2_expired",
                vec![TimerExpired(TimerId::Tp2)],
                ErrorTp2,
                None,
            ),
            row(
                TransferReady,
                "port_fault",
                vec![PortFaulted],
                ErrorPort,
                None,
            ),
            // ── READY_ASSERTED ──────────────────────────────────────
            row(
                ReadyAsserted,
                "busy",
                vec![BusyRising],
                TransferInProgress,
                Some(TimerId::Tp4),
            ),
            row(
                ReadyAsserted,
                "tp3_expired",
                vec![TimerExpired(TimerId::Tp3)],
                ErrorTp3,
                None,
            ),
            row(
                ReadyAsserted,
                "port_fault",
                vec![PortFaulted],
                ErrorPort,
                None,
            ),
            // ── TRANSFER_IN_PROGRESS ────────────────────────────────
            row(
                TransferInProgress,
                "transfer_done",
                vec![BusyLow, ComptHigh],
                TransferComplete,
                Some(TimerId::Tp5),
            ),
            row(
                TransferInProgress,
                "tp4_expired",
                vec![TimerExpired(TimerId::Tp4)],
                ErrorTp4,
                None,
            ),
            row(
                TransferInProgress,
                "port_fault",
                vec![PortFaulted],
                ErrorPort,
                None,
            ),
            // ── TRANSFER_COMPLETE ───────────────────────────────────
            row(
                TransferComplete,
                "valid_off",
                vec![ValidFalling],
                HandoffComplete,
                None,
            ),
            row(
                TransferComplete,
                "tp5_expired",
                vec![TimerExpired(TimerId::Tp5)],
                ErrorTp5,
                None,
            ),
            // ── HANDOFF_COMPLETE ────────────────────────────────────
            row(
                HandoffComplete,
                "cs_released",
                vec![CsAllLow],
                Idle,
                None,
            ),
        ];

        Self { rows }
    }

    /// All rows leaving a state, table order.
    pub fn rows_for(&self, state: E84State) -> impl Iterator<Item = &Transition> {
        self.rows.iter().filter(move |t| t.from == state)
    }

    /// Indices of every row satisfiable for `state` under `ctx`,
    /// table order.
    pub fn matching(&self, state: E84State, ctx: &GuardCtx<'_>) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, t)| t.from == state && t.fires(ctx))
            .map(|(i, _)| i)
            .collect()
    }

    #[inline]
    pub fn row(&self, idx: usize) -> &Transition {
        &self.rows[idx]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Structural sanity checks, run once at startup.
    ///
    /// - no row leaves a latched state (only operator reset does);
    /// - a row that arms a timer lands in a handshake state;
    /// - timer-expiry rows land in the matching error state.
    pub fn validate(&self) -> Result<(), String> {
        for t in &self.rows {
            if t.from.is_latched() {
                return Err(format!("row '{}' leaves latched state {}", t.label, t.from));
            }
            if t.arms.is_some() && !t.to.in_handshake() {
                return Err(format!("row '{}' arms a timer entering {}", t.label, t.to));
            }
            for guard in &t.guards {
                if let Guard::TimerExpired(id) = guard {
                    if t.to != E84State::error_for_timer(*id) {
                        return Err(format!(
                            "row '{}' routes {} expiry to {}",
                            t.label, id, t.to
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// AMHS inputs whose rising edge is legitimate in a given state.
/// Anything else rising is reported as an unexpected-input diagnostic.
pub fn expected_rising(state: E84State) -> &'static [SignalName] {
    use SignalName::*;
    match state {
        E84State::Idle => &[Cs0, Cs1],
        E84State::Selected => &[Cs0, Cs1, Valid],
        E84State::TransferReady => &[TrReq],
        E84State::ReadyAsserted => &[Busy],
        E84State::TransferInProgress => &[Busy, Compt],
        _ => &[],
    }
}
