//! E84 state and transfer-direction enums.

use core::fmt;

use serde::{Deserialize, Serialize};

use e84_common::signal::SignalName;
use e84_common::timer::TimerId;

// ─── E84State ───────────────────────────────────────────────────────

/// Handshake state, equipment (passive) side.
///
/// `ReadyAsserted` is the post-`TR_REQ` phase of TRANSFER_READY in which
/// the `READY` output is high. Error states and `EsAsserted` latch until
/// operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum E84State {
    Idle,
    Selected,
    TransferReady,
    ReadyAsserted,
    TransferInProgress,
    TransferComplete,
    HandoffComplete,
    ErrorTp1,
    ErrorTp2,
    ErrorTp3,
    ErrorTp4,
    ErrorTp5,
    ErrorInvalidCs,
    ErrorPort,
    EsAsserted,
}

impl E84State {
    /// Latched states: only operator reset leaves them.
    pub const fn is_latched(self) -> bool {
        matches!(
            self,
            Self::ErrorTp1
                | Self::ErrorTp2
                | Self::ErrorTp3
                | Self::ErrorTp4
                | Self::ErrorTp5
                | Self::ErrorInvalidCs
                | Self::ErrorPort
                | Self::EsAsserted
        )
    }

    /// States in which a handshake is underway.
    pub const fn in_handshake(self) -> bool {
        matches!(
            self,
            Self::Selected
                | Self::TransferReady
                | Self::ReadyAsserted
                | Self::TransferInProgress
                | Self::TransferComplete
                | Self::HandoffComplete
        )
    }

    /// States in which the physical transfer arm may be over the port.
    pub const fn in_transfer(self) -> bool {
        matches!(
            self,
            Self::TransferReady | Self::ReadyAsserted | Self::TransferInProgress
        )
    }

    /// The error state latched when a given timer expires.
    pub const fn error_for_timer(id: TimerId) -> Self {
        match id {
            TimerId::Tp1 => Self::ErrorTp1,
            TimerId::Tp2 => Self::ErrorTp2,
            TimerId::Tp3 => Self::ErrorTp3,
            TimerId::Tp4 => Self::ErrorTp4,
            TimerId::Tp5 => Self::ErrorTp5,
        }
    }
}

impl fmt::Display for E84State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Selected => "SELECTED",
            Self::TransferReady => "TRANSFER_READY",
            Self::ReadyAsserted => "READY_ASSERTED",
            Self::TransferInProgress => "TRANSFER_IN_PROGRESS",
            Self::TransferComplete => "TRANSFER_COMPLETE",
            Self::HandoffComplete => "HANDOFF_COMPLETE",
            Self::ErrorTp1 => "ERROR_TP1",
            Self::ErrorTp2 => "ERROR_TP2",
            Self::ErrorTp3 => "ERROR_TP3",
            Self::ErrorTp4 => "ERROR_TP4",
            Self::ErrorTp5 => "ERROR_TP5",
            Self::ErrorInvalidCs => "ERROR_INVALID_CS",
            Self::ErrorPort => "ERROR_PORT",
            Self::EsAsserted => "ES_ASSERTED",
        };
        f.write_str(s)
    }
}

// ─── TransferDirection ──────────────────────────────────────────────

/// Which way the carrier moves, decided by the CS lines at selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// AMHS delivers a carrier to the port (`CS_1`).
    Load,
    /// AMHS picks the carrier up from the port (`CS_0`).
    Unload,
}

impl TransferDirection {
    /// The equipment request output asserted for this direction.
    pub const fn request_signal(self) -> SignalName {
        match self {
            Self::Load => SignalName::LReq,
            Self::Unload => SignalName::UReq,
        }
    }

    /// Decode the CS lines. Exactly one must be high.
    pub fn from_cs_lines(cs_0: bool, cs_1: bool) -> Option<Self> {
        match (cs_0, cs_1) {
            (false, true) => Some(Self::Load),
            (true, false) => Some(Self::Unload),
            _ => None,
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Unload => write!(f, "unload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latched_states() {
        assert!(!E84State::Idle.is_latched());
        assert!(!E84State::TransferInProgress.is_latched());
        assert!(E84State::ErrorTp3.is_latched());
        assert!(E84State::ErrorInvalidCs.is_latched());
        assert!(E84State::EsAsserted.is_latched());
    }

    #[test]
    fn timer_error_mapping() {
        assert_eq!(E84State::error_for_timer(TimerId::Tp1), E84State::ErrorTp1);
        assert_eq!(E84State::error_for_timer(TimerId::Tp5), E84State::ErrorTp5);
    }

    #[test]
    fn direction_from_cs_lines() {
        assert_eq!(
            TransferDirection::from_cs_lines(false, true),
            Some(TransferDirection::Load)
        );
        assert_eq!(
            TransferDirection::from_cs_lines(true, false),
            Some(TransferDirection::Unload)
        );
        assert_eq!(TransferDirection::from_cs_lines(true, true), None);
        assert_eq!(TransferDirection::from_cs_lines(false, false), None);
    }

    #[test]
    fn request_signals() {
        assert_eq!(
            TransferDirection::Load.request_signal(),
            SignalName::LReq
        );
        assert_eq!(
            TransferDirection::Unload.request_signal(),
            SignalName::UReq
        );
    }
}
