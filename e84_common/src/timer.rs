//! E84 protocol timer identifiers and durations.
//!
//! TP1 through TP5 are the five handshake watchdog windows defined by the
//! standard. Each is a maximum: any shorter transition cancels the timer,
//! and expiry is fatal to the handshake.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── TimerId ────────────────────────────────────────────────────────

/// Protocol timer identifier.
///
/// - TP1: carrier-stage select → VALID
/// - TP2: VALID → TR_REQ
/// - TP3: TR_REQ → BUSY
/// - TP4: BUSY duration
/// - TP5: COMPT → VALID low
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerId {
    Tp1,
    Tp2,
    Tp3,
    Tp4,
    Tp5,
}

impl TimerId {
    /// All timers in protocol order.
    pub const ALL: [TimerId; 5] = [Self::Tp1, Self::Tp2, Self::Tp3, Self::Tp4, Self::Tp5];

    /// Protocol-recommended default duration.
    pub const fn default_duration(self) -> Duration {
        match self {
            Self::Tp1 | Self::Tp2 | Self::Tp5 => Duration::from_secs(2),
            Self::Tp3 | Self::Tp4 => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tp1 => write!(f, "TP1"),
            Self::Tp2 => write!(f, "TP2"),
            Self::Tp3 => write!(f, "TP3"),
            Self::Tp4 => write!(f, "TP4"),
            Self::Tp5 => write!(f, "TP5"),
        }
    }
}

impl FromStr for TimerId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TP1" | "tp1" => Ok(Self::Tp1),
            "TP2" | "tp2" => Ok(Self::Tp2),
            "TP3" | "tp3" => Ok(Self::Tp3),
            "TP4" | "tp4" => Ok(Self::Tp4),
            "TP5" | "tp5" => Ok(Self::Tp5),
            _ => Err(format!("unknown timer: {s:?}")),
        }
    }
}

// ─── TimerConfig ────────────────────────────────────────────────────

/// Timer duration overrides in milliseconds.
///
/// Absent fields fall back to the protocol defaults. Zero is rejected at
/// validation: a zero window would fault every handshake on arrival.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default)]
    pub tp1: Option<u64>,
    #[serde(default)]
    pub tp2: Option<u64>,
    #[serde(default)]
    pub tp3: Option<u64>,
    #[serde(default)]
    pub tp4: Option<u64>,
    #[serde(default)]
    pub tp5: Option<u64>,
}

impl TimerConfig {
    /// Effective duration for a timer, override or default.
    pub fn duration(&self, id: TimerId) -> Duration {
        let override_ms = match id {
            TimerId::Tp1 => self.tp1,
            TimerId::Tp2 => self.tp2,
            TimerId::Tp3 => self.tp3,
            TimerId::Tp4 => self.tp4,
            TimerId::Tp5 => self.tp5,
        };
        override_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| id.default_duration())
    }

    /// Return the first timer configured with a zero duration, if any.
    pub fn zero_override(&self) -> Option<TimerId> {
        TimerId::ALL
            .into_iter()
            .find(|&id| self.duration(id) == Duration::ZERO)
    }
}
