//! E84 signal naming and direction types.
//!
//! The E84 signal set is fixed by the protocol: six handshake inputs driven
//! by the AMHS, five outputs driven by the equipment, and four internal
//! signals mirroring the physical load-port sensors. `SignalName` maps a
//! wire label like `"TR_REQ"` to a typed enum variant.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

// ─── SignalName ─────────────────────────────────────────────────────

/// A named E84 signal.
///
/// Wire labels follow the SEMI E84 convention (`CS_0`, `L_REQ`, …).
/// Internal signals reflect load-port sensor state and never appear on
/// the AMHS interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SignalName {
    // ── Inputs from AMHS ────────────
    Valid,
    Cs0,
    Cs1,
    TrReq,
    Busy,
    Compt,
    Cont,

    // ── Outputs to AMHS ─────────────
    LReq,
    UReq,
    Ready,
    HoAvbl,
    Es,

    // ── Internal port reflections ───
    CarrierPresent,
    Clamped,
    Docked,
    PlacementOk,
}

impl SignalName {
    /// All signals in the fixed E84 set, registration order.
    pub const ALL: [SignalName; 16] = [
        Self::Valid,
        Self::Cs0,
        Self::Cs1,
        Self::TrReq,
        Self::Busy,
        Self::Compt,
        Self::Cont,
        Self::LReq,
        Self::UReq,
        Self::Ready,
        Self::HoAvbl,
        Self::Es,
        Self::CarrierPresent,
        Self::Clamped,
        Self::Docked,
        Self::PlacementOk,
    ];

    /// Handshake inputs driven by the AMHS.
    pub const AMHS_INPUTS: [SignalName; 7] = [
        Self::Valid,
        Self::Cs0,
        Self::Cs1,
        Self::TrReq,
        Self::Busy,
        Self::Compt,
        Self::Cont,
    ];

    /// Outputs driven by the equipment side.
    pub const AMHS_OUTPUTS: [SignalName; 5] = [
        Self::LReq,
        Self::UReq,
        Self::Ready,
        Self::HoAvbl,
        Self::Es,
    ];

    /// Internal signals mirroring load-port sensors.
    pub const PORT_SENSORS: [SignalName; 4] = [
        Self::CarrierPresent,
        Self::Clamped,
        Self::Docked,
        Self::PlacementOk,
    ];

    /// The owning direction for this signal.
    pub const fn direction(self) -> SignalDirection {
        match self {
            Self::Valid
            | Self::Cs0
            | Self::Cs1
            | Self::TrReq
            | Self::Busy
            | Self::Compt
            | Self::Cont => SignalDirection::Input,
            Self::LReq | Self::UReq | Self::Ready | Self::HoAvbl | Self::Es => {
                SignalDirection::Output
            }
            Self::CarrierPresent | Self::Clamped | Self::Docked | Self::PlacementOk => {
                SignalDirection::Internal
            }
        }
    }

    /// Power-on level. `HO_AVBL` and `ES` idle high; everything else low.
    pub const fn default_level(self) -> bool {
        matches!(self, Self::HoAvbl | Self::Es)
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Valid => "VALID",
            Self::Cs0 => "CS_0",
            Self::Cs1 => "CS_1",
            Self::TrReq => "TR_REQ",
            Self::Busy => "BUSY",
            Self::Compt => "COMPT",
            Self::Cont => "CONT",
            Self::LReq => "L_REQ",
            Self::UReq => "U_REQ",
            Self::Ready => "READY",
            Self::HoAvbl => "HO_AVBL",
            Self::Es => "ES",
            Self::CarrierPresent => "CARRIER_PRESENT",
            Self::Clamped => "CLAMPED",
            Self::Docked => "DOCKED",
            Self::PlacementOk => "PLACEMENT_OK",
        };
        f.write_str(s)
    }
}

impl FromStr for SignalName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALID" => Ok(Self::Valid),
            "CS_0" => Ok(Self::Cs0),
            "CS_1" => Ok(Self::Cs1),
            "TR_REQ" => Ok(Self::TrReq),
            "BUSY" => Ok(Self::Busy),
            "COMPT" => Ok(Self::Compt),
            "CONT" => Ok(Self::Cont),
            "L_REQ" => Ok(Self::LReq),
            "U_REQ" => Ok(Self::UReq),
            "READY" => Ok(Self::Ready),
            "HO_AVBL" => Ok(Self::HoAvbl),
            "ES" => Ok(Self::Es),
            "CARRIER_PRESENT" => Ok(Self::CarrierPresent),
            "CLAMPED" => Ok(Self::Clamped),
            "DOCKED" => Ok(Self::Docked),
            "PLACEMENT_OK" => Ok(Self::PlacementOk),
            _ => Err(format!("unknown E84 signal: {s:?}")),
        }
    }
}

impl TryFrom<String> for SignalName {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SignalName> for String {
    fn from(name: SignalName) -> Self {
        name.to_string()
    }
}

// ─── SignalDirection ────────────────────────────────────────────────

/// Who owns a signal's level.
///
/// Outputs are mutated only by the state machine (and the controller
/// facade for `HO_AVBL`/`ES`); inputs only by the transport layer;
/// internal signals only by the load-port coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    /// Driven by the AMHS peer.
    Input,
    /// Driven by this equipment toward the AMHS.
    Output,
    /// Driven by the load-port coordinator.
    Internal,
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

// ─── Polarity ───────────────────────────────────────────────────────

/// Electrical polarity of a physical line.
///
/// The registry always stores logical levels; polarity is applied at the
/// digital transport boundary when a line is read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Logical true = line high.
    ActiveHigh,
    /// Logical true = line low (wire break reads active).
    ActiveLow,
}

impl Default for Polarity {
    fn default() -> Self {
        Self::ActiveHigh
    }
}

impl Polarity {
    /// Convert a raw line level to the logical level.
    #[inline]
    pub const fn decode(self, raw: bool) -> bool {
        match self {
            Self::ActiveHigh => raw,
            Self::ActiveLow => !raw,
        }
    }

    /// Convert a logical level to the raw line level.
    #[inline]
    pub const fn encode(self, logical: bool) -> bool {
        // Symmetric inversion.
        self.decode(logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_display_parse() {
        for name in SignalName::ALL {
            let s = name.to_string();
            let parsed: SignalName = s.parse().unwrap();
            assert_eq!(parsed, name, "roundtrip failed for {s}");
        }
    }

    #[test]
    fn unknown_signal_rejected() {
        assert!("GO_FASTER".parse::<SignalName>().is_err());
        assert!("".parse::<SignalName>().is_err());
    }

    #[test]
    fn directions_partition_the_set() {
        for name in SignalName::AMHS_INPUTS {
            assert_eq!(name.direction(), SignalDirection::Input);
        }
        for name in SignalName::AMHS_OUTPUTS {
            assert_eq!(name.direction(), SignalDirection::Output);
        }
        for name in SignalName::PORT_SENSORS {
            assert_eq!(name.direction(), SignalDirection::Internal);
        }
        assert_eq!(
            SignalName::AMHS_INPUTS.len()
                + SignalName::AMHS_OUTPUTS.len()
                + SignalName::PORT_SENSORS.len(),
            SignalName::ALL.len()
        );
    }

    #[test]
    fn default_levels() {
        assert!(SignalName::HoAvbl.default_level());
        assert!(SignalName::Es.default_level());
        assert!(!SignalName::Valid.default_level());
        assert!(!SignalName::LReq.default_level());
    }

    #[test]
    fn polarity_decode_encode() {
        assert!(Polarity::ActiveHigh.decode(true));
        assert!(!Polarity::ActiveHigh.decode(false));
        assert!(!Polarity::ActiveLow.decode(true));
        assert!(Polarity::ActiveLow.decode(false));
        // encode is the inverse of decode.
        for pol in [Polarity::ActiveHigh, Polarity::ActiveLow] {
            for level in [false, true] {
                assert_eq!(pol.decode(pol.encode(level)), level);
            }
        }
    }
}
