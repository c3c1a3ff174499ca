//! Controller configuration structs and validation.
//!
//! Deserialized from a TOML file at startup. Configuration errors are
//! fatal: the controller refuses to start with a partial or inconsistent
//! signal mapping.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signal::{Polarity, SignalName};
use crate::timer::{TimerConfig, TimerId};

// ─── Errors ─────────────────────────────────────────────────────────

/// Configuration loading and validation errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the given path.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Two mapping entries share the same (card, port, bit) line.
    #[error("duplicate line (card {card}, port {port}, bit {bit}) mapped to '{first}' and '{second}'")]
    DuplicateLine {
        card: u8,
        port: u8,
        bit: u8,
        first: SignalName,
        second: SignalName,
    },

    /// A signal is mapped more than once.
    #[error("signal '{0}' mapped more than once")]
    DuplicateSignal(SignalName),

    /// A required signal has no line mapping.
    #[error("signal '{0}' has no line mapping")]
    UnmappedSignal(SignalName),

    /// A timer override is zero.
    #[error("timer {0} configured with zero duration")]
    InvalidTimerValue(TimerId),

    /// Bit index outside the 8-bit port.
    #[error("signal '{signal}' mapped to bit {bit}, ports are 8 bits wide")]
    BitOutOfRange { signal: SignalName, bit: u8 },

    /// Section required by the selected interface is missing.
    #[error("interface '{interface}' selected but [{section}] section is missing")]
    MissingSection {
        interface: InterfaceKind,
        section: &'static str,
    },
}

// ─── Enumerations ───────────────────────────────────────────────────

/// Logging verbosity, lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string accepted by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Controller operating mode.
///
/// Only `Auto` permits the handshake machine to assert `HO_AVBL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControllerMode {
    #[default]
    Auto,
    Manual,
    Maintenance,
    Fault,
}

impl core::fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
            Self::Maintenance => write!(f, "maintenance"),
            Self::Fault => write!(f, "fault"),
        }
    }
}

/// Which load-port transport variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// Discrete digital I/O lines.
    Digital,
    /// Line-oriented ASCII serial protocol.
    Ascii,
}

impl core::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Digital => write!(f, "digital"),
            Self::Ascii => write!(f, "ascii"),
        }
    }
}

// ─── Digital mapping ────────────────────────────────────────────────

/// Physical address of one digital line: two 8-bit ports per card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineAddress {
    pub card: u8,
    pub port: u8,
    pub bit: u8,
}

impl core::fmt::Display for LineAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "DIO{}.{}.{}", self.card, self.port, self.bit)
    }
}

/// One signal-to-line mapping entry from `[[digital.mapping]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineMapping {
    /// E84 signal carried on this line.
    pub signal: SignalName,
    pub card: u8,
    pub port: u8,
    pub bit: u8,
    /// Electrical polarity. Default: active high.
    #[serde(default)]
    pub polarity: Polarity,
}

impl LineMapping {
    #[inline]
    pub const fn address(&self) -> LineAddress {
        LineAddress {
            card: self.card,
            port: self.port,
            bit: self.bit,
        }
    }
}

/// Digital interface section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigitalConfig {
    /// Signal-to-line mapping table.
    #[serde(default)]
    pub mapping: Vec<LineMapping>,
}

impl DigitalConfig {
    /// Look up the mapping entry for a signal.
    pub fn mapping_for(&self, signal: SignalName) -> Option<&LineMapping> {
        self.mapping.iter().find(|m| m.signal == signal)
    }
}

// ─── ASCII serial section ───────────────────────────────────────────

fn default_baud() -> u32 {
    9600
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

/// ASCII serial interface section (8-N-1 framing is fixed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsciiConfig {
    /// Serial device path.
    pub port: String,

    /// Baud rate. Default: 9600.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Per-command response deadline [ms]. Default: 5000.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for AsciiConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS0".to_string(),
            baud: default_baud(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

// ─── Top-level config ───────────────────────────────────────────────

/// `[controller]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSection {
    /// Load-port transport variant.
    pub interface: InterfaceKind,

    /// Startup mode. Default: auto.
    #[serde(default)]
    pub mode: ControllerMode,

    /// Diagnostic verbosity. No effect on protocol behavior.
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller: ControllerSection,

    /// TP1–TP5 overrides in milliseconds.
    #[serde(default)]
    pub timers: TimerConfig,

    #[serde(default)]
    pub digital: Option<DigitalConfig>,

    #[serde(default)]
    pub ascii: Option<AsciiConfig>,
}

impl ControllerConfig {
    /// Parse from a TOML string. Does not validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load and validate from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::Parse(e.to_string())
            }
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Signals that must be line-mapped for the digital interface.
    ///
    /// Everything except `CONT`, which the equipment side registers but
    /// never consumes (continuous handshake is out of scope).
    pub fn required_digital_signals() -> impl Iterator<Item = SignalName> {
        SignalName::ALL
            .into_iter()
            .filter(|&s| s != SignalName::Cont)
    }

    /// Run all semantic validation rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = self.timers.zero_override() {
            return Err(ConfigError::InvalidTimerValue(id));
        }

        match self.controller.interface {
            InterfaceKind::Digital => {
                let digital = self.digital.as_ref().ok_or(ConfigError::MissingSection {
                    interface: InterfaceKind::Digital,
                    section: "digital",
                })?;
                Self::validate_mapping(digital)?;
            }
            InterfaceKind::Ascii => {
                if self.ascii.is_none() {
                    return Err(ConfigError::MissingSection {
                        interface: InterfaceKind::Ascii,
                        section: "ascii",
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_mapping(digital: &DigitalConfig) -> Result<(), ConfigError> {
        let mut by_line: HashMap<LineAddress, SignalName> = HashMap::new();
        let mut seen: HashMap<SignalName, ()> = HashMap::new();

        for entry in &digital.mapping {
            if entry.bit > 7 {
                return Err(ConfigError::BitOutOfRange {
                    signal: entry.signal,
                    bit: entry.bit,
                });
            }
            if seen.insert(entry.signal, ()).is_some() {
                return Err(ConfigError::DuplicateSignal(entry.signal));
            }
            if let Some(&first) = by_line.get(&entry.address()) {
                return Err(ConfigError::DuplicateLine {
                    card: entry.card,
                    port: entry.port,
                    bit: entry.bit,
                    first,
                    second: entry.signal,
                });
            }
            by_line.insert(entry.address(), entry.signal);
        }

        for signal in Self::required_digital_signals() {
            if !seen.contains_key(&signal) {
                return Err(ConfigError::UnmappedSignal(signal));
            }
        }
        Ok(())
    }
}
