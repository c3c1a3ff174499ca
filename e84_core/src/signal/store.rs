//! Signal records and diagnostic snapshots.
//!
//! The store keeps the logical level and last-change timestamp of every
//! registered signal. It is only ever mutated by the registry on the
//! dispatch thread; external consumers get [`SignalSnapshot`] copies.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use e84_common::signal::{Polarity, SignalDirection, SignalName};

// ─── Signal ─────────────────────────────────────────────────────────

/// One registered signal.
#[derive(Debug, Clone)]
pub struct Signal {
    pub name: SignalName,
    pub direction: SignalDirection,
    pub polarity: Polarity,
    /// Current logical level.
    pub level: bool,
    /// Wall-clock time of the last real level change.
    pub changed_at: SystemTime,
}

/// A single committed level change, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalChange {
    pub name: SignalName,
    pub old: bool,
    pub new: bool,
    /// Wall-clock timestamp of the change at its source. Preserves
    /// source order for diagnostics even when dispatch is delayed.
    pub at: SystemTime,
}

impl SignalChange {
    /// Rising edge (false → true).
    #[inline]
    pub const fn rising(&self) -> bool {
        self.new && !self.old
    }

    /// Falling edge (true → false).
    #[inline]
    pub const fn falling(&self) -> bool {
        self.old && !self.new
    }
}

// ─── SignalStore ────────────────────────────────────────────────────

/// Indexed collection of signal records.
#[derive(Debug, Default)]
pub struct SignalStore {
    signals: Vec<Signal>,
    by_name: HashMap<SignalName, usize>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new signal record, returning its index.
    ///
    /// Callers (the registry) must have already rejected duplicates.
    pub(crate) fn insert(&mut self, signal: Signal) -> usize {
        let idx = self.signals.len();
        self.by_name.insert(signal.name, idx);
        self.signals.push(signal);
        idx
    }

    #[inline]
    pub(crate) fn index_of(&self, name: SignalName) -> Option<usize> {
        self.by_name.get(&name).copied()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Signal {
        &mut self.signals[idx]
    }

    /// Signal record by name.
    pub fn get(&self, name: SignalName) -> Option<&Signal> {
        self.index_of(name).map(|idx| &self.signals[idx])
    }

    /// Current logical level. `false` for unregistered signals keeps
    /// guard evaluation total.
    #[inline]
    pub fn level(&self, name: SignalName) -> bool {
        self.get(name).map(|s| s.level).unwrap_or(false)
    }

    pub fn contains(&self, name: SignalName) -> bool {
        self.by_name.contains_key(&name)
    }

    /// Consistent copy of all levels for diagnostics.
    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            levels: self
                .signals
                .iter()
                .map(|s| (s.name, s.level))
                .collect(),
            taken_at: SystemTime::now(),
        }
    }
}

// ─── SignalSnapshot ─────────────────────────────────────────────────

/// Immutable point-in-time copy of all signal levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSnapshot {
    levels: BTreeMap<SignalName, bool>,
    taken_at: SystemTime,
}

impl SignalSnapshot {
    /// Level at snapshot time. `false` for signals absent at the time.
    #[inline]
    pub fn level(&self, name: SignalName) -> bool {
        self.levels.get(&name).copied().unwrap_or(false)
    }

    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }

    /// Iterate `(name, level)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (SignalName, bool)> + '_ {
        self.levels.iter().map(|(&n, &l)| (n, l))
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
