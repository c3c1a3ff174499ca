//! Named boolean signals with edge-triggered observer notification.
//!
//! Built once at startup from the fixed E84 signal set. Only the dispatch
//! thread touches the registry, so it carries no internal locking;
//! external consumers get [`SignalSnapshot`] copies.
//!
//! Writes are capability-checked: registration issues exactly one writer
//! handle per signal, and a write through anything else fails with
//! `WrongDirection`. Same-level writes are no-ops and never notify.

use std::time::SystemTime;

use tracing::{debug, trace};

use e84_common::signal::{Polarity, SignalDirection, SignalName};

use super::dispatch::{SignalCallback, SubscriberTable, SubscriptionId, WriteQueue};
use super::store::{Signal, SignalChange, SignalSnapshot, SignalStore};
use super::SignalError;

/// Upper bound on level changes processed from a single dispatch entry.
///
/// A cascade that exceeds this is oscillating between subscribers and is
/// reported as `ReentrantDispatch`.
const MAX_CASCADE: usize = 64;

// ─── SignalHandle ───────────────────────────────────────────────────

/// Capability handle for one registered signal.
///
/// Issued once per signal at registration; carries the write capability
/// for the owning component. Fields are private so a handle cannot be
/// forged.
#[derive(Debug, Clone)]
pub struct SignalHandle {
    name: SignalName,
    writer: bool,
}

impl SignalHandle {
    #[inline]
    pub fn name(&self) -> SignalName {
        self.name
    }

    #[inline]
    pub(crate) fn is_writer(&self) -> bool {
        self.writer
    }

    #[cfg(test)]
    pub(crate) fn forged_reader(name: SignalName) -> Self {
        Self {
            name,
            writer: false,
        }
    }
}

// ─── SignalRegistry ─────────────────────────────────────────────────

/// The signal registry plus its callback dispatcher.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    store: SignalStore,
    subscribers: SubscriberTable,
    dispatching: bool,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signal, returning its writer handle.
    ///
    /// The initial level is the protocol power-on default for the name.
    pub fn register(
        &mut self,
        name: SignalName,
        direction: SignalDirection,
        polarity: Polarity,
    ) -> Result<SignalHandle, SignalError> {
        if self.store.contains(name) {
            return Err(SignalError::DuplicateSignal(name));
        }
        self.store.insert(Signal {
            name,
            direction,
            polarity,
            level: name.default_level(),
            changed_at: SystemTime::now(),
        });
        Ok(SignalHandle { name, writer: true })
    }

    /// Current level through a handle. Total for registered signals.
    #[inline]
    pub fn read(&self, handle: &SignalHandle) -> bool {
        self.store.level(handle.name)
    }

    /// Current level by name. Unregistered signals read low.
    #[inline]
    pub fn level(&self, name: SignalName) -> bool {
        self.store.level(name)
    }

    /// Read-only store view for guard evaluation.
    #[inline]
    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    /// Consistent copy of all levels for diagnostics.
    pub fn snapshot(&self) -> SignalSnapshot {
        self.store.snapshot()
    }

    /// Subscribe to real level changes of one signal.
    ///
    /// Callbacks run synchronously on the dispatch thread in FIFO
    /// registration order.
    pub fn subscribe(&mut self, name: SignalName, callback: SignalCallback) -> SubscriptionId {
        self.subscribers.subscribe(name, callback)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.unsubscribe(id);
    }

    /// Write a level through a writer handle.
    ///
    /// Returns `Ok(true)` if the level changed (and subscribers ran),
    /// `Ok(false)` for a same-level no-op.
    pub fn write(&mut self, handle: &SignalHandle, level: bool) -> Result<bool, SignalError> {
        if !handle.is_writer() {
            return Err(SignalError::WrongDirection(handle.name()));
        }
        let idx = self
            .store
            .index_of(handle.name())
            .ok_or(SignalError::UnknownSignal(handle.name()))?;
        self.dispatch(idx, level, SystemTime::now())
    }

    /// Apply an input edge reported by the transport layer.
    ///
    /// `at` is the wall-clock timestamp at the source, preserving input
    /// order for diagnostics even when dispatch lags.
    pub fn apply_input(
        &mut self,
        name: SignalName,
        level: bool,
        at: SystemTime,
    ) -> Result<bool, SignalError> {
        let idx = self
            .store
            .index_of(name)
            .ok_or(SignalError::UnknownSignal(name))?;
        if self.store.get(name).map(|s| s.direction) != Some(SignalDirection::Input) {
            return Err(SignalError::WrongDirection(name));
        }
        self.dispatch(idx, level, at)
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    /// Commit a level change and notify subscribers, applying any writes
    /// they defer. Edge-triggered: a same-level write does nothing.
    fn dispatch(&mut self, idx: usize, level: bool, at: SystemTime) -> Result<bool, SignalError> {
        {
            let signal = self.store.get_mut(idx);
            if signal.level == level {
                return Ok(false);
            }
            if self.dispatching {
                // Only the deferred-write queue may feed dispatch while a
                // cascade is in progress.
                return Err(SignalError::ReentrantDispatch(signal.name));
            }
        }

        self.dispatching = true;
        let result = self.run_cascade(idx, level, at);
        self.dispatching = false;
        result
    }

    fn run_cascade(&mut self, idx: usize, level: bool, at: SystemTime) -> Result<bool, SignalError> {
        let mut pending: Vec<(usize, bool, SystemTime)> = vec![(idx, level, at)];
        let mut processed = 0usize;

        while !pending.is_empty() {
            let (idx, level, at) = pending.remove(0);

            let (name, change) = {
                let signal = self.store.get_mut(idx);
                if signal.level == level {
                    continue; // already at this level, no edge
                }
                let change = SignalChange {
                    name: signal.name,
                    old: signal.level,
                    new: level,
                    at,
                };
                signal.level = level;
                signal.changed_at = at;
                (signal.name, change)
            };

            processed += 1;
            if processed > MAX_CASCADE {
                debug!(signal = %name, "signal dispatch cascade failed to quiesce");
                return Err(SignalError::ReentrantDispatch(name));
            }
            trace!(signal = %name, old = change.old, new = change.new, "signal changed");

            // Notify in FIFO order. The list is taken out so callbacks can
            // read the store without aliasing the registry.
            let mut subs = self.subscribers.take(name);
            let mut queue = WriteQueue::new();
            let mut queue_error = None;
            for (_, callback) in subs.iter_mut() {
                callback(&change, &self.store, &mut queue);
                // Deferred writes dispatch after the current callback
                // returns, in write order.
                while let Some(write) = queue.pop() {
                    if !write.handle.is_writer() {
                        queue_error = Some(SignalError::WrongDirection(write.handle.name()));
                        break;
                    }
                    match self.store.index_of(write.handle.name()) {
                        Some(idx) => pending.push((idx, write.level, write.at)),
                        None => {
                            queue_error = Some(SignalError::UnknownSignal(write.handle.name()));
                        }
                    }
                    if queue_error.is_some() {
                        break;
                    }
                }
                if queue_error.is_some() {
                    break;
                }
            }
            self.subscribers.put_back(name, subs);
            if let Some(err) = queue_error {
                return Err(err);
            }
        }

        Ok(true)
    }
}
