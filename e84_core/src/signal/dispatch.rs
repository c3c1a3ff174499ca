//! Subscriber bookkeeping and deferred writes.
//!
//! Callbacks run synchronously on the dispatch thread, in FIFO
//! registration order per signal. A callback never holds a mutable
//! registry alias; writes it wants to make go through [`WriteQueue`] and
//! are applied after the callback returns, in write order.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use e84_common::signal::SignalName;

use super::registry::SignalHandle;
use super::store::{SignalChange, SignalStore};

/// Callback invoked on every real level change of a subscribed signal.
pub type SignalCallback = Box<dyn FnMut(&SignalChange, &SignalStore, &mut WriteQueue) + Send>;

/// Opaque subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

// ─── WriteQueue ─────────────────────────────────────────────────────

/// Signal write requested from inside a callback.
#[derive(Debug)]
pub(crate) struct QueuedWrite {
    pub handle: SignalHandle,
    pub level: bool,
    pub at: SystemTime,
}

/// Deferred writes issued during dispatch.
///
/// Applied by the registry after the issuing callback returns, which
/// bounds dispatch depth at 1 and keeps notification order deterministic.
#[derive(Debug, Default)]
pub struct WriteQueue {
    entries: VecDeque<QueuedWrite>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Request a write. Token and direction checks happen at apply time.
    pub fn push(&mut self, handle: &SignalHandle, level: bool) {
        self.entries.push_back(QueuedWrite {
            handle: handle.clone(),
            level,
            at: SystemTime::now(),
        });
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedWrite> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── SubscriberTable ────────────────────────────────────────────────

/// Per-signal subscriber lists, FIFO in registration order.
#[derive(Default)]
pub(crate) struct SubscriberTable {
    subscribers: HashMap<SignalName, Vec<(SubscriptionId, SignalCallback)>>,
    next_id: u64,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, name: SignalName, callback: SignalCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.entry(name).or_default().push((id, callback));
        id
    }

    /// Remove a subscription. Idempotent: unknown ids are ignored.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        for list in self.subscribers.values_mut() {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Take the subscriber list for a signal so callbacks can run while
    /// the store is immutably borrowed. Must be paired with `put_back`.
    pub fn take(&mut self, name: SignalName) -> Vec<(SubscriptionId, SignalCallback)> {
        self.subscribers.remove(&name).unwrap_or_default()
    }

    pub fn put_back(&mut self, name: SignalName, mut list: Vec<(SubscriptionId, SignalCallback)>) {
        // Subscriptions added during dispatch land in the map entry;
        // prepend the original list to preserve FIFO order.
        if let Some(mut added) = self.subscribers.remove(&name) {
            list.append(&mut added);
        }
        if !list.is_empty() {
            self.subscribers.insert(name, list);
        }
    }

    pub fn count_for(&self, name: SignalName) -> usize {
        self.subscribers.get(&name).map(Vec::len).unwrap_or(0)
    }
}

impl std::fmt::Debug for SubscriberTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberTable")
            .field("signals", &self.subscribers.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_unsubscribe() {
        let mut table = SubscriberTable::new();
        let a = table.subscribe(SignalName::Valid, Box::new(|_, _, _| {}));
        let b = table.subscribe(SignalName::Valid, Box::new(|_, _, _| {}));
        assert_ne!(a, b);
        assert_eq!(table.count_for(SignalName::Valid), 2);

        table.unsubscribe(a);
        assert_eq!(table.count_for(SignalName::Valid), 1);

        // Idempotent.
        table.unsubscribe(a);
        assert_eq!(table.count_for(SignalName::Valid), 1);
    }

    #[test]
    fn take_put_back_preserves_order() {
        let mut table = SubscriberTable::new();
        let a = table.subscribe(SignalName::Busy, Box::new(|_, _, _| {}));
        let b = table.subscribe(SignalName::Busy, Box::new(|_, _, _| {}));

        let list = table.take(SignalName::Busy);
        assert_eq!(list.len(), 2);
        assert_eq!(table.count_for(SignalName::Busy), 0);

        table.put_back(SignalName::Busy, list);
        let list = table.take(SignalName::Busy);
        assert_eq!(list[0].0, a);
        assert_eq!(list[1].0, b);
    }
}
