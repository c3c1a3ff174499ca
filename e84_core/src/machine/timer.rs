//! TP timer service.
//!
//! A dedicated thread runs a monotonic min-heap keyed by deadline and
//! posts `TimerFired` events into the main queue. Cancellation never
//! touches the heap: the client bumps a generation counter and stale
//! expirations are discarded on dequeue. This closes the race between a
//! cancel and an expiry already queued behind other events.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use e84_common::timer::TimerId;

use crate::event::Event;

// ─── Commands and heap entries ──────────────────────────────────────

/// Commands accepted by the timer service thread.
#[derive(Debug, Clone)]
pub enum TimerCommand {
    Arm {
        timer: TimerId,
        generation: u64,
        duration: Duration,
    },
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    timer: TimerId,
    generation: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ─── TimerService ───────────────────────────────────────────────────

/// Handle to the timer service thread. Shuts the thread down on drop.
#[derive(Debug)]
pub struct TimerService {
    commands: Sender<TimerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Spawn the service; expirations go to `events`.
    pub fn spawn(events: Sender<Event>) -> Self {
        let (commands, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("e84-timer".to_string())
            .spawn(move || run(rx, events))
            .expect("failed to spawn timer thread");
        Self {
            commands,
            handle: Some(handle),
        }
    }

    /// A client that arms timers on this service.
    pub fn client(&self) -> TimerClient {
        TimerClient::new(self.commands.clone())
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        let _ = self.commands.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(commands: Receiver<TimerCommand>, events: Sender<Event>) {
    let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
            let Reverse(entry) = heap.pop().expect("peeked entry");
            trace!(timer = %entry.timer, generation = entry.generation, "timer fired");
            // The dispatch thread discards stale generations.
            let _ = events.send(Event::TimerFired {
                timer: entry.timer,
                generation: entry.generation,
            });
        }

        let received = match heap.peek() {
            Some(Reverse(next)) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                commands.recv_timeout(wait)
            }
            None => commands
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(TimerCommand::Arm {
                timer,
                generation,
                duration,
            }) => {
                heap.push(Reverse(HeapEntry {
                    deadline: Instant::now() + duration,
                    timer,
                    generation,
                }));
            }
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                debug!("timer service stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

// ─── TimerClient ────────────────────────────────────────────────────

/// A currently armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub id: TimerId,
    pub generation: u64,
    pub duration: Duration,
}

/// Machine-side timer bookkeeping.
///
/// Tracks the single armed timer and the generation counter that
/// invalidates cancelled or superseded expirations. A fired timer is
/// consumed until re-armed.
#[derive(Debug)]
pub struct TimerClient {
    commands: Option<Sender<TimerCommand>>,
    generation: u64,
    armed: Option<ArmedTimer>,
}

impl TimerClient {
    pub fn new(commands: Sender<TimerCommand>) -> Self {
        Self {
            commands: Some(commands),
            generation: 0,
            armed: None,
        }
    }

    /// A client with no service behind it. Expirations are injected by
    /// hand; used in tests.
    pub fn detached() -> Self {
        Self {
            commands: None,
            generation: 0,
            armed: None,
        }
    }

    /// Arm a timer, replacing whatever was armed before.
    pub fn arm(&mut self, id: TimerId, duration: Duration) -> ArmedTimer {
        self.generation += 1;
        let armed = ArmedTimer {
            id,
            generation: self.generation,
            duration,
        };
        self.armed = Some(armed);
        if let Some(commands) = &self.commands {
            let _ = commands.send(TimerCommand::Arm {
                timer: id,
                generation: armed.generation,
                duration,
            });
        }
        armed
    }

    /// Disarm. The outstanding heap entry, if any, becomes stale.
    pub fn cancel(&mut self) -> Option<ArmedTimer> {
        self.generation += 1;
        self.armed.take()
    }

    /// Consume a matching expiry. Returns false for stale generations.
    pub fn consume(&mut self, id: TimerId, generation: u64) -> bool {
        match self.armed {
            Some(armed) if armed.id == id && armed.generation == generation => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn armed(&self) -> Option<&ArmedTimer> {
        self.armed.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded as unbounded_events;

    #[test]
    fn arm_replaces_and_invalidates() {
        let mut client = TimerClient::detached();
        let first = client.arm(TimerId::Tp1, Duration::from_secs(2));
        let second = client.arm(TimerId::Tp2, Duration::from_secs(2));
        assert_ne!(first.generation, second.generation);

        // The superseded expiry is stale.
        assert!(!client.consume(TimerId::Tp1, first.generation));
        // The live one is consumed exactly once.
        assert!(client.consume(TimerId::Tp2, second.generation));
        assert!(!client.consume(TimerId::Tp2, second.generation));
        assert!(client.armed().is_none());
    }

    #[test]
    fn cancel_invalidates_outstanding() {
        let mut client = TimerClient::detached();
        let armed = client.arm(TimerId::Tp3, Duration::from_secs(60));
        assert_eq!(client.armed().map(|a| a.id), Some(TimerId::Tp3));

        client.cancel();
        assert!(client.armed().is_none());
        assert!(!client.consume(TimerId::Tp3, armed.generation));
    }

    #[test]
    fn service_fires_due_timer() {
        let (events_tx, events_rx) = unbounded_events();
        let service = TimerService::spawn(events_tx);
        let mut client = service.client();

        let armed = client.arm(TimerId::Tp1, Duration::from_millis(20));
        let event = events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("timer should fire");
        match event {
            Event::TimerFired { timer, generation } => {
                assert_eq!(timer, TimerId::Tp1);
                assert_eq!(generation, armed.generation);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn service_orders_by_deadline() {
        let (events_tx, events_rx) = unbounded_events();
        let service = TimerService::spawn(events_tx);
        let mut slow = service.client();
        let mut fast = service.client();

        slow.arm(TimerId::Tp4, Duration::from_millis(80));
        fast.arm(TimerId::Tp5, Duration::from_millis(10));

        let first = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match (first, second) {
            (
                Event::TimerFired { timer: a, .. },
                Event::TimerFired { timer: b, .. },
            ) => {
                assert_eq!(a, TimerId::Tp5);
                assert_eq!(b, TimerId::Tp4);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }
}
