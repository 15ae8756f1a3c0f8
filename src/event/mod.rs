//! One-shot completion tokens.
//!
//! An [`Event`] names an asynchronous condition that fires exactly once,
//! optionally poisoned to signal that the producing operation failed. Slots
//! live in a process-wide table; an `Event` value is just the slot id, so it
//! is `Copy` and freely shared across threads and (in-process) nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use lazy_static::lazy_static;
use log::trace;
use thiserror::Error;

/// A continuation registered on an [`Event`].
///
/// Fired exactly once, consuming the continuation; `poisoned` carries the
/// trigger's poison flag.
pub trait EventWaiter: Send {
    fn fire(self: Box<Self>, poisoned: bool);
}

impl<F: FnOnce(bool) + Send> EventWaiter for F {
    fn fire(self: Box<Self>, poisoned: bool) {
        (*self)(poisoned)
    }
}

/// Error returned by [`Event::wait`] when the event fired poisoned.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("event {0} was poisoned")]
pub struct Poisoned(pub Event);

struct SlotState {
    triggered: bool,
    poisoned: bool,
    waiters: Vec<Box<dyn EventWaiter>>,
}

struct EventSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref EVENT_TABLE: Mutex<HashMap<u64, Arc<EventSlot>>> = Mutex::new(HashMap::new());
}

fn lookup(id: u64) -> Arc<EventSlot> {
    EVENT_TABLE
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_else(|| panic!("unknown event id {id}"))
}

/// A one-shot completion token. Id 0 is [`Event::NO_EVENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Event(u64);

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ev:{:#x}", self.0)
    }
}

impl Event {
    /// The nonexistent event. Always considered triggered and never poisoned.
    pub const NO_EVENT: Event = Event(0);

    /// Allocate a fresh untriggered event.
    pub fn create_fresh() -> Event {
        let id = NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(EventSlot {
            state: Mutex::new(SlotState {
                triggered: false,
                poisoned: false,
                waiters: Vec::new(),
            }),
            cond: Condvar::new(),
        });
        EVENT_TABLE.lock().unwrap().insert(id, slot);
        Event(id)
    }

    pub fn exists(self) -> bool {
        self.0 != 0
    }

    /// Return `true` iff the event has fired. `NO_EVENT` counts as triggered.
    pub fn has_triggered(self) -> bool {
        if !self.exists() {
            return true;
        }
        lookup(self.0).state.lock().unwrap().triggered
    }

    /// Return the trigger state: `None` if still pending, `Some(poisoned)`
    /// once fired. `NO_EVENT` reads as fired clean.
    pub(crate) fn poll(self) -> Option<bool> {
        if !self.exists() {
            return Some(false);
        }
        let slot = lookup(self.0);
        let state = slot.state.lock().unwrap();
        state.triggered.then_some(state.poisoned)
    }

    /// Fire the event. Each event may be triggered exactly once.
    pub fn trigger(self, poisoned: bool) {
        assert!(self.exists(), "cannot trigger NO_EVENT");
        trace!("event trigger: event={self} poisoned={poisoned}");

        let slot = lookup(self.0);
        let waiters = {
            let mut state = slot.state.lock().unwrap();
            assert!(!state.triggered, "event {self} triggered twice");
            state.triggered = true;
            state.poisoned = poisoned;
            slot.cond.notify_all();
            std::mem::take(&mut state.waiters)
        };

        // Continuations run outside the slot mutex; they may create or
        // trigger further events.
        for waiter in waiters {
            waiter.fire(poisoned);
        }
    }

    /// Block the calling thread until the event fires.
    pub fn wait(self) -> Result<(), Poisoned> {
        if !self.exists() {
            return Ok(());
        }
        let slot = lookup(self.0);
        let mut state = slot.state.lock().unwrap();
        while !state.triggered {
            state = slot.cond.wait(state).unwrap();
        }
        if state.poisoned {
            Err(Poisoned(self))
        } else {
            Ok(())
        }
    }

    /// Register a continuation. If the event has already fired (or is
    /// `NO_EVENT`), the continuation runs inline on the calling thread.
    pub fn add_waiter(self, waiter: Box<dyn EventWaiter>) {
        if !self.exists() {
            waiter.fire(false);
            return;
        }
        let slot = lookup(self.0);
        let mut state = slot.state.lock().unwrap();
        if state.triggered {
            let poisoned = state.poisoned;
            drop(state);
            waiter.fire(poisoned);
        } else {
            state.waiters.push(waiter);
        }
    }

    /// Merge events into one that fires when all inputs have fired.
    /// Poison on any input poisons the output.
    pub fn merge(events: &[Event]) -> Event {
        let mut pending = Vec::new();
        let mut poisoned = false;
        for &ev in events {
            match ev.poll() {
                Some(p) => poisoned |= p,
                None => pending.push(ev),
            }
        }

        if pending.is_empty() {
            if !poisoned {
                return Event::NO_EVENT;
            }
            let merged = Event::create_fresh();
            merged.trigger(true);
            return merged;
        }
        if pending.len() == 1 && !poisoned {
            return pending[0];
        }

        let merged = Event::create_fresh();
        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        let poison = Arc::new(AtomicBool::new(poisoned));
        for ev in pending {
            ev.add_waiter(Box::new(MergeWaiter {
                target: merged,
                remaining: remaining.clone(),
                poison: poison.clone(),
            }));
        }
        merged
    }
}

/// Arms one input of a merged event; the last input to fire triggers the
/// merged target.
struct MergeWaiter {
    target: Event,
    remaining: Arc<AtomicUsize>,
    poison: Arc<AtomicBool>,
}

impl EventWaiter for MergeWaiter {
    fn fire(self: Box<Self>, poisoned: bool) {
        if poisoned {
            self.poison.store(true, Ordering::Relaxed);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.target.trigger(self.poison.load(Ordering::Relaxed));
        }
    }
}
