//! Process-local hybrid reader/writer lock.
//!
//! The fast path is one atomic 32-bit state word; the slow path coordinates
//! through a private mutex and, when the lock is backed by a reservation,
//! through the distributed protocol. Two cooperating state machines share the
//! word: the local reader/writer lock and the ownership shuttle that hands
//! the lock between this process and the underlying reservation.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitvec::{field::BitField, prelude as bv};
use log::trace;

use crate::cluster::RsrvId;
use crate::event::Event;
use crate::rsrv::{AcquireType, RsrvService};

/// Decoded view of the fast-reservation state word.
///
/// | Field             | LSB | Len | Description                                 |
/// | ----------------- | --: | --: | ------------------------------------------- |
/// | reader_count      |   0 |  26 | Active readers.                             |
/// | writer            |  26 |   1 | Exclusive writer present.                   |
/// | writer_waiting    |  27 |   1 | A writer is spinning; discourages readers.  |
/// | base_rsrv         |  28 |   1 | The underlying reservation owns the lock.   |
/// | base_rsrv_waiting |  29 |   1 | The reservation has been requested back.    |
/// | sleeper           |  30 |   1 | A holder may suspend; do not spin.          |
/// | slow_fallback     |  31 |   1 | Every operation goes through the base.      |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FastState(bv::BitArr!(for 32, in u32));

impl_word_basic_methods!(FastState, u32, 32);

impl FastState {
    define_field_accessor!(reader_count, u32, 0..26, WITH_MASK);
    define_field_accessor!(writer, u8, 26..27, WITH_MASK);
    define_field_accessor!(writer_waiting, u8, 27..28, WITH_MASK);
    define_field_accessor!(base_rsrv, u8, 28..29, WITH_MASK);
    define_field_accessor!(base_rsrv_waiting, u8, 29..30, WITH_MASK);
    define_field_accessor!(sleeper, u8, 30..31, WITH_MASK);
    define_field_accessor!(slow_fallback, u8, 31..32, WITH_MASK);
}

impl fmt::Debug for FastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastState")
            .field("reader_count", &self.reader_count())
            .field("writer", &self.writer())
            .field("writer_waiting", &self.writer_waiting())
            .field("base_rsrv", &self.base_rsrv())
            .field("base_rsrv_waiting", &self.base_rsrv_waiting())
            .field("sleeper", &self.sleeper())
            .field("slow_fallback", &self.slow_fallback())
            .finish()
    }
}

impl fmt::Display for FastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FastState {:#010x}", self.as_u32())
    }
}

const READER_COUNT: u32 = mask_of!(FastState: reader_count) as u32;
const WRITER: u32 = mask_of!(FastState: writer) as u32;
const WRITER_WAITING: u32 = mask_of!(FastState: writer_waiting) as u32;
const BASE_RSRV: u32 = mask_of!(FastState: base_rsrv) as u32;
const BASE_RSRV_WAITING: u32 = mask_of!(FastState: base_rsrv_waiting) as u32;
const SLEEPER: u32 = mask_of!(FastState: sleeper) as u32;
const SLOW_FALLBACK: u32 = mask_of!(FastState: slow_fallback) as u32;

/// Sharer tag used when the fallback path takes the base reservation for
/// reading. Writers use the exclusive mode.
const FALLBACK_READ_MODE: u32 = 1;

/// How an operation waits when it cannot complete on the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WaitMode {
    /// Spin on plain contention; return a token for exceptional conditions.
    Spin,
    /// Return a token for the caller to wait on asynchronously.
    Wait,
    /// Block inside the call (token waits included) and retry until held.
    ExternalWait,
    /// Spin in a tight loop; never acceptable to receive a token.
    AlwaysSpin,
}

/// Balance of fallback-path nonblocking attempts that still owe a retry.
///
/// Process-wide and shared by every fallback-mode [`FastRsrv`]: an attempt
/// that came back with a pending token must re-present itself as a retry, or
/// the base reservation keeps a permanent nonzero expected-retry count and
/// can never migrate.
static FALLBACK_RETRY_BALANCE: AtomicI32 = AtomicI32::new(0);

struct BaseRsrv {
    svc: Arc<RsrvService>,
    rsrv: RsrvId,
}

/// Companion state guarded by the private mutex.
struct FastInner {
    base: Option<BaseRsrv>,
    /// Pending grant token from an in-flight base acquire.
    rsrv_ready: Event,
    sleeper_count: u32,
    /// Merge of the guard tokens of all current sleepers.
    sleeper_event: Event,
}

struct FastShared {
    state: AtomicU32,
    inner: Mutex<FastInner>,
}

impl FastShared {
    /// Ask the base reservation for the lock (at most one request in
    /// flight). Clears the `base_rsrv` bit and returns `NO_EVENT` once the
    /// grant is in; otherwise returns the pending grant token.
    ///
    /// Must be called while holding the private mutex.
    fn request_base_rsrv(&self, inner: &mut FastInner) -> Event {
        let base = inner.base.as_ref().expect("no base reservation");

        if !inner.rsrv_ready.exists() {
            inner.rsrv_ready =
                base.svc
                    .acquire_with(base.rsrv, 0, true, AcquireType::Blocking, Event::NO_EVENT);
        }

        // The grant may be the satisfaction of an earlier request that we're
        // noticing now, or immediate in this call.
        if inner.rsrv_ready.has_triggered() {
            inner.rsrv_ready = Event::NO_EVENT;
            let prev = self.state.fetch_sub(BASE_RSRV, Ordering::AcqRel);
            assert!(prev & BASE_RSRV != 0);
            return Event::NO_EVENT;
        }
        inner.rsrv_ready
    }

    /// Swap `base_rsrv_waiting` for `base_rsrv` and return the lock to the
    /// reservation protocol. Must be called while holding the private mutex,
    /// with the fast lock idle.
    fn hand_back_base(&self, inner: &FastInner) {
        self.state
            .fetch_sub(BASE_RSRV_WAITING - BASE_RSRV, Ordering::AcqRel);
        let base = inner.base.as_ref().expect("no base reservation");
        base.svc.release_now(base.rsrv);
    }
}

/// A hybrid reader/writer lock, optionally backed by a reservation whose
/// ownership migrates between nodes.
pub struct FastRsrv {
    shared: Arc<FastShared>,
}

impl FastRsrv {
    /// A purely local lock: immediately available, no base reservation.
    pub fn new() -> Self {
        Self::build(None, false, false)
    }

    /// Wrap a reservation. The reservation initially owns the lock; the
    /// first local acquire pulls it in through the slow path.
    pub fn with_base(svc: Arc<RsrvService>, rsrv: RsrvId) -> Self {
        assert!(rsrv.exists());
        Self::build(Some(BaseRsrv { svc, rsrv }), false, true)
    }

    /// Fallback mode: every operation goes through the reservation protocol.
    /// Creates a private reservation if none is supplied (destroyed again on
    /// drop). Correctness escape hatch.
    pub fn with_fallback(svc: Arc<RsrvService>, rsrv: Option<RsrvId>) -> Self {
        match rsrv {
            Some(rsrv) => {
                assert!(rsrv.exists());
                Self::build(Some(BaseRsrv { svc, rsrv }), true, true)
            }
            None => {
                let rsrv = svc.create(&[]);
                assert!(rsrv.exists());
                Self::build(Some(BaseRsrv { svc, rsrv }), true, false)
            }
        }
    }

    fn build(base: Option<BaseRsrv>, fallback: bool, base_owns_lock: bool) -> Self {
        let mut init = 0;
        if base_owns_lock {
            // A caller-supplied reservation holds the lock until pulled in.
            init |= BASE_RSRV;
        }
        if fallback {
            init |= SLOW_FALLBACK;
        }

        let shared = Arc::new(FastShared {
            state: AtomicU32::new(init),
            inner: Mutex::new(FastInner {
                base,
                rsrv_ready: Event::NO_EVENT,
                sleeper_count: 0,
                sleeper_event: Event::NO_EVENT,
            }),
        });

        // A non-fallback base needs to hear about deferred remote requests
        // so the next unlocker hands the lock back.
        if !fallback {
            let inner = shared.inner.lock().unwrap();
            if let Some(base) = &inner.base {
                let weak: Weak<FastShared> = Arc::downgrade(&shared);
                base.svc.set_remote_request_hook(
                    base.rsrv,
                    Some(Arc::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.state.fetch_or(BASE_RSRV_WAITING, Ordering::AcqRel);
                        }
                    })),
                );
            }
        }

        Self { shared }
    }

    /// Take the lock for writing. Returns `NO_EVENT` once held; in `Spin` /
    /// `Wait` modes an exceptional condition returns a token to wait on
    /// before retrying the call.
    pub fn wrlock(&self, mode: WaitMode) -> Event {
        let state = &self.shared.state;
        if state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
            || state
                .compare_exchange(WRITER_WAITING, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return Event::NO_EVENT;
        }
        self.wrlock_slow(mode)
    }

    fn wrlock_slow(&self, mode: WaitMode) -> Event {
        let shared = &*self.shared;

        if shared.state.load(Ordering::Acquire) & SLOW_FALLBACK != 0 {
            return self.fallback_acquire(0, true);
        }

        // Repeat until we succeed.
        loop {
            let cur = shared.state.load(Ordering::Acquire);

            // With no exceptional conditions present, try to trade a
            // waiting-writer marker (ours or nobody's) for the writer bit;
            // the CAS fails while readers hold the lock.
            if cur & (SLOW_FALLBACK | BASE_RSRV | BASE_RSRV_WAITING | SLEEPER) == 0 {
                let prev = cur & WRITER_WAITING;
                if shared
                    .state
                    .compare_exchange(prev, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Event::NO_EVENT;
                }

                if matches!(mode, WaitMode::Spin | WaitMode::AlwaysSpin) {
                    // Discourage new readers while we spin. Not atomic with
                    // the test above, so only set the flag if the state has
                    // not moved; losing this race is harmless.
                    let _ = shared.state.compare_exchange(
                        cur,
                        cur | WRITER_WAITING,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                    std::hint::spin_loop();
                    continue;
                }

                panic!("wrlock: plain writer contention has no token to wait on");
            }

            // Any other transition requires the private mutex; exceptional
            // bits hold still underneath it.
            let wait_for = {
                let mut inner = shared.inner.lock().unwrap();
                let cur = shared.state.load(Ordering::Acquire);

                if cur & BASE_RSRV != 0 {
                    // The base reservation still owns the lock.
                    shared.request_base_rsrv(&mut inner)
                } else if cur & BASE_RSRV_WAITING != 0 {
                    // The reservation has been requested back. If nobody
                    // holds the fast lock, do the hand-back here; either way
                    // get our next request in line before waiting.
                    if cur & (WRITER | READER_COUNT) == 0 {
                        shared.hand_back_base(&inner);
                    }
                    shared.request_base_rsrv(&mut inner)
                } else if cur & SLEEPER != 0 {
                    // A current holder may be asleep.
                    inner.sleeper_event
                } else if cur & !(READER_COUNT | WRITER | WRITER_WAITING) == 0 {
                    // Back to plain contention; don't sleep after all.
                    Event::NO_EVENT
                } else {
                    panic!(
                        "wrlock_slow: unexpected state {:?}",
                        FastState::from_u32(cur)
                    );
                }
            };

            if wait_for.exists() {
                trace!("wrlock waits: mode={mode} event={wait_for}");
                match mode {
                    WaitMode::AlwaysSpin => {
                        panic!("wrlock: cannot spin out an exceptional condition")
                    }
                    WaitMode::Spin | WaitMode::Wait => return wait_for,
                    WaitMode::ExternalWait => {
                        wait_for.wait().expect("base reservation grant poisoned");
                    }
                }
            }
            // Now retry acquisition.
        }
    }

    /// One attempt to take the lock for writing.
    pub fn trywrlock(&self) -> bool {
        if self
            .shared
            .state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
        self.trywrlock_slow()
    }

    fn trywrlock_slow(&self) -> bool {
        let shared = &*self.shared;

        if shared.state.load(Ordering::Acquire) & SLOW_FALLBACK != 0 {
            return !self.fallback_acquire(0, true).exists();
        }

        loop {
            let cur = shared.state.load(Ordering::Acquire);
            if cur == 0 {
                if shared
                    .state
                    .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            // Simple contention just causes us to return.
            if cur & (READER_COUNT | WRITER | WRITER_WAITING) != 0 {
                return false;
            }

            // Exceptional bits: grab the base reservation if it's ours for
            // the taking, otherwise give up.
            let retry = {
                let mut inner = shared.inner.lock().unwrap();
                let cur = shared.state.load(Ordering::Acquire);
                if cur & BASE_RSRV != 0 {
                    !shared.request_base_rsrv(&mut inner).exists()
                } else {
                    false
                }
            };
            if !retry {
                return false;
            }
        }
    }

    /// Take the lock for reading. Returns `NO_EVENT` once held.
    pub fn rdlock(&self, mode: WaitMode) -> Event {
        let state = &self.shared.state;
        let cur = state.load(Ordering::Acquire);
        // Only (possibly sleeping) readers present: count ourselves in, then
        // make sure we didn't race with an exceptional transition.
        if cur & !(READER_COUNT | SLEEPER) == 0 {
            let prev = state.fetch_add(1, Ordering::AcqRel);
            if prev & !(READER_COUNT | SLEEPER) == 0 {
                return Event::NO_EVENT;
            }
            state.fetch_sub(1, Ordering::AcqRel);
        }
        self.rdlock_slow(mode)
    }

    fn rdlock_slow(&self, mode: WaitMode) -> Event {
        let shared = &*self.shared;

        if shared.state.load(Ordering::Acquire) & SLOW_FALLBACK != 0 {
            return self.fallback_acquire(FALLBACK_READ_MODE, false);
        }

        // Repeat until we succeed.
        loop {
            let cur = shared.state.load(Ordering::Acquire);

            // A non-sleeping writer or a waiting writer makes us skip the
            // count increment so we don't cache-fight the writer.
            let sleeping_writer = cur & (WRITER | SLEEPER) == (WRITER | SLEEPER);
            if cur & (SLOW_FALLBACK | BASE_RSRV | BASE_RSRV_WAITING) == 0 && !sleeping_writer {
                if cur & (WRITER | WRITER_WAITING) == 0 {
                    let prev = shared.state.fetch_add(1, Ordering::AcqRel);
                    if prev & !(SLEEPER | READER_COUNT) == 0 {
                        return Event::NO_EVENT;
                    }
                    shared.state.fetch_sub(1, Ordering::AcqRel);
                }

                if matches!(mode, WaitMode::Spin | WaitMode::AlwaysSpin) {
                    std::hint::spin_loop();
                    continue;
                }

                panic!("rdlock: plain writer contention has no token to wait on");
            }

            let wait_for = {
                let mut inner = shared.inner.lock().unwrap();
                let cur = shared.state.load(Ordering::Acquire);

                if cur & BASE_RSRV != 0 {
                    shared.request_base_rsrv(&mut inner)
                } else if cur & BASE_RSRV_WAITING != 0 {
                    // A reader that loses the race with the waiting bit backs
                    // its count out and ends up here: if the lock is idle,
                    // the hand-back falls to us.
                    if cur & (WRITER | READER_COUNT) == 0 {
                        shared.hand_back_base(&inner);
                    }
                    shared.request_base_rsrv(&mut inner)
                } else if cur & SLEEPER != 0 {
                    inner.sleeper_event
                } else if cur & !(READER_COUNT | WRITER | WRITER_WAITING) == 0 {
                    Event::NO_EVENT
                } else {
                    panic!(
                        "rdlock_slow: unexpected state {:?}",
                        FastState::from_u32(cur)
                    );
                }
            };

            if wait_for.exists() {
                trace!("rdlock waits: mode={mode} event={wait_for}");
                match mode {
                    WaitMode::AlwaysSpin => {
                        panic!("rdlock: cannot spin out an exceptional condition")
                    }
                    WaitMode::Spin | WaitMode::Wait => return wait_for,
                    WaitMode::ExternalWait => {
                        wait_for.wait().expect("base reservation grant poisoned");
                    }
                }
            }
            // Now retry acquisition.
        }
    }

    /// One attempt to take the lock for reading.
    pub fn tryrdlock(&self) -> bool {
        let shared = &*self.shared;

        if shared.state.load(Ordering::Acquire) & SLOW_FALLBACK != 0 {
            return !self.fallback_acquire(FALLBACK_READ_MODE, false).exists();
        }

        loop {
            let cur = shared.state.load(Ordering::Acquire);

            if cur & !(SLEEPER | READER_COUNT) == 0 {
                let prev = shared.state.fetch_add(1, Ordering::AcqRel);
                if prev & !(SLEEPER | READER_COUNT) == 0 {
                    return true;
                }
                let after = shared.state.fetch_sub(1, Ordering::AcqRel);
                // TODO: hand the base reservation back if the waiting bit
                // appeared during the erroneous count increase.
                assert!(after & BASE_RSRV_WAITING == 0);
                return false;
            }

            // If the base reservation appears to own the lock, one
            // nonblocking grab attempt under the mutex, then retry or fail.
            if cur & BASE_RSRV != 0 {
                let retry = {
                    let mut inner = shared.inner.lock().unwrap();
                    let cur = shared.state.load(Ordering::Acquire);
                    cur & BASE_RSRV != 0 && !shared.request_base_rsrv(&mut inner).exists()
                };
                if retry {
                    continue;
                }
            }

            // Any other condition will have to sort itself out.
            return false;
        }
    }

    /// Release one read share or the write hold.
    pub fn unlock(&self) {
        let state = &self.shared.state;
        let cur = state.load(Ordering::Acquire);
        if cur == WRITER {
            if state
                .compare_exchange(WRITER, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        } else if cur & !READER_COUNT == 0 && cur & READER_COUNT > 1 {
            // Readers only and not the last one out.
            state.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.unlock_slow();
    }

    fn unlock_slow(&self) {
        let shared = &*self.shared;

        if shared.state.load(Ordering::Acquire) & SLOW_FALLBACK != 0 {
            let (svc, rsrv) = {
                let inner = shared.inner.lock().unwrap();
                let base = inner.base.as_ref().expect("no base reservation");
                (base.svc.clone(), base.rsrv)
            };
            svc.release_now(rsrv);
            return;
        }

        // The fast path already failed; hold exceptional conditions still
        // and pick apart the state.
        let inner = shared.inner.lock().unwrap();
        let cur = shared.state.load(Ordering::Acquire);

        if cur & WRITER != 0 {
            assert!(cur & (SLEEPER | BASE_RSRV) == 0);

            // The unlock leaves the lock idle; hand the reservation back if
            // it has been requested.
            if cur & BASE_RSRV_WAITING != 0 {
                shared.hand_back_base(&inner);
            }

            shared.state.fetch_sub(WRITER, Ordering::AcqRel);
        } else {
            // We'd better be a reader then.
            let reader_count = cur & READER_COUNT;
            assert!(reader_count > 0, "unlock of unheld fast reservation");
            assert!(cur & BASE_RSRV == 0);
            assert!(reader_count > 1 || cur & SLEEPER == 0);

            if cur & BASE_RSRV_WAITING != 0 && reader_count == 1 {
                shared.hand_back_base(&inner);
            }

            shared.state.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Note that a current holder may suspend on `guard` while holding the
    /// lock. Other acquirers wait on the (merged) guard instead of spinning.
    /// Must be called while holding the public lock.
    pub fn advise_sleep_entry(&self, guard: Event) {
        assert!(guard.exists());
        let shared = &*self.shared;
        let mut inner = shared.inner.lock().unwrap();

        if inner.sleeper_count == 0 {
            assert!(!inner.sleeper_event.exists());
            inner.sleeper_event = guard;
            // Set the sleeper flag; it must not already be set.
            let old = shared.state.fetch_add(SLEEPER, Ordering::AcqRel);
            assert!(old & SLEEPER == 0);
            // A waiting writer is about to sleep; clear the advisory bit.
            if old & WRITER_WAITING != 0 {
                shared.state.fetch_and(!WRITER_WAITING, Ordering::Relaxed);
            }
            inner.sleeper_count = 1;
        } else {
            assert!(inner.sleeper_event.exists());
            debug_assert!(shared.state.load(Ordering::Relaxed) & SLEEPER != 0);
            inner.sleeper_count += 1;
            if guard != inner.sleeper_event {
                inner.sleeper_event = Event::merge(&[inner.sleeper_event, guard]);
            }
        }
    }

    /// The dual of [`FastRsrv::advise_sleep_entry`].
    pub fn advise_sleep_exit(&self) {
        let shared = &*self.shared;
        let mut inner = shared.inner.lock().unwrap();

        assert!(inner.sleeper_count > 0);
        if inner.sleeper_count == 1 {
            // Clear the sleeper flag; it must already be set.
            let old = shared.state.fetch_sub(SLEEPER, Ordering::AcqRel);
            assert!(old & SLEEPER != 0);
            assert!(old & WRITER_WAITING == 0);
            inner.sleeper_count = 0;
            assert!(inner.sleeper_event.exists());
            inner.sleeper_event = Event::NO_EVENT;
        } else {
            assert!(inner.sleeper_event.exists());
            debug_assert!(shared.state.load(Ordering::Relaxed) & SLEEPER != 0);
            inner.sleeper_count -= 1;
        }
    }

    /// Choose the fallback acquire type from the process-wide retry balance
    /// and attempt the base acquire. A failed attempt re-arms the balance.
    fn fallback_acquire(&self, mode: u32, exclusive: bool) -> Event {
        let (svc, rsrv) = {
            let inner = self.shared.inner.lock().unwrap();
            let base = inner.base.as_ref().expect("fallback without base reservation");
            (base.svc.clone(), base.rsrv)
        };

        let acquire_type = loop {
            let current = FALLBACK_RETRY_BALANCE.load(Ordering::Acquire);
            if current == 0 {
                break AcquireType::Nonblocking;
            }
            if FALLBACK_RETRY_BALANCE
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break AcquireType::NonblockingRetry;
            }
        };

        let granted = svc.acquire_with(rsrv, mode, exclusive, acquire_type, Event::NO_EVENT);
        if granted.exists() {
            // Attempt failed; we'll retry later.
            FALLBACK_RETRY_BALANCE.fetch_add(1, Ordering::AcqRel);
        }
        granted
    }
}

impl Default for FastRsrv {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FastRsrv {
    fn drop(&mut self) {
        let inner = self.shared.inner.lock().unwrap();
        if let Some(base) = &inner.base {
            base.svc.set_remote_request_hook(base.rsrv, None);

            // If the base does not currently own the lock, give it back; a
            // fallback-created reservation is destroyed outright.
            let cur = self.shared.state.load(Ordering::Acquire);
            if cur & BASE_RSRV == 0 {
                if cur & SLOW_FALLBACK != 0 {
                    base.svc.destroy(base.rsrv);
                } else {
                    base.svc.release_now(base.rsrv);
                }
            }
        }
    }
}

#[cfg(test)]
impl FastRsrv {
    pub(crate) fn state_word(&self) -> u32 {
        self.shared.state.load(Ordering::SeqCst)
    }
}
