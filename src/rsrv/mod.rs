//! Migratory reader/writer reservations.
//!
//! One logical lock per [`RsrvId`], replicated lazily across nodes. Exactly
//! one node at a time holds the authoritative state (the owner); ownership
//! migrates via grant messages, which carry the deferred-waiter snapshot and
//! the reservation's user data. Each replica is a small state machine under
//! its own mutex; messages are sent only after the mutex is dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, trace};

use crate::cluster::{
    decode_grant_payload, encode_grant_payload, DestroyLock, Directory, LockGrant, LockRelease,
    LockRequest, MsgHandler, NetMsg, NodeId, NodeSet, RsrvId,
};
use crate::event::Event;

mod deferred;

use deferred::{DeferredAcquire, DeferredDestroy, DeferredRelease};

/// Exclusive mode. Grant messages use mode 0 for "exclusive ownership";
/// sharer tags are nonzero, and numerically lower tags have higher priority.
pub const MODE_EXCL: u32 = 0;

/// Bias added to the holder count so the idle state is a recognizable
/// sentinel rather than zero.
pub const ZERO_COUNT: u32 = 1 << 30;

/// How an acquire behaves when the lock is not immediately grantable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AcquireType {
    /// Park a waiter token; it fires when the lock is granted.
    Blocking,
    /// Register a retry and return a shared per-mode retry token.
    Nonblocking,
    /// Re-attempt after a retry token fired; does not bump the retry count.
    NonblockingRetry,
    /// Only bump the retry count: a retry caused by an earlier completion
    /// will follow.
    NonblockingPlaceholder,
}

/// Per-node replica state. Guarded by the replica mutex.
struct RsrvState {
    owner: NodeId,
    /// Holder count, biased by [`ZERO_COUNT`].
    count: u32,
    /// Current mode; meaningful only while `count > ZERO_COUNT`.
    mode: u32,
    /// Creator-side liveness flag, checked on the creator node only.
    in_use: bool,
    /// True while an acquire request to `owner` is in flight.
    requested: bool,
    /// Blocking waiters, per mode, FIFO within a mode.
    local_waiters: BTreeMap<u32, VecDeque<Event>>,
    /// One shared retry token per mode for nonblocking waiters.
    retry_events: BTreeMap<u32, Event>,
    /// Outstanding nonblocking attempts per mode that still expect a retry.
    /// Ownership must not migrate while any entry is nonzero.
    retry_count: BTreeMap<u32, u32>,
    /// Nodes whose requests we have deferred.
    remote_waiter_mask: NodeSet,
    /// Reserved for a future shared-grant path.
    remote_sharer_mask: NodeSet,
    /// User data; migrates with ownership in grant messages.
    local_data: Vec<u8>,
    /// Invoked (outside the mutex) after a remote request is deferred.
    /// Installed by a fast reservation wrapping this lock.
    remote_request_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct RsrvImpl {
    id: RsrvId,
    state: Mutex<RsrvState>,
}

impl RsrvImpl {
    fn new(id: RsrvId, owner: NodeId, in_use: bool, local_data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(RsrvState {
                owner,
                count: ZERO_COUNT,
                mode: 0,
                in_use,
                requested: false,
                local_waiters: BTreeMap::new(),
                retry_events: BTreeMap::new(),
                retry_count: BTreeMap::new(),
                remote_waiter_mask: NodeSet::new(),
                remote_sharer_mask: NodeSet::new(),
                local_data,
                remote_request_hook: None,
            }),
        })
    }
}

impl RsrvState {
    /// Pick the waiters to wake now that the lock is grantable locally.
    /// Updates `mode` and `count` for blocking grants; a retry token is
    /// woken without taking the lock (its holders re-attempt with
    /// [`AcquireType::NonblockingRetry`]).
    ///
    /// Exclusive waiters win outright; otherwise the numerically lowest mode
    /// across both maps wins, blocking waiters on a tie.
    fn select_local_waiters(&mut self, to_wake: &mut Vec<Event>) -> bool {
        if self.local_waiters.is_empty() && self.retry_events.is_empty() {
            return false;
        }

        if let Some(excl_waiters) = self.local_waiters.get_mut(&MODE_EXCL) {
            to_wake.push(excl_waiters.pop_front().unwrap());
            if excl_waiters.is_empty() {
                self.local_waiters.remove(&MODE_EXCL);
            }
            self.mode = MODE_EXCL;
            self.count = ZERO_COUNT + 1;
        } else {
            let blocking_mode = self.local_waiters.keys().next().copied();
            let retry_mode = self.retry_events.keys().next().copied();
            match (blocking_mode, retry_mode) {
                (Some(bm), rm) if rm.is_none() || bm <= rm.unwrap() => {
                    // Grab the whole group wanting to share the lock.
                    let (mode, waiters) = self.local_waiters.pop_first().unwrap();
                    self.mode = mode;
                    self.count = ZERO_COUNT + waiters.len() as u32;
                    to_wake.extend(waiters);
                }
                _ => {
                    // Wake one or more folks that will retry their
                    // nonblocking acquires.
                    let (_, retry) = self.retry_events.pop_first().unwrap();
                    to_wake.push(retry);
                }
            }
        }
        true
    }
}

/// The per-node reservation service: replica table, id allocation, and the
/// message protocol.
pub struct RsrvService {
    node: NodeId,
    directory: Arc<dyn Directory>,
    weak_self: Weak<RsrvService>,
    table: Mutex<HashMap<RsrvId, Arc<RsrvImpl>>>,
    next_index: AtomicU64,
}

impl RsrvService {
    pub fn new(node: NodeId, directory: Arc<dyn Directory>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            node,
            directory,
            weak_self: weak_self.clone(),
            table: Mutex::new(HashMap::new()),
            next_index: AtomicU64::new(1),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().unwrap()
    }

    /// The replica for `rsrv`, materialized lazily for ids created elsewhere.
    fn replica(&self, rsrv: RsrvId) -> Arc<RsrvImpl> {
        assert!(rsrv.exists());
        let mut table = self.table.lock().unwrap();
        let rimpl = table
            .entry(rsrv)
            .or_insert_with(|| RsrvImpl::new(rsrv, rsrv.creator_node(), false, Vec::new()))
            .clone();
        debug_assert_eq!(rimpl.id, rsrv);
        rimpl
    }

    /// Create a reservation homed on this node, optionally carrying user
    /// data. Returns [`RsrvId::NO_RSRV`] on id exhaustion.
    pub fn create(&self, data: &[u8]) -> RsrvId {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        if index > RsrvId::MASK_INDEX {
            error!("reservation ids exhausted on node {}", self.node);
            return RsrvId::NO_RSRV;
        }
        let rsrv = RsrvId::new(self.node, index);

        let rimpl = RsrvImpl::new(rsrv, self.node, true, data.to_vec());
        let prev = self.table.lock().unwrap().insert(rsrv, rimpl);
        assert!(prev.is_none());

        info!("reservation created: rsrv={rsrv}");
        rsrv
    }

    /// Acquire, deferred on `wait_on`. With a triggered (or absent)
    /// precondition this acquires immediately; otherwise a continuation
    /// performs the acquire when the precondition fires, and poison on the
    /// precondition poisons the returned token instead.
    pub fn acquire(&self, rsrv: RsrvId, mode: u32, exclusive: bool, wait_on: Event) -> Event {
        if wait_on.has_triggered() {
            let finish = self.acquire_with(rsrv, mode, exclusive, AcquireType::Blocking, Event::NO_EVENT);
            debug!("reservation acquire: rsrv={rsrv} finish={finish}");
            finish
        } else {
            let after = Event::create_fresh();
            debug!("reservation acquire: rsrv={rsrv} finish={after} wait_on={wait_on}");
            wait_on.add_waiter(Box::new(DeferredAcquire {
                svc: self.arc(),
                rsrv,
                mode,
                exclusive,
                after,
            }));
            after
        }
    }

    /// Nonblocking acquire. Returns `NO_EVENT` on success, else a retry
    /// token; the caller must re-attempt with `retry = true` once it fires.
    ///
    /// With an untriggered precondition, only the retry accounting is
    /// registered (the eventual attempt will present itself as a retry) and
    /// the precondition itself is returned.
    pub fn try_acquire(
        &self,
        rsrv: RsrvId,
        retry: bool,
        mode: u32,
        exclusive: bool,
        wait_on: Event,
    ) -> Event {
        if !wait_on.has_triggered() {
            self.acquire_with(
                rsrv,
                mode,
                exclusive,
                AcquireType::NonblockingPlaceholder,
                Event::NO_EVENT,
            );
            debug!("reservation try_acquire: rsrv={rsrv} wait_on={wait_on} finish={wait_on}");
            return wait_on;
        }

        let acquire_type = if retry {
            AcquireType::NonblockingRetry
        } else {
            AcquireType::Nonblocking
        };
        let finish = self.acquire_with(rsrv, mode, exclusive, acquire_type, Event::NO_EVENT);
        debug!("reservation try_acquire: rsrv={rsrv} finish={finish}");
        finish
    }

    /// The acquire state machine. Returns `NO_EVENT` when the lock was
    /// granted and no token was supplied; otherwise the token that fires on
    /// grant (for nonblocking types, on retry opportunity).
    pub fn acquire_with(
        &self,
        rsrv: RsrvId,
        new_mode: u32,
        exclusive: bool,
        acquire_type: AcquireType,
        after: Event,
    ) -> Event {
        let rimpl = self.replica(rsrv);

        // Collapse exclusivity into the mode.
        let new_mode = if exclusive { MODE_EXCL } else { new_mode };

        let mut got_lock = false;
        let mut request_target = None;
        let mut bonus_grants = Vec::new();
        let mut after = after;

        {
            let mut st = rimpl.state.lock().unwrap();

            debug!(
                "local reservation request: rsrv={rsrv} mode={new_mode} acq={acquire_type} \
                 event={after} count={}",
                st.count
            );

            // It'd be bad if somebody tried to take a lock that had been
            // deleted. (The flag is only valid on the creator node.)
            assert!(
                rsrv.creator_node() != self.node || st.in_use,
                "acquire of destroyed reservation {rsrv}"
            );

            // A placeholder only updates the retry accounting.
            if acquire_type == AcquireType::NonblockingPlaceholder {
                *st.retry_count.entry(new_mode).or_insert(0) += 1;
                return Event::NO_EVENT;
            }

            if st.owner == self.node {
                // Case 1: we own the lock. Grantable unless held in another
                // mode or a higher-priority waiter is queued.
                let grantable = st.count == ZERO_COUNT
                    || (st.mode == new_mode
                        && st.mode != MODE_EXCL
                        && st
                            .local_waiters
                            .keys()
                            .next()
                            .map_or(true, |&waiting| waiting > new_mode));
                if grantable {
                    st.mode = new_mode;
                    st.count += 1;
                    trace!("count ++(owner) rsrv={rsrv} count={}", st.count);
                    got_lock = true;

                    // A shared grant lets same-mode waiters and the retry
                    // token for that mode come along for the ride.
                    if new_mode != MODE_EXCL {
                        if let Some(waiters) = st.local_waiters.remove(&new_mode) {
                            bonus_grants.extend(waiters);
                        }
                        if let Some(retry) = st.retry_events.remove(&new_mode) {
                            bonus_grants.push(retry);
                        }
                    }
                }
            } else {
                // Somebody else owns it. Additional sharers with the current
                // mode can still be granted locally.
                if st.count > ZERO_COUNT && st.mode == new_mode {
                    assert_ne!(st.mode, MODE_EXCL);
                    st.count += 1;
                    trace!("count ++(sharer) rsrv={rsrv} count={}", st.count);
                    got_lock = true;
                }

                // Otherwise ask the owner, unless a request is already in
                // flight. The message goes out after the mutex is dropped.
                if !got_lock && !st.requested {
                    debug!(
                        "requesting reservation: rsrv={rsrv} node={} mode={new_mode}",
                        st.owner
                    );
                    request_target = Some(st.owner);
                    st.requested = true;
                }
            }

            debug!(
                "local reservation result: rsrv={rsrv} got={got_lock} req={} count={}",
                st.requested, st.count
            );

            // A successful retry settles one entry of the retry accounting.
            if got_lock && acquire_type == AcquireType::NonblockingRetry {
                let remaining = st
                    .retry_count
                    .get_mut(&new_mode)
                    .expect("nonblocking retry without a registered attempt");
                if *remaining > 1 {
                    *remaining -= 1;
                } else {
                    st.retry_count.remove(&new_mode);
                }
            }

            if !got_lock {
                match acquire_type {
                    AcquireType::Blocking => {
                        if !after.exists() {
                            after = Event::create_fresh();
                        }
                        st.local_waiters.entry(new_mode).or_default().push_back(after);
                    }

                    AcquireType::Nonblocking => {
                        // Record that we'll eventually see a retry of this.
                        *st.retry_count.entry(new_mode).or_insert(0) += 1;

                        assert!(!after.exists(), "nonblocking acquire cannot take a token");
                        after = *st
                            .retry_events
                            .entry(new_mode)
                            .or_insert_with(Event::create_fresh);
                    }

                    AcquireType::NonblockingRetry => {
                        // Same as above, minus the retry-count bump done by
                        // the original attempt.
                        assert!(!after.exists(), "nonblocking acquire cannot take a token");
                        after = *st
                            .retry_events
                            .entry(new_mode)
                            .or_insert_with(Event::create_fresh);
                    }

                    AcquireType::NonblockingPlaceholder => unreachable!(),
                }
            }
        }

        if let Some(target) = request_target {
            self.directory.send(
                target,
                NetMsg::Request(LockRequest {
                    from: self.node,
                    id: rsrv,
                    mode: new_mode,
                }),
            );
        }

        // If we got the lock, trigger the token if we were given one.
        if got_lock && after.exists() {
            after.trigger(false);
        }
        for bonus in bonus_grants {
            debug!("acquire bonus grant: rsrv={rsrv} event={bonus}");
            bonus.trigger(false);
        }

        after
    }

    /// Release, deferred on `wait_on`. A poisoned precondition skips the
    /// release (logged; may hang whoever is queued behind it).
    pub fn release(&self, rsrv: RsrvId, wait_on: Event) {
        if wait_on.has_triggered() {
            debug!("reservation release: rsrv={rsrv}");
            self.release_now(rsrv);
        } else {
            debug!("reservation release: rsrv={rsrv} wait_on={wait_on}");
            wait_on.add_waiter(Box::new(DeferredRelease {
                svc: self.arc(),
                rsrv,
            }));
        }
    }

    /// Return one held share or the exclusive hold. The last holder either
    /// wakes local waiters, hands ownership to a deferred remote requester,
    /// or (on a non-owner replica) returns the count to the owner.
    pub fn release_now(&self, rsrv: RsrvId) {
        let rimpl = self.replica(rsrv);

        // Events are triggered and messages sent only after the mutex is
        // dropped; the woken continuations may re-enter this lock.
        let mut to_wake = Vec::new();
        let mut release_target = None;
        let mut grant = None;
        let mut hook = None;

        {
            let mut st = rimpl.state.lock().unwrap();

            debug!(
                "release: rsrv={rsrv} count={} mode={} owner={}",
                st.count, st.mode, st.owner
            );
            assert!(st.count > ZERO_COUNT, "release of unheld reservation {rsrv}");

            st.count -= 1;
            trace!("count -- rsrv={rsrv} count={}", st.count);

            if st.count > ZERO_COUNT {
                // Not the last holder.
            } else if st.owner != self.node {
                // Case 1: we were sharing somebody else's lock; tell them
                // we're done.
                debug_assert_ne!(st.mode, MODE_EXCL);
                st.mode = 0;
                release_target = Some(st.owner);
            } else if st.select_local_waiters(&mut to_wake) {
                // Case 2: granted to local waiters; wake them below. Remote
                // waiters just lost the tie-break, so re-arm the hand-back
                // hook.
                assert!(!to_wake.is_empty());
                if !st.remote_waiter_mask.is_empty() {
                    hook = st.remote_request_hook.clone();
                }
            } else if !st.remote_waiter_mask.is_empty() && st.retry_count.is_empty() {
                // Case 3: hand ownership to a remote waiter. Blocked while
                // any local nonblocking attempt still expects its retry.
                let new_owner = st.remote_waiter_mask.first().unwrap();
                st.remote_waiter_mask.remove(new_owner);

                debug!("reservation going to remote waiter: rsrv={rsrv} new={new_owner}");

                grant = Some((
                    new_owner,
                    encode_grant_payload(&st.remote_waiter_mask, &st.local_data),
                ));
                st.owner = new_owner;
                st.remote_waiter_mask = NodeSet::new();
            } else {
                // Nobody wants it; sits in available state.
                assert!(st.local_waiters.is_empty());
                assert!(st.retry_events.is_empty());
                assert!(st.remote_waiter_mask.is_empty() || !st.retry_count.is_empty());
            }
        }

        if let Some(target) = release_target {
            debug!("releasing reservation back to owner: rsrv={rsrv} owner={target}");
            self.directory
                .send(target, NetMsg::Release(LockRelease { id: rsrv }));
        }

        if let Some((target, payload)) = grant {
            self.directory
                .send(target, NetMsg::Grant(LockGrant { id: rsrv, mode: 0 }, payload));
        }
        if let Some(hook) = hook {
            hook();
        }

        for event in to_wake {
            debug!("release trigger: rsrv={rsrv} event={event}");
            event.trigger(false);
        }
    }

    /// Conservative check whether this node currently holds the lock in
    /// `mode` (or exclusively, if `excl_ok`).
    pub fn is_locked(&self, rsrv: RsrvId, mode: u32, excl_ok: bool) -> bool {
        let rimpl = self.replica(rsrv);
        let st = rimpl.state.lock().unwrap();
        st.owner == self.node
            && st.count > ZERO_COUNT
            && (st.mode == mode || (st.mode == MODE_EXCL && excl_ok))
    }

    /// Destroy a reservation. Routed to the creator node; there, the replica
    /// is torn down once an exclusive acquire completes.
    pub fn destroy(&self, rsrv: RsrvId) {
        info!("reservation destroyed: rsrv={rsrv}");

        // A reservation is destroyed on the node that created it, regardless
        // of where ownership currently sits.
        if rsrv.creator_node() != self.node {
            self.directory.send(
                rsrv.creator_node(),
                NetMsg::Destroy(DestroyLock {
                    actual: rsrv,
                    dummy: rsrv,
                }),
            );
            return;
        }

        let granted = self.acquire_with(rsrv, 0, true, AcquireType::Blocking, Event::NO_EVENT);
        if !granted.has_triggered() {
            granted.add_waiter(Box::new(DeferredDestroy {
                svc: self.arc(),
                rsrv,
            }));
        } else {
            self.release_replica(rsrv);
        }
    }

    /// Tear down the creator's replica. Requires the destroy invariant: an
    /// exclusive solo hold with no waiters anywhere.
    pub(crate) fn release_replica(&self, rsrv: RsrvId) {
        let rimpl = self.replica(rsrv);
        {
            let mut st = rimpl.state.lock().unwrap();
            assert_eq!(st.owner, self.node);
            assert_eq!(st.count, ZERO_COUNT + 1);
            assert_eq!(st.mode, MODE_EXCL);
            assert!(st.local_waiters.is_empty());
            assert!(st.remote_waiter_mask.is_empty());
            assert!(st.in_use);

            st.local_data = Vec::new();
            st.in_use = false;
            st.count = ZERO_COUNT;
        }
        info!("releasing reservation: rsrv={rsrv}");
        self.table.lock().unwrap().remove(&rsrv);
    }

    /// Install the hook fired when a remote request for `rsrv` is deferred
    /// on this node. Used by a fast reservation to learn that it must hand
    /// the base lock back.
    pub(crate) fn set_remote_request_hook(
        &self,
        rsrv: RsrvId,
        hook: Option<Arc<dyn Fn() + Send + Sync>>,
    ) {
        let rimpl = self.replica(rsrv);
        rimpl.state.lock().unwrap().remote_request_hook = hook;
    }

    fn handle_request(&self, msg: LockRequest) {
        let rimpl = self.replica(msg.id);

        debug!(
            "reservation request: rsrv={} node={} mode={}",
            msg.id, msg.from, msg.mode
        );

        let mut forward_target = None;
        let mut grant = None;
        let mut hook = None;

        {
            let mut st = rimpl.state.lock().unwrap();

            if st.owner != self.node {
                // Case 1: we don't even own the lock any more; pass the
                // request on to whoever we think the owner is.
                debug!(
                    "forwarding reservation request: rsrv={} from={} to={} mode={}",
                    msg.id, msg.from, st.owner, msg.mode
                );
                forward_target = Some(st.owner);
            } else {
                assert!(
                    msg.id.creator_node() != self.node || st.in_use,
                    "request for destroyed reservation {}",
                    msg.id
                );

                if st.count == ZERO_COUNT
                    && st.remote_sharer_mask.is_empty()
                    && st.retry_count.is_empty()
                {
                    // Case 2: idle with no local retry promised; grant to the
                    // original requester.
                    assert!(st.remote_waiter_mask.is_empty());
                    debug!(
                        "granting reservation request: rsrv={} node={} mode={}",
                        msg.id, msg.from, msg.mode
                    );
                    grant = Some((
                        msg.from,
                        encode_grant_payload(&st.remote_waiter_mask, &st.local_data),
                    ));
                    st.owner = msg.from;
                } else {
                    // Case 3: can't grant right now; note the waiter and get
                    // back to work.
                    debug!(
                        "deferring reservation request: rsrv={} node={} mode={} count={} cmode={}",
                        msg.id, msg.from, msg.mode, st.count, st.mode
                    );
                    st.remote_waiter_mask.add(msg.from);
                    hook = st.remote_request_hook.clone();
                }
            }
        }

        if let Some(target) = forward_target {
            self.directory.send(target, NetMsg::Request(msg));
        }
        if let Some((target, payload)) = grant {
            self.directory
                .send(target, NetMsg::Grant(LockGrant { id: msg.id, mode: 0 }, payload));
        }
        if let Some(hook) = hook {
            hook();
        }
    }

    fn handle_release(&self, msg: LockRelease) {
        // A remote sharer drained its local count; return one exclusive
        // count on the owner replica.
        self.release_now(msg.id);
    }

    fn handle_grant(&self, msg: LockGrant, payload: Vec<u8>) {
        debug!(
            "reservation request granted: rsrv={} mode={}",
            msg.id, msg.mode
        );

        let rimpl = self.replica(msg.id);
        let mut to_wake = Vec::new();
        let mut hook = None;

        {
            let mut st = rimpl.state.lock().unwrap();

            // Make sure we were really waiting for this lock.
            assert_ne!(st.owner, self.node, "grant received at owner for {}", msg.id);
            assert!(st.requested, "unsolicited grant for {}", msg.id);

            // Adopt the owner's waiter snapshot and data.
            let (waiters, data) = decode_grant_payload(&payload);
            st.remote_waiter_mask = waiters;
            st.local_data = data.to_vec();

            // Take ownership if given exclusive access.
            if msg.mode == 0 {
                st.owner = self.node;
            }
            st.mode = msg.mode;
            st.requested = false;

            // A grant is only ever sent when at least one local waiter is
            // queued.
            let any_local = st.select_local_waiters(&mut to_wake);
            assert!(any_local, "grant for {} with no local waiters", msg.id);

            // Waiters inherited with the grant expect a hand-back in turn.
            if !st.remote_waiter_mask.is_empty() {
                hook = st.remote_request_hook.clone();
            }
        }

        if let Some(hook) = hook {
            hook();
        }
        for event in to_wake {
            debug!("grant trigger: rsrv={} event={event}", msg.id);
            event.trigger(false);
        }
    }

    fn handle_destroy(&self, msg: DestroyLock) {
        self.destroy(msg.actual);
    }
}

impl MsgHandler for RsrvService {
    fn handle(&self, msg: NetMsg) {
        match msg {
            NetMsg::Request(request) => self.handle_request(request),
            NetMsg::Release(release) => self.handle_release(release),
            NetMsg::Grant(grant, payload) => self.handle_grant(grant, payload),
            NetMsg::Destroy(destroy) => self.handle_destroy(destroy),
        }
    }
}

/// Test-only snapshot of a replica.
#[cfg(test)]
pub(crate) struct ReplicaProbe {
    pub owner: NodeId,
    pub count: u32,
    pub mode: u32,
    pub requested: bool,
    pub in_table: bool,
    pub local_waiter_count: usize,
    pub retry_event_count: usize,
    pub retry_total: u32,
    pub remote_waiters: NodeSet,
    pub local_data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::cluster::{LoopbackMesh, ThreadedMesh};
    use crate::utils::{busy_wait, init_test_logging};

    fn single_node() -> Arc<RsrvService> {
        init_test_logging();
        let mesh = LoopbackMesh::new();
        let svc = RsrvService::new(0, mesh.clone());
        mesh.register(0, svc.clone());
        svc
    }

    fn cluster_of(n: NodeId) -> Vec<Arc<RsrvService>> {
        init_test_logging();
        let mesh = LoopbackMesh::new();
        (0..n)
            .map(|node| {
                let svc = RsrvService::new(node, mesh.clone());
                mesh.register(node, svc.clone());
                svc
            })
            .collect()
    }

    fn blocking(svc: &RsrvService, rsrv: RsrvId, mode: u32, exclusive: bool) -> Event {
        svc.acquire_with(rsrv, mode, exclusive, AcquireType::Blocking, Event::NO_EVENT)
    }

    #[test]
    fn test_solo_exclusive() {
        let svc = single_node();
        let r = svc.create(&[]);
        assert!(r.exists());

        let granted = blocking(&svc, r, 0, true);
        assert_eq!(granted, Event::NO_EVENT);

        let probe = svc.probe(r);
        assert_eq!(probe.owner, 0);
        assert_eq!(probe.count, ZERO_COUNT + 1);
        assert_eq!(probe.mode, MODE_EXCL);

        svc.release_now(r);
        let probe = svc.probe(r);
        assert_eq!(probe.owner, 0);
        assert_eq!(probe.count, ZERO_COUNT);
        assert_eq!(probe.local_waiter_count, 0);
        assert_eq!(probe.retry_event_count, 0);
    }

    #[test]
    fn test_remote_migration_carries_payload() {
        let nodes = cluster_of(2);
        let r = nodes[0].create(&[0xDE, 0xAD]);

        let granted = blocking(&nodes[1], r, 0, true);
        // The loopback mesh resolves the request/grant chain synchronously.
        assert!(granted.has_triggered());

        let probe_b = nodes[1].probe(r);
        assert_eq!(probe_b.owner, 1);
        assert_eq!(probe_b.count, ZERO_COUNT + 1);
        assert_eq!(probe_b.local_data, vec![0xDE, 0xAD]);
        assert!(!probe_b.requested);

        let probe_a = nodes[0].probe(r);
        assert_eq!(probe_a.owner, 1);
        assert_eq!(probe_a.count, ZERO_COUNT);

        nodes[1].release_now(r);
        assert_eq!(nodes[1].probe(r).count, ZERO_COUNT);
        assert_eq!(nodes[1].probe(r).owner, 1);
    }

    #[test]
    fn test_payload_preserved_across_migration_chain() {
        let nodes = cluster_of(3);
        let data = [0x01, 0x7F, 0x80, 0xFF];
        let r = nodes[0].create(&data);

        // Bounce ownership 0 -> 1 -> 2 -> 0 and check the data at each stop.
        for &(src, dst) in &[(0u16, 1u16), (1, 2), (2, 0)] {
            let granted = blocking(&nodes[dst as usize], r, 0, true);
            assert!(granted.has_triggered(), "{src}->{dst} grant");
            assert_eq!(nodes[dst as usize].probe(r).local_data, data);
            nodes[dst as usize].release_now(r);
        }
    }

    #[test]
    fn test_nonblocking_contention_retry() {
        let nodes = cluster_of(2);
        let r = nodes[0].create(&[]);

        assert_eq!(blocking(&nodes[0], r, 0, true), Event::NO_EVENT);

        // B's attempt cannot be granted; it parks a retry and pings A.
        let retry = nodes[1].try_acquire(r, false, 0, true, Event::NO_EVENT);
        assert!(retry.exists());
        assert!(!retry.has_triggered());

        let probe_b = nodes[1].probe(r);
        assert_eq!(probe_b.retry_total, 1);
        assert!(probe_b.requested);
        assert!(nodes[0].probe(r).remote_waiters.contains(1));

        // A releasing hands ownership to B, which wakes the retry token.
        nodes[0].release_now(r);
        assert!(retry.has_triggered());

        let granted = nodes[1].try_acquire(r, true, 0, true, Event::NO_EVENT);
        assert_eq!(granted, Event::NO_EVENT);

        let probe_b = nodes[1].probe(r);
        assert_eq!(probe_b.owner, 1);
        assert_eq!(probe_b.count, ZERO_COUNT + 1);
        assert_eq!(probe_b.retry_total, 0);

        nodes[1].release_now(r);
    }

    #[test]
    fn test_shared_bonus_grant() {
        let svc = single_node();
        let r = svc.create(&[]);

        // Hold exclusively so shared attempts queue up.
        assert_eq!(blocking(&svc, r, 0, true), Event::NO_EVENT);

        let retry = svc.try_acquire(r, false, 7, false, Event::NO_EVENT);
        assert!(!retry.has_triggered());
        assert_eq!(svc.probe(r).retry_total, 1);

        let waiter_b = blocking(&svc, r, 7, false);
        let waiter_c = blocking(&svc, r, 7, false);
        assert!(!waiter_b.has_triggered());
        assert!(!waiter_c.has_triggered());

        // Release grants the whole mode-7 group; the retry token for the
        // mode survives selection.
        svc.release_now(r);
        assert!(waiter_b.has_triggered());
        assert!(waiter_c.has_triggered());
        assert!(!retry.has_triggered());
        let probe = svc.probe(r);
        assert_eq!(probe.mode, 7);
        assert_eq!(probe.count, ZERO_COUNT + 2);

        // A further same-mode acquire sweeps the dangling retry token as a
        // bonus grant.
        assert_eq!(blocking(&svc, r, 7, false), Event::NO_EVENT);
        assert!(retry.has_triggered());
        assert_eq!(svc.probe(r).count, ZERO_COUNT + 3);

        // The nonblocking caller retries and joins the sharers.
        assert_eq!(
            svc.try_acquire(r, true, 7, false, Event::NO_EVENT),
            Event::NO_EVENT
        );
        let probe = svc.probe(r);
        assert_eq!(probe.count, ZERO_COUNT + 4);
        assert_eq!(probe.retry_total, 0);
        assert_eq!(probe.retry_event_count, 0);

        for _ in 0..4 {
            svc.release_now(r);
        }
        assert_eq!(svc.probe(r).count, ZERO_COUNT);
    }

    #[test]
    fn test_exclusive_waiter_preferred() {
        let svc = single_node();
        let r = svc.create(&[]);

        assert_eq!(blocking(&svc, r, 5, false), Event::NO_EVENT);
        let shared_waiter = blocking(&svc, r, 3, false);
        let excl_waiter = blocking(&svc, r, 9, true);
        assert!(!shared_waiter.has_triggered());
        assert!(!excl_waiter.has_triggered());

        // Exclusive waiters outrank every sharer mode.
        svc.release_now(r);
        assert!(excl_waiter.has_triggered());
        assert!(!shared_waiter.has_triggered());
        assert_eq!(svc.probe(r).mode, MODE_EXCL);

        svc.release_now(r);
        assert!(shared_waiter.has_triggered());
        assert_eq!(svc.probe(r).mode, 3);

        svc.release_now(r);
    }

    #[test]
    fn test_lowest_mode_wins_across_waiter_maps() {
        let svc = single_node();
        let r = svc.create(&[]);

        assert_eq!(blocking(&svc, r, 2, false), Event::NO_EVENT);

        // A blocking waiter at mode 9 and a retry waiter at mode 4: the
        // retry token is numerically lower and fires first.
        let blocking_waiter = blocking(&svc, r, 9, false);
        let retry = svc.try_acquire(r, false, 4, false, Event::NO_EVENT);
        assert!(!blocking_waiter.has_triggered());
        assert!(!retry.has_triggered());

        svc.release_now(r);
        assert!(retry.has_triggered());
        assert!(!blocking_waiter.has_triggered());

        // The retry wakes without taking the lock; the count stays idle
        // until the caller re-attempts.
        assert_eq!(svc.probe(r).count, ZERO_COUNT);
        assert_eq!(
            svc.try_acquire(r, true, 4, false, Event::NO_EVENT),
            Event::NO_EVENT
        );
        svc.release_now(r);
        assert!(blocking_waiter.has_triggered());
        svc.release_now(r);
    }

    #[test]
    fn test_migration_blocked_while_retry_pending() {
        let nodes = cluster_of(2);
        let r = nodes[0].create(&[]);

        assert_eq!(blocking(&nodes[0], r, 0, true), Event::NO_EVENT);

        // A local nonblocking attempt fails and is owed a retry.
        let retry = nodes[0].try_acquire(r, false, 0, true, Event::NO_EVENT);
        assert!(!retry.has_triggered());

        // A remote request gets deferred behind the held lock.
        let remote_waiter = blocking(&nodes[1], r, 0, true);
        assert!(!remote_waiter.has_triggered());
        assert!(nodes[0].probe(r).remote_waiters.contains(1));

        // Release wakes the retry but must not migrate ownership while the
        // retry is outstanding.
        nodes[0].release_now(r);
        assert!(retry.has_triggered());
        assert!(!remote_waiter.has_triggered());
        let probe = nodes[0].probe(r);
        assert_eq!(probe.owner, 0);
        assert_eq!(probe.retry_total, 1);
        assert!(probe.remote_waiters.contains(1));

        // The retry lands, releases, and only then does ownership move.
        assert_eq!(
            nodes[0].try_acquire(r, true, 0, true, Event::NO_EVENT),
            Event::NO_EVENT
        );
        nodes[0].release_now(r);
        assert!(remote_waiter.has_triggered());
        assert_eq!(nodes[1].probe(r).owner, 1);

        nodes[1].release_now(r);
    }

    #[test]
    fn test_request_forwarded_to_current_owner() {
        let nodes = cluster_of(3);
        let r = nodes[0].create(&[]);

        // Migrate ownership to node 1.
        assert!(blocking(&nodes[1], r, 0, true).has_triggered());

        // Node 2 still believes the creator owns the lock; its request is
        // forwarded to node 1 and deferred there.
        let waiter = blocking(&nodes[2], r, 0, true);
        assert!(!waiter.has_triggered());
        assert!(nodes[1].probe(r).remote_waiters.contains(2));

        nodes[1].release_now(r);
        assert!(waiter.has_triggered());
        assert_eq!(nodes[2].probe(r).owner, 2);
        nodes[2].release_now(r);
    }

    #[test]
    fn test_release_message_drains_one_count() {
        let svc = single_node();
        let r = svc.create(&[]);
        assert_eq!(blocking(&svc, r, 0, true), Event::NO_EVENT);

        svc.handle(NetMsg::Release(LockRelease { id: r }));
        assert_eq!(svc.probe(r).count, ZERO_COUNT);
    }

    #[test]
    fn test_precondition_no_event_is_not_deferred() {
        let svc = single_node();
        let r = svc.create(&[]);

        // An absent precondition must acquire synchronously, not via a
        // continuation.
        let granted = svc.acquire(r, 0, true, Event::NO_EVENT);
        assert_eq!(granted, Event::NO_EVENT);
        assert_eq!(svc.probe(r).count, ZERO_COUNT + 1);
        assert_eq!(svc.probe(r).local_waiter_count, 0);

        svc.release(r, Event::NO_EVENT);
        assert_eq!(svc.probe(r).count, ZERO_COUNT);
    }

    #[test]
    fn test_deferred_acquire_follows_precondition() {
        let svc = single_node();
        let r = svc.create(&[]);

        let precondition = Event::create_fresh();
        let after = svc.acquire(r, 0, true, precondition);
        assert!(after.exists());
        assert!(!after.has_triggered());
        assert_eq!(svc.probe(r).count, ZERO_COUNT);

        precondition.trigger(false);
        assert!(after.has_triggered());
        assert_eq!(svc.probe(r).count, ZERO_COUNT + 1);

        svc.release_now(r);
    }

    #[test]
    fn test_poisoned_deferred_acquire_poisons_output() {
        let svc = single_node();
        let r = svc.create(&[]);

        let precondition = Event::create_fresh();
        let after = svc.acquire(r, 0, true, precondition);

        precondition.trigger(true);
        assert!(after.has_triggered());
        assert!(after.wait().is_err());

        // The lock itself was never touched.
        assert_eq!(svc.probe(r).count, ZERO_COUNT);
    }

    #[test]
    fn test_poisoned_deferred_release_skips() {
        let svc = single_node();
        let r = svc.create(&[]);
        assert_eq!(blocking(&svc, r, 0, true), Event::NO_EVENT);

        let precondition = Event::create_fresh();
        svc.release(r, precondition);
        precondition.trigger(true);

        // Deliberately still held.
        assert_eq!(svc.probe(r).count, ZERO_COUNT + 1);
        svc.release_now(r);
    }

    #[test]
    fn test_placeholder_balances_retry_accounting() {
        let svc = single_node();
        let r = svc.create(&[]);

        let precondition = Event::create_fresh();
        let finish = svc.try_acquire(r, false, 0, true, precondition);
        assert_eq!(finish, precondition);
        assert_eq!(svc.probe(r).retry_total, 1);

        precondition.trigger(false);
        assert_eq!(
            svc.try_acquire(r, true, 0, true, Event::NO_EVENT),
            Event::NO_EVENT
        );
        assert_eq!(svc.probe(r).retry_total, 0);
        svc.release_now(r);
    }

    #[test]
    fn test_destroy_idle_creator() {
        let svc = single_node();
        let r = svc.create(&[1, 2, 3]);
        svc.destroy(r);
        assert!(!svc.probe(r).in_table);
    }

    #[test]
    fn test_destroy_deferred_until_release() {
        let svc = single_node();
        let r = svc.create(&[]);
        assert_eq!(blocking(&svc, r, 0, true), Event::NO_EVENT);

        svc.destroy(r);
        assert!(svc.probe(r).in_table);

        svc.release_now(r);
        assert!(!svc.probe(r).in_table);
    }

    #[test]
    fn test_destroy_forwarded_to_creator_not_owner() {
        let nodes = cluster_of(2);
        let r = nodes[0].create(&[]);

        // Node 1 takes ownership and holds the lock.
        assert!(blocking(&nodes[1], r, 0, true).has_triggered());

        // Destroy issued where the replica's owner field is stale must still
        // land on the creator, which then pulls the lock back.
        nodes[1].destroy(r);
        assert!(nodes[0].probe(r).in_table);
        assert!(nodes[0].probe(r).requested);

        nodes[1].release_now(r);
        assert!(!nodes[0].probe(r).in_table);
    }

    #[test]
    fn test_is_locked() {
        let svc = single_node();
        let r = svc.create(&[]);

        assert!(!svc.is_locked(r, 5, false));
        assert_eq!(blocking(&svc, r, 5, false), Event::NO_EVENT);
        assert!(svc.is_locked(r, 5, false));
        assert!(!svc.is_locked(r, 3, false));
        svc.release_now(r);

        assert_eq!(blocking(&svc, r, 0, true), Event::NO_EVENT);
        assert!(svc.is_locked(r, 5, true));
        assert!(!svc.is_locked(r, 5, false));
        svc.release_now(r);
    }

    #[test]
    fn test_sharer_count_discipline() {
        let svc = single_node();
        let r = svc.create(&[]);

        for expected in 1..=4u32 {
            assert_eq!(blocking(&svc, r, 7, false), Event::NO_EVENT);
            assert_eq!(svc.probe(r).count, ZERO_COUNT + expected);
        }
        for expected in (0..4u32).rev() {
            svc.release_now(r);
            assert_eq!(svc.probe(r).count, ZERO_COUNT + expected);
        }
    }

    #[test]
    #[should_panic(expected = "release of unheld reservation")]
    fn test_release_of_unheld_panics() {
        let svc = single_node();
        let r = svc.create(&[]);
        svc.release_now(r);
    }

    #[test]
    fn test_randomized_mode_compatibility() {
        use rand::Rng;

        let svc = single_node();
        let r = svc.create(&[]);

        // Slot 0 tracks exclusive holders, slots 1..4 the sharer tags.
        let slots: Arc<[AtomicU32; 4]> = Arc::new(std::array::from_fn(|_| AtomicU32::new(0)));

        const THREADS: usize = 4;
        const ITERS: usize = 100;

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let svc = svc.clone();
            let slots = slots.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERS {
                    let mode: u32 = rng.gen_range(0..4);
                    let exclusive = mode == MODE_EXCL;

                    let granted =
                        svc.acquire_with(r, mode, exclusive, AcquireType::Blocking, Event::NO_EVENT);
                    granted.wait().unwrap();

                    slots[mode as usize].fetch_add(1, Ordering::AcqRel);
                    for (other, slot) in slots.iter().enumerate() {
                        if other != mode as usize {
                            assert_eq!(
                                slot.load(Ordering::Acquire),
                                0,
                                "mode {mode} held alongside mode {other}"
                            );
                        }
                    }
                    if exclusive {
                        assert_eq!(slots[0].load(Ordering::Acquire), 1);
                    }
                    busy_wait(200);
                    slots[mode as usize].fetch_sub(1, Ordering::AcqRel);

                    svc.release_now(r);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let probe = svc.probe(r);
        assert_eq!(probe.count, ZERO_COUNT);
        assert_eq!(probe.local_waiter_count, 0);
        assert_eq!(probe.retry_event_count, 0);
        assert_eq!(probe.retry_total, 0);
    }

    #[test]
    fn test_threaded_mesh_exclusion() {
        init_test_logging();
        let mesh = ThreadedMesh::new();
        let node_a = RsrvService::new(0, mesh.clone());
        let node_b = RsrvService::new(1, mesh.clone());
        mesh.register(0, node_a.clone());
        mesh.register(1, node_b.clone());

        let r = node_a.create(&[]);
        let in_critical = Arc::new(AtomicU32::new(0));
        let total = Arc::new(AtomicU32::new(0));

        const THREADS_PER_NODE: usize = 3;
        const ITERS: usize = 40;

        let mut handles = Vec::new();
        for svc in [node_a.clone(), node_b.clone()] {
            for _ in 0..THREADS_PER_NODE {
                let svc = svc.clone();
                let in_critical = in_critical.clone();
                let total = total.clone();
                handles.push(std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        let granted =
                            svc.acquire_with(r, 0, true, AcquireType::Blocking, Event::NO_EVENT);
                        granted.wait().unwrap();

                        assert_eq!(in_critical.fetch_add(1, Ordering::AcqRel), 0);
                        busy_wait(500);
                        assert_eq!(in_critical.fetch_sub(1, Ordering::AcqRel), 1);
                        total.fetch_add(1, Ordering::Relaxed);

                        svc.release_now(r);
                    }
                }));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            total.load(Ordering::Relaxed),
            (2 * THREADS_PER_NODE * ITERS) as u32
        );
        mesh.shutdown();
    }
}

#[cfg(test)]
impl RsrvService {
    pub(crate) fn probe(&self, rsrv: RsrvId) -> ReplicaProbe {
        let in_table = self.table.lock().unwrap().contains_key(&rsrv);
        let rimpl = self.replica(rsrv);
        let st = rimpl.state.lock().unwrap();
        ReplicaProbe {
            owner: st.owner,
            count: st.count,
            mode: st.mode,
            requested: st.requested,
            in_table,
            local_waiter_count: st.local_waiters.values().map(|w| w.len()).sum(),
            retry_event_count: st.retry_events.len(),
            retry_total: st.retry_count.values().sum(),
            remote_waiters: st.remote_waiter_mask,
            local_data: st.local_data.clone(),
        }
    }
}
