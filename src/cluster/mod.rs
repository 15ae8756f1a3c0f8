//! Cluster identity and messaging types.
//!
//! Node ids, reservation ids, the node bit-set carried in grant messages,
//! the typed message set, and the directory abstraction through which a node
//! reaches its peers. The directory is assumed to deliver messages reliably
//! and in order per (sender, destination) pair.

use std::fmt;

use bitvec::{field::BitField, prelude as bv};

mod mesh;

pub use mesh::*;

/// Node ID. Currently we use a dense small-integer numbering.
pub type NodeId = u16;

/// Maximum number of nodes representable in a [`NodeSet`].
pub const MAX_NODES: usize = 64;

/// A set of node IDs, packed into one 64-bit word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct NodeSet(bv::BitArr!(for 64, in u64));

impl NodeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self(bv::bitarr![u64, bv::Lsb0; 0; 64])
    }

    pub fn add(&mut self, node: NodeId) {
        debug_assert!((node as usize) < MAX_NODES);
        self.0.set(node as usize, true);
    }

    pub fn remove(&mut self, node: NodeId) {
        self.0.set(node as usize, false);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.0[node as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.0.not_any()
    }

    pub fn len(&self) -> usize {
        self.0.count_ones()
    }

    /// The smallest node ID in the set, if any.
    pub fn first(&self) -> Option<NodeId> {
        self.0.first_one().map(|idx| idx as NodeId)
    }

    /// Iterate over the members in increasing ID order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter_ones().map(|idx| idx as NodeId)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.load_le()
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Reservation ID.
///
/// | Field   | LSB | Len | Description            |
/// | ------- | --: | --: | ---------------------- |
/// | index   |   0 |  48 | Per-creator sequence.  |
/// | creator |  48 |  16 | Creator node ID.       |
///
/// The zero value is reserved for [`RsrvId::NO_RSRV`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct RsrvId(u64);

impl RsrvId {
    /// The null reservation.
    pub const NO_RSRV: RsrvId = RsrvId(0);

    pub(crate) const MASK_INDEX: u64 = crate::macros::range_mask(0..48);
    const MASK_CREATOR: u64 = crate::macros::range_mask(48..64);

    /// Pack a creator node and a per-creator index into an ID.
    /// Index 0 is reserved so that the packed value is never the null ID.
    pub fn new(creator: NodeId, index: u64) -> Self {
        debug_assert!(index != 0, "reservation index 0 is reserved");
        debug_assert!(index & !Self::MASK_INDEX == 0, "reservation index overflow");
        Self(crate::macros::value_at_mask(creator, Self::MASK_CREATOR) | index)
    }

    pub fn exists(self) -> bool {
        self.0 != 0
    }

    /// The node that created this reservation. The creator is the fixed home
    /// for destruction; ownership of the lock itself migrates freely.
    pub fn creator_node(self) -> NodeId {
        ((self.0 & Self::MASK_CREATOR) >> Self::MASK_CREATOR.trailing_zeros()) as NodeId
    }

    pub fn index(self) -> u64 {
        self.0 & Self::MASK_INDEX
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for RsrvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsrvId")
            .field("creator", &self.creator_node())
            .field("index", &self.index())
            .finish()
    }
}

impl fmt::Display for RsrvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsrv:{:#x}", self.0)
    }
}

/// Ask the owner of a reservation for the lock in the given mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// The node that wants the lock (not necessarily the sender; requests
    /// are forwarded when ownership information is stale).
    pub from: NodeId,
    pub id: RsrvId,
    pub mode: u32,
}

/// Return one exclusive count of a remotely-held lock to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRelease {
    pub id: RsrvId,
}

/// Hand the lock (mode 0 = exclusive ownership) to a previously deferred
/// requester. Carries a payload: the owner's pending-waiter snapshot and the
/// reservation's user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub id: RsrvId,
    pub mode: u32,
}

/// Destroy a reservation. Routed to the creator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyLock {
    pub actual: RsrvId,
    /// Reserved.
    pub dummy: RsrvId,
}

/// The typed message set exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetMsg {
    Request(LockRequest),
    Release(LockRelease),
    Grant(LockGrant, Vec<u8>),
    Destroy(DestroyLock),
}

/// Encode a grant payload: `waiter_count: u32`, that many `node: u32`, then
/// the reservation data verbatim.
pub fn encode_grant_payload(waiters: &NodeSet, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 4 * waiters.len() + data.len());
    buf.extend_from_slice(&(waiters.len() as u32).to_ne_bytes());
    for node in waiters.iter() {
        buf.extend_from_slice(&(node as u32).to_ne_bytes());
    }
    buf.extend_from_slice(data);
    buf
}

/// Decode a grant payload. The layout is fixed, so a short buffer is a
/// protocol violation and aborts.
pub fn decode_grant_payload(payload: &[u8]) -> (NodeSet, &[u8]) {
    let read_u32 = |at: usize| -> u32 {
        u32::from_ne_bytes(payload[at..at + 4].try_into().unwrap())
    };

    assert!(payload.len() >= 4, "grant payload too short");
    let waiter_count = read_u32(0) as usize;
    assert!(
        payload.len() >= 4 + 4 * waiter_count,
        "grant payload truncated: {} waiters in {} bytes",
        waiter_count,
        payload.len()
    );

    let mut waiters = NodeSet::new();
    for i in 0..waiter_count {
        waiters.add(read_u32(4 + 4 * i) as NodeId);
    }
    (waiters, &payload[4 + 4 * waiter_count..])
}

/// The node directory: a send channel to every peer.
pub trait Directory: Send + Sync {
    fn send(&self, dest: NodeId, msg: NetMsg);
}

/// Receiving half of a node: invoked by a directory for each delivered
/// message, in per-sender order.
pub trait MsgHandler: Send + Sync {
    fn handle(&self, msg: NetMsg);
}
