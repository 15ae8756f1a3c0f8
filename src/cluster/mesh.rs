//! In-process node directories.
//!
//! The real transport is out of scope; these meshes give the protocol the
//! reliable, per-sender-ordered delivery it assumes, inside one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::debug;

use super::{Directory, MsgHandler, NetMsg, NodeId};

/// A directory that delivers each message synchronously on the sender's
/// thread.
///
/// Legal because the protocol never sends while holding a replica mutex, so
/// nested handling cannot re-enter a held lock. Makes multi-node tests fully
/// deterministic: by the time `send` returns, the whole message chain has
/// been processed.
#[derive(Default)]
pub struct LoopbackMesh {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MsgHandler>>>,
}

impl LoopbackMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, handler: Arc<dyn MsgHandler>) {
        let prev = self.handlers.write().unwrap().insert(node, handler);
        assert!(prev.is_none(), "node {node} registered twice");
    }
}

impl Directory for LoopbackMesh {
    fn send(&self, dest: NodeId, msg: NetMsg) {
        debug!("loopback send: dest={dest} msg={msg:?}");
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&dest)
            .cloned()
            .unwrap_or_else(|| panic!("no handler registered for node {dest}"));
        handler.handle(msg);
    }
}

/// A directory with one ordered channel and one dispatcher thread per node.
///
/// This is the shape a real transport binding takes: `send` never blocks on
/// the receiver, and each node consumes its inbox in arrival order.
#[derive(Default)]
pub struct ThreadedMesh {
    inner: Mutex<ThreadedMeshInner>,
}

#[derive(Default)]
struct ThreadedMeshInner {
    senders: HashMap<NodeId, Sender<NetMsg>>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadedMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, handler: Arc<dyn MsgHandler>) {
        let (tx, rx) = crossbeam_channel::unbounded::<NetMsg>();
        let thread = std::thread::Builder::new()
            .name(format!("mesh-node-{node}"))
            .spawn(move || {
                for msg in rx {
                    handler.handle(msg);
                }
            })
            .expect("failed to spawn mesh dispatcher");

        let mut inner = self.inner.lock().unwrap();
        let prev = inner.senders.insert(node, tx);
        assert!(prev.is_none(), "node {node} registered twice");
        inner.threads.push(thread);
    }

    /// Stop all dispatcher threads after their inboxes drain.
    pub fn shutdown(&self) {
        let (senders, threads) = {
            let mut inner = self.inner.lock().unwrap();
            (
                std::mem::take(&mut inner.senders),
                std::mem::take(&mut inner.threads),
            )
        };
        drop(senders);
        for thread in threads {
            thread.join().expect("mesh dispatcher panicked");
        }
    }
}

impl Directory for ThreadedMesh {
    fn send(&self, dest: NodeId, msg: NetMsg) {
        debug!("mesh send: dest={dest} msg={msg:?}");
        let tx = self
            .inner
            .lock()
            .unwrap()
            .senders
            .get(&dest)
            .cloned()
            .unwrap_or_else(|| panic!("no channel registered for node {dest}"));
        tx.send(msg).expect("mesh dispatcher stopped");
    }
}

impl Drop for ThreadedMesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}
