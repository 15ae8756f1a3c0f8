//! Deferred lock actions chained on completion tokens.
//!
//! Each continuation is one-shot: the token machinery consumes it on fire.
//! A poisoned precondition must never touch the lock.

use std::sync::Arc;

use log::{info, warn};

use super::{AcquireType, RsrvService};
use crate::cluster::RsrvId;
use crate::event::{Event, EventWaiter};

/// Acquire once the precondition fires; poison propagates to the output
/// token instead.
pub(crate) struct DeferredAcquire {
    pub svc: Arc<RsrvService>,
    pub rsrv: RsrvId,
    pub mode: u32,
    pub exclusive: bool,
    pub after: Event,
}

impl EventWaiter for DeferredAcquire {
    fn fire(self: Box<Self>, poisoned: bool) {
        if poisoned {
            info!(
                "poisoned deferred acquire skipped: rsrv={} after={}",
                self.rsrv, self.after
            );
            self.after.trigger(true);
        } else {
            self.svc.acquire_with(
                self.rsrv,
                self.mode,
                self.exclusive,
                AcquireType::Blocking,
                self.after,
            );
        }
    }
}

/// Release once the precondition fires. There is no output token, so a
/// poisoned precondition leaves the lock held and anyone queued behind it
/// waiting.
pub(crate) struct DeferredRelease {
    pub svc: Arc<RsrvService>,
    pub rsrv: RsrvId,
}

impl EventWaiter for DeferredRelease {
    fn fire(self: Box<Self>, poisoned: bool) {
        if poisoned {
            warn!(
                "poisoned deferred release skipped - POSSIBLE HANG - rsrv={}",
                self.rsrv
            );
        } else {
            self.svc.release_now(self.rsrv);
        }
    }
}

/// Finish a destroy once its exclusive acquire is granted. A poisoned grant
/// leaks the replica.
pub(crate) struct DeferredDestroy {
    pub svc: Arc<RsrvService>,
    pub rsrv: RsrvId,
}

impl EventWaiter for DeferredDestroy {
    fn fire(self: Box<Self>, poisoned: bool) {
        if poisoned {
            warn!(
                "poisoned deferred destroy skipped - POSSIBLE LEAK - rsrv={}",
                self.rsrv
            );
        } else {
            self.svc.release_replica(self.rsrv);
        }
    }
}
