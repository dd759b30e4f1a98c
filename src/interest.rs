//! A waiting receiver thread's registration.
//!
//! The handoff between a packet handler and a parked application thread is
//! one release-store of an RPC handle into the interest's ready slot,
//! followed by an unpark. The waiter polls the slot, claims with a swap, and
//! everything else (list unlinking, back-pointer clearing) happens under the
//! socket lock before the store, so a claimed interest can never be handed a
//! second RPC.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};

use crate::rpc::{HomaRpc, RpcHandle};

/// Lock-free single-value slot holding an `Arc<HomaRpc>`.
pub(crate) struct RpcSlot {
    ptr: AtomicPtr<HomaRpc>,
}

impl RpcSlot {
    fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish `rpc` with release semantics. A previously published and
    /// never-claimed handle is dropped (cannot happen under the socket-lock
    /// protocol, but the slot stays leak-free regardless).
    pub(crate) fn publish(&self, rpc: RpcHandle) {
        let raw = Arc::into_raw(rpc) as *mut HomaRpc;
        let old = self.ptr.swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: a non-null value in the slot is always a leaked Arc
            // from a prior publish.
            unsafe { drop(Arc::from_raw(old)) };
        }
    }

    /// True if a handoff has arrived.
    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Claim the published RPC, if any. At most one caller wins.
    pub(crate) fn take(&self) -> Option<RpcHandle> {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            // SAFETY: non-null values are leaked Arcs from `publish`.
            Some(unsafe { Arc::from_raw(raw) })
        }
    }
}

impl Drop for RpcSlot {
    fn drop(&mut self) {
        self.take();
    }
}

/// One thread's declared intent to receive.
///
/// Created per wait call; linked (under the socket lock) onto the socket's
/// request/response interest lists and, for targeted waits, cross-linked
/// with the RPC. Both cross-links are set and cleared together under the
/// socket lock.
pub struct Interest {
    pub(crate) ready: RpcSlot,
    /// Thread to unpark when a handoff lands.
    pub(crate) thread: Thread,
    /// Core the waiter was running on; used to prefer idle-core threads.
    pub(crate) core: usize,
    /// RPC this interest registered on specifically (holds the back edge of
    /// `HomaRpc::interest`). Socket-lock discipline.
    pub(crate) reg_rpc: Mutex<Option<RpcHandle>>,
    // Cheap "might be linked" hints so the wait loop can skip the socket
    // lock on the common path. Maintained under the socket lock.
    pub(crate) on_request_list: AtomicBool,
    pub(crate) on_response_list: AtomicBool,
    pub(crate) has_reg: AtomicBool,
}

impl Interest {
    pub(crate) fn new(core: usize) -> Arc<Self> {
        Arc::new(Self {
            ready: RpcSlot::new(),
            thread: thread::current(),
            core,
            reg_rpc: Mutex::new(None),
            on_request_list: AtomicBool::new(false),
            on_response_list: AtomicBool::new(false),
            has_reg: AtomicBool::new(false),
        })
    }

    /// True if teardown needs the socket lock.
    #[inline]
    pub(crate) fn maybe_linked(&self) -> bool {
        self.has_reg.load(Ordering::Acquire)
            || self.on_request_list.load(Ordering::Acquire)
            || self.on_response_list.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn wake(&self) {
        self.thread.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerTable;
    use crate::rpc::RpcState;
    use std::net::{IpAddr, Ipv4Addr};

    fn rpc(id: u64) -> RpcHandle {
        let peers = PeerTable::new();
        let peer = peers.find(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        HomaRpc::new(id, 1, 2, peer, RpcState::Incoming)
    }

    #[test]
    fn test_publish_and_take() {
        let slot = RpcSlot::new();
        assert!(!slot.is_ready());
        assert!(slot.take().is_none());

        slot.publish(rpc(42));
        assert!(slot.is_ready());
        let claimed = slot.take().unwrap();
        assert_eq!(claimed.id, 42);
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_republish_drops_previous() {
        let first = rpc(2);
        let weak = Arc::downgrade(&first);
        let slot = RpcSlot::new();
        slot.publish(first);
        slot.publish(rpc(4));
        // Only the slot held the first handle; the republish released it.
        assert!(weak.upgrade().is_none());
        assert_eq!(slot.take().unwrap().id, 4);
    }

    #[test]
    fn test_unclaimed_handle_freed_on_drop() {
        let handle = rpc(6);
        let weak = Arc::downgrade(&handle);
        {
            let slot = RpcSlot::new();
            slot.publish(handle);
        }
        assert!(weak.upgrade().is_none());
    }
}
