//! The RPC object shared by every receive-path component.
//!
//! Locking model: mutable reassembly and outbound state lives behind the
//! per-RPC mutex ([`RpcInner`]). The scheduling fields the grant engine must
//! read and write while holding only the grant-table lock ([`SchedInfo`]) are
//! atomics outside that mutex, each with a single writer-lock discipline
//! noted on the field. At most one RPC lock is held by a thread at any time,
//! and it may be held while acquiring the socket or grant-table lock, never
//! the other way around.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::interest::Interest;
use crate::msgin::MsgIn;
use crate::peer::Peer;

/// Shared, non-owning reference to an RPC. The socket's RPC table is the
/// owner; scheduling and ready lists hold clones that are dropped when the
/// RPC dies.
pub type RpcHandle = Arc<HomaRpc>;

/// Translate a wire `sender_id` into this host's id space.
#[inline]
pub fn local_id(sender_id: u64) -> u64 {
    sender_id ^ 1
}

/// True if `id` (in local space) was originated by this host as a client.
#[inline]
pub fn is_client_id(id: u64) -> bool {
    id & 1 == 0
}

/// Lifecycle of an RPC, from the receive path's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    /// Transmitting the outbound message; no inbound data seen yet.
    Outgoing,
    /// Receiving the inbound message.
    Incoming,
    /// Freed; waiting for the reaper to reclaim its storage.
    Dead,
}

// Flag bits in `HomaRpc::flags`.
/// The packet queue holds data a receiver should copy out.
pub(crate) const FLAG_PKTS_READY: u32 = 1 << 0;
/// Published to a waiting thread; pins the RPC until the thread claims it.
pub(crate) const FLAG_HANDING_OFF: u32 = 1 << 1;
/// A receiver is copying payload with the RPC lock dropped.
pub(crate) const FLAG_COPYING_TO_USER: u32 = 1 << 2;
/// Linked on a socket ready queue. Never set together with HANDING_OFF.
pub(crate) const FLAG_QUEUED_READY: u32 = 1 << 3;

/// Scheduling fields shared between the data path (RPC lock) and the grant
/// engine (grant-table lock).
#[derive(Debug)]
pub struct SchedInfo {
    /// Message length; -1 until the first DATA packet. Written once, under
    /// the RPC lock.
    pub(crate) length: AtomicI64,
    /// Bytes not yet received. Written by the reassembler under the RPC lock.
    pub(crate) bytes_remaining: AtomicI64,
    /// Bytes the sender may transmit. Written under the RPC lock at init,
    /// under the grant-table lock afterwards.
    pub(crate) granted: AtomicI64,
    /// Cycle timestamp of first insertion on the grantable list. Written
    /// under the grant-table lock.
    pub(crate) birth: AtomicU64,
    /// Last scheduled priority granted to this message.
    pub(crate) priority: AtomicU8,
    /// Message is longer than its unscheduled allowance.
    pub(crate) scheduled: AtomicBool,
    /// Next grant must tell the sender to retransmit everything.
    pub(crate) resend_all: AtomicBool,
    /// Linked on the grantable list. Written under the grant-table lock;
    /// readable with only the RPC lock because links are only added by the
    /// lock holder.
    pub(crate) grantable: AtomicBool,
}

impl SchedInfo {
    pub(crate) fn new() -> Self {
        Self {
            length: AtomicI64::new(-1),
            bytes_remaining: AtomicI64::new(0),
            granted: AtomicI64::new(0),
            birth: AtomicU64::new(0),
            priority: AtomicU8::new(0),
            scheduled: AtomicBool::new(false),
            resend_all: AtomicBool::new(false),
            grantable: AtomicBool::new(false),
        }
    }

    /// Message length, or -1 if unknown.
    #[inline]
    pub fn length(&self) -> i64 {
        self.length.load(Ordering::Relaxed)
    }

    /// Bytes not yet received.
    #[inline]
    pub fn bytes_remaining(&self) -> i64 {
        self.bytes_remaining.load(Ordering::Relaxed)
    }

    /// Bytes the sender is currently authorized to send.
    #[inline]
    pub fn granted(&self) -> i64 {
        self.granted.load(Ordering::Relaxed)
    }
}

/// Minimal view of the outbound half, enough for the GRANT, RESEND and
/// UNKNOWN handlers; actual transmission lives behind
/// [`PacketSink`](crate::transport::PacketSink).
#[derive(Debug, Clone, Copy)]
pub struct MsgOut {
    pub length: i64,
    /// High-water mark of grants received from the remote receiver.
    pub granted: i64,
    /// Offset just past the last byte handed to the transmit path.
    pub next_xmit_offset: i64,
    pub sched_priority: u8,
}

impl MsgOut {
    fn empty() -> Self {
        Self {
            length: -1,
            granted: 0,
            next_xmit_offset: 0,
            sched_priority: 0,
        }
    }
}

/// State behind the per-RPC lock.
pub struct RpcInner {
    pub(crate) state: RpcState,
    pub(crate) msgin: MsgIn,
    /// Outbound view; maintained by the external transmit path.
    pub msgout: MsgOut,
    /// Negative errno recorded by aborts or copy-out failures; 0 if none.
    /// The receive call returns the RPC with this set rather than an `Err`,
    /// so the application can still inspect the RPC.
    pub error: i32,
}

impl RpcInner {
    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> RpcState {
        self.state
    }

    /// Reassembly state of the inbound message.
    #[inline]
    pub fn msgin(&self) -> &MsgIn {
        &self.msgin
    }
}

/// One RPC, client- or server-side.
pub struct HomaRpc {
    /// Id in this host's id space (even = our client request).
    pub id: u64,
    /// Local port the RPC belongs to.
    pub port: u16,
    /// Remote port.
    pub dport: u16,
    pub peer: Arc<Peer>,
    pub(crate) sched: SchedInfo,
    pub(crate) flags: AtomicU32,
    /// Grants being emitted after the grant-table lock was dropped; the
    /// reaper must not reclaim the RPC while nonzero.
    pub(crate) grants_in_progress: AtomicU32,
    /// Ticks with no sign of life from the peer; reset by DATA/GRANT/BUSY.
    /// Consumed by the external timer subsystem.
    pub silent_ticks: AtomicU32,
    dead: AtomicBool,
    /// Thread registered on this specific RPC. Read and written only while
    /// holding the owning socket's lock.
    pub(crate) interest: Mutex<Option<Arc<Interest>>>,
    inner: Mutex<RpcInner>,
}

impl HomaRpc {
    pub(crate) fn new(
        id: u64,
        port: u16,
        dport: u16,
        peer: Arc<Peer>,
        state: RpcState,
    ) -> RpcHandle {
        Arc::new(Self {
            id,
            port,
            dport,
            peer,
            sched: SchedInfo::new(),
            flags: AtomicU32::new(0),
            grants_in_progress: AtomicU32::new(0),
            silent_ticks: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            interest: Mutex::new(None),
            inner: Mutex::new(RpcInner {
                state,
                msgin: MsgIn::new(),
                msgout: MsgOut::empty(),
                error: 0,
            }),
        })
    }

    /// Scheduling counters, readable without the RPC lock.
    #[inline]
    pub fn sched(&self) -> &SchedInfo {
        &self.sched
    }

    /// True once the RPC has been freed. Readable without any lock; only
    /// transitions false -> true.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Caller must hold the RPC lock (enforced by taking the guard).
    pub(crate) fn mark_dead(self: &Arc<Self>, inner: &mut RpcInner) {
        inner.state = RpcState::Dead;
        self.dead.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn test_flags(&self, bits: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bits != 0
    }

    #[inline]
    pub(crate) fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Acquire the RPC lock. The guard owns a handle to the RPC, so it can
    /// outlive the borrow it was created from and be parked in the
    /// dispatcher's lock cache.
    pub fn lock(self: &Arc<Self>) -> LockedRpc {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: the guard borrows the mutex inside `self`; the Arc stored
        // next to it in LockedRpc keeps that mutex alive for at least as
        // long as the (lifetime-erased) guard, and the guard is always
        // dropped before the Arc.
        let guard = unsafe {
            mem::transmute::<MutexGuard<'_, RpcInner>, MutexGuard<'static, RpcInner>>(guard)
        };
        LockedRpc {
            guard: Some(guard),
            rpc: Arc::clone(self),
        }
    }
}

impl std::fmt::Debug for HomaRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomaRpc")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("dport", &self.dport)
            .field("peer", &self.peer.addr)
            .field("dead", &self.is_dead())
            .finish_non_exhaustive()
    }
}

/// An RPC with its lock held. Dereferences to [`RpcInner`].
///
/// The guard slot is `None` only transiently inside [`LockedRpc::unlocked`],
/// which also keeps the struct safe to drop if the unlocked closure panics.
pub struct LockedRpc {
    guard: Option<MutexGuard<'static, RpcInner>>,
    rpc: RpcHandle,
}

impl LockedRpc {
    /// The locked RPC.
    #[inline]
    pub fn rpc(&self) -> &RpcHandle {
        &self.rpc
    }

    /// Run `f` with the RPC lock released, then re-acquire it. Used by
    /// copy-out, which must not hold the lock across user-memory writes.
    pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce(&RpcHandle) -> R) -> R {
        self.guard = None;
        let result = f(&self.rpc);
        let guard = self.rpc.inner.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: same justification as in `HomaRpc::lock`.
        let guard = unsafe {
            mem::transmute::<MutexGuard<'_, RpcInner>, MutexGuard<'static, RpcInner>>(guard)
        };
        self.guard = Some(guard);
        result
    }
}

impl std::fmt::Debug for LockedRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedRpc")
            .field("rpc", &self.rpc)
            .finish_non_exhaustive()
    }
}

impl Deref for LockedRpc {
    type Target = RpcInner;

    #[inline]
    fn deref(&self) -> &RpcInner {
        self.guard.as_ref().expect("RPC lock guard missing")
    }
}

impl DerefMut for LockedRpc {
    #[inline]
    fn deref_mut(&mut self) -> &mut RpcInner {
        self.guard.as_mut().expect("RPC lock guard missing")
    }
}

impl Drop for LockedRpc {
    fn drop(&mut self) {
        // Release the lock before the Arc that owns the mutex.
        self.guard = None;
    }
}
