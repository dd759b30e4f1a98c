//! Per-socket state: RPC tables, ready queues, interest lists, handoff,
//! reaping and aborts.
//!
//! The socket lock guards all of it. It may be taken while holding one RPC
//! lock (handoff, registration, free); it is never held while acquiring an
//! RPC lock or the grant-table lock.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::BufferPool;
use crate::error::{HomaError, Result};
use crate::interest::Interest;
use crate::metrics::inc_metric;
use crate::msgin::msgin_init;
use crate::packet::Ack;
use crate::rpc::{
    is_client_id, HomaRpc, LockedRpc, RpcHandle, RpcState, FLAG_COPYING_TO_USER,
    FLAG_HANDING_OFF, FLAG_QUEUED_READY,
};
use crate::timing;
use crate::Homa;

/// Called (under the socket lock) when a ready RPC is queued with no thread
/// waiting; the poll/select integration point. Must not call back into the
/// socket.
pub type DataReadyHook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct SockState {
    client_rpcs: HashMap<u64, RpcHandle>,
    server_rpcs: HashMap<(IpAddr, u16, u64), RpcHandle>,
    pub(crate) ready_requests: VecDeque<RpcHandle>,
    pub(crate) ready_responses: VecDeque<RpcHandle>,
    pub(crate) request_interests: VecDeque<Arc<Interest>>,
    pub(crate) response_interests: VecDeque<Arc<Interest>>,
    dead: Vec<RpcHandle>,
    pub(crate) shutdown: bool,
    next_client_id: u64,
    data_ready_hook: Option<DataReadyHook>,
}

/// One Homa port.
pub struct HomaSocket {
    pub port: u16,
    pub(crate) homa: Arc<Homa>,
    pub(crate) state: Mutex<SockState>,
    /// Mirror of the shutdown bit, for lock-free polling in wait loops.
    shutdown: AtomicBool,
    /// Packet buffers queued on dead RPCs, awaiting the reaper.
    dead_buffs: AtomicUsize,
}

impl HomaSocket {
    /// Create a socket on `port` and register it with the protocol instance.
    pub fn new(homa: &Arc<Homa>, port: u16) -> Arc<Self> {
        let sock = Arc::new(Self {
            port,
            homa: Arc::clone(homa),
            state: Mutex::new(SockState {
                client_rpcs: HashMap::new(),
                server_rpcs: HashMap::new(),
                ready_requests: VecDeque::new(),
                ready_responses: VecDeque::new(),
                request_interests: VecDeque::new(),
                response_interests: VecDeque::new(),
                dead: Vec::new(),
                shutdown: false,
                next_client_id: 2,
                data_ready_hook: None,
            }),
            shutdown: AtomicBool::new(false),
            dead_buffs: AtomicUsize::new(0),
        });
        homa.register_socket(&sock);
        sock
    }

    /// The protocol instance this socket belongs to.
    #[inline]
    pub fn homa(&self) -> &Arc<Homa> {
        &self.homa
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Packet buffers held by dead RPCs.
    #[inline]
    pub fn dead_buffs(&self) -> usize {
        self.dead_buffs.load(Ordering::Relaxed)
    }

    /// Install the poll/select notification hook.
    pub fn set_data_ready_hook(&self, hook: DataReadyHook) {
        self.lock_state().data_ready_hook = Some(hook);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Shut the socket down: new waits fail with `Shutdown`, in-flight waits
    /// observe it on their next iteration. RPC teardown is the caller's
    /// choice via [`HomaSocket::abort_rpcs`].
    pub fn shutdown(&self) {
        let waiters: Vec<Arc<Interest>> = {
            let mut state = self.lock_state();
            state.shutdown = true;
            self.shutdown.store(true, Ordering::Release);
            state
                .request_interests
                .iter()
                .chain(state.response_interests.iter())
                .cloned()
                .collect()
        };
        for interest in waiters {
            interest.wake();
        }
    }

    /// Start a client RPC toward `peer_addr:dport` with a `length`-byte
    /// outbound message. The outbound path itself is external; this exists
    /// so responses have something to land on.
    pub fn new_client_rpc(
        self: &Arc<Self>,
        peer_addr: IpAddr,
        dport: u16,
        length: i64,
    ) -> Result<RpcHandle> {
        let peer = self.homa.peers.find(peer_addr);
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(HomaError::Shutdown);
        }
        let id = state.next_client_id;
        state.next_client_id += 2;
        let rpc = HomaRpc::new(id, self.port, dport, peer, RpcState::Outgoing);
        {
            let mut locked = rpc.lock();
            locked.msgout.length = length;
            locked.msgout.granted = self.homa.config.unsched_bytes.min(length);
        }
        state.client_rpcs.insert(id, Arc::clone(&rpc));
        Ok(rpc)
    }

    /// Look up a client RPC by local id. Returns an unlocked handle; the
    /// caller locks and must tolerate finding it dead.
    pub fn find_client(&self, id: u64) -> Option<RpcHandle> {
        self.lock_state().client_rpcs.get(&id).cloned()
    }

    /// Look up a server RPC.
    pub fn find_server(&self, addr: IpAddr, sport: u16, id: u64) -> Option<RpcHandle> {
        self.lock_state().server_rpcs.get(&(addr, sport, id)).cloned()
    }

    /// Find the server RPC for an inbound DATA packet, creating it on first
    /// contact. Returns `(rpc, created)`; `None` if the socket is shut down.
    pub(crate) fn find_or_create_server(
        self: &Arc<Self>,
        addr: IpAddr,
        sport: u16,
        id: u64,
        message_length: i64,
        incoming: i64,
    ) -> Option<(RpcHandle, bool)> {
        // Resolve the peer before taking the socket lock; the peer table
        // has its own lock and the two never nest.
        let peer = self.homa.peers.find(addr);
        let mut state = self.lock_state();
        if state.shutdown {
            return None;
        }
        if let Some(rpc) = state.server_rpcs.get(&(addr, sport, id)) {
            return Some((Arc::clone(rpc), false));
        }
        let rpc = HomaRpc::new(id, self.port, sport, peer, RpcState::Incoming);
        {
            // Freshly created, uncontended.
            let mut locked = rpc.lock();
            msgin_init(
                &rpc,
                &mut locked,
                message_length,
                incoming,
                self.homa.pool.as_ref(),
            );
        }
        state.server_rpcs.insert((addr, sport, id), Arc::clone(&rpc));
        Some((rpc, true))
    }

    /// Free an RPC: mark it dead, drop it from every lookup and scheduling
    /// structure, and queue its storage for the reaper. Caller holds the RPC
    /// lock.
    pub fn rpc_free(&self, locked: &mut LockedRpc) {
        if locked.state == RpcState::Dead {
            return;
        }
        let rpc = Arc::clone(locked.rpc());
        let homa = &self.homa;

        homa.remove_from_grantable(&rpc);

        // The sender may still owe us granted bytes; give the capacity back.
        if locked.state == RpcState::Incoming && rpc.sched.length() >= 0 {
            let outstanding =
                rpc.sched.granted() - (rpc.sched.length() - rpc.sched.bytes_remaining());
            if outstanding > 0 {
                homa.grant
                    .total_incoming
                    .fetch_sub(outstanding, Ordering::AcqRel);
            }
        }

        rpc.mark_dead(locked);
        log::debug!("freeing rpc id {}, port {}", rpc.id, self.port);

        let mut state = self.lock_state();
        if is_client_id(rpc.id) {
            state.client_rpcs.remove(&rpc.id);
        } else {
            state.server_rpcs.remove(&(rpc.peer.addr, rpc.dport, rpc.id));
        }
        self.dead_buffs
            .fetch_add(locked.msgin.packets.len(), Ordering::Relaxed);
        state.dead.push(rpc);
        // A queued ready entry, if any, stays in place; claimants skip dead
        // RPCs.
    }

    /// Reclaim storage from dead RPCs, at most `limit` packet buffers.
    /// Returns the number reclaimed; 0 means nothing reapable remains.
    pub fn reap(&self, limit: usize) -> usize {
        let candidates: Vec<RpcHandle> = {
            let state = self.lock_state();
            state.dead.iter().cloned().collect()
        };
        if candidates.is_empty() {
            return 0;
        }

        let mut freed = 0usize;
        let mut done: Vec<RpcHandle> = Vec::new();
        for rpc in candidates {
            if freed >= limit {
                break;
            }
            // Pinned RPCs are not safe to dismantle yet.
            if rpc.grants_in_progress.load(Ordering::Acquire) != 0
                || rpc.test_flags(FLAG_COPYING_TO_USER | FLAG_HANDING_OFF)
            {
                continue;
            }
            let mut locked = rpc.lock();
            // A pin can appear between the check above and the lock
            // acquisition: copy-out raises COPYING_TO_USER under the lock
            // and then drops the lock for the copy itself, handing it to
            // whoever is blocked on it. Check again now that we hold it, or
            // the pages could be released mid-copy.
            if rpc.grants_in_progress.load(Ordering::Acquire) != 0
                || rpc.test_flags(FLAG_COPYING_TO_USER | FLAG_HANDING_OFF)
            {
                continue;
            }
            while freed < limit {
                if locked.msgin.packets.pop_front().is_none() {
                    break;
                }
                freed += 1;
            }
            if locked.msgin.packets.is_empty() {
                self.homa.pool.release(rpc.id);
                if is_client_id(rpc.id) {
                    self.add_peer_ack(&rpc);
                }
                drop(locked);
                done.push(rpc);
            }
        }

        if freed > 0 || !done.is_empty() {
            let mut state = self.lock_state();
            for rpc in &done {
                state.dead.retain(|d| !Arc::ptr_eq(d, rpc));
            }
            self.dead_buffs.fetch_sub(freed, Ordering::Relaxed);
            inc_metric!(self.homa.metrics.reaped_buffs, freed as u64);
        }
        freed
    }

    /// The peer can forget a client RPC once we have fully reaped it; queue
    /// the ack, emitting a full batch immediately.
    fn add_peer_ack(&self, rpc: &RpcHandle) {
        let ack = Ack {
            client_id: rpc.id,
            client_port: rpc.port,
            server_port: rpc.dport,
        };
        if let Some(batch) = rpc.peer.add_ack(ack) {
            self.homa.xmit_ack_batch(&rpc.peer, self.port, rpc.dport, batch);
        }
    }

    /// Hand a ready RPC to a receiver: a thread registered on this RPC, a
    /// category waiter, or the socket's ready queue. Caller holds the RPC
    /// lock; the socket lock is taken here.
    pub(crate) fn handoff(&self, locked: &mut LockedRpc) {
        let mut state = self.lock_state();
        self.handoff_locked(&mut state, locked);
    }

    pub(crate) fn handoff_locked(&self, state: &mut SockState, locked: &mut LockedRpc) {
        let rpc = Arc::clone(locked.rpc());
        // At most one outstanding handoff per RPC.
        if rpc.test_flags(FLAG_HANDING_OFF | FLAG_QUEUED_READY) {
            return;
        }

        let target = rpc
            .interest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .or_else(|| {
                if is_client_id(rpc.id) {
                    self.choose_interest(&state.response_interests)
                } else {
                    self.choose_interest(&state.request_interests)
                }
            });

        let Some(interest) = target else {
            // Nobody waiting: queue and let poll/select know.
            rpc.set_flags(FLAG_QUEUED_READY);
            if is_client_id(rpc.id) {
                state.ready_responses.push_back(rpc);
                inc_metric!(self.homa.metrics.responses_queued);
            } else {
                state.ready_requests.push_back(rpc);
                inc_metric!(self.homa.metrics.requests_queued);
            }
            if let Some(hook) = &state.data_ready_hook {
                hook();
            }
            return;
        };

        // The flag must be up before the interest is cleared, or a waiter
        // that finds its interest clear could race the reaper.
        rpc.set_flags(FLAG_HANDING_OFF);
        inc_metric!(self.homa.metrics.handoffs_thread_waiting);
        log::trace!(
            "handing off id {} to thread on core {}",
            rpc.id,
            interest.core
        );
        interest.ready.publish(rpc);

        // Steer transport work away from the core that is about to wake.
        self.homa.cores.note_app_active(interest.core);

        // Clearing the cross-links here saves the waking thread a trip
        // through the socket lock and makes the interest unmatchable for any
        // further RPC.
        self.clear_interest_links(state, &interest);
        interest.wake();
    }

    /// Prefer the first waiter whose core has seen no transport work within
    /// the busy horizon; fall back to the first waiter.
    fn choose_interest(&self, list: &VecDeque<Arc<Interest>>) -> Option<Arc<Interest>> {
        let busy_time = timing::rdtsc().saturating_sub(self.homa.config.busy_cycles);
        let mut backup: Option<Arc<Interest>> = None;
        for interest in list {
            if self.homa.cores.last_active(interest.core) < busy_time {
                if backup.is_some() {
                    inc_metric!(self.homa.metrics.handoffs_alt_thread);
                }
                return Some(Arc::clone(interest));
            }
            if backup.is_none() {
                backup = Some(Arc::clone(interest));
            }
        }
        backup
    }

    /// Detach `interest` from everything, under the socket lock.
    pub(crate) fn clear_interest_links(&self, state: &mut SockState, interest: &Arc<Interest>) {
        if let Some(reg) = interest
            .reg_rpc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let mut slot = reg.interest.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|i| Arc::ptr_eq(i, interest)) {
                *slot = None;
            }
        }
        interest.has_reg.store(false, Ordering::Release);
        if interest.on_request_list.swap(false, Ordering::AcqRel) {
            state
                .request_interests
                .retain(|i| !Arc::ptr_eq(i, interest));
        }
        if interest.on_response_list.swap(false, Ordering::AcqRel) {
            state
                .response_interests
                .retain(|i| !Arc::ptr_eq(i, interest));
        }
    }

    /// Abort one client RPC: record the error and wake a receiver so the
    /// application observes it. Caller holds the RPC lock.
    pub fn rpc_abort(&self, locked: &mut LockedRpc, error: i32) {
        self.homa.remove_from_grantable(locked.rpc());
        locked.error = error;
        let mut state = self.lock_state();
        if !state.shutdown {
            self.handoff_locked(&mut state, locked);
        }
    }

    /// Abort every client RPC on this socket. A nonzero `error` marks them
    /// complete so receivers observe it; zero frees them silently.
    pub fn abort_rpcs(&self, error: i32) {
        let clients: Vec<RpcHandle> = {
            let state = self.lock_state();
            state.client_rpcs.values().cloned().collect()
        };
        for rpc in clients {
            let mut locked = rpc.lock();
            if locked.state == RpcState::Dead {
                continue;
            }
            log::debug!("aborting rpc id {} on port {}, error {}", rpc.id, self.port, error);
            if error != 0 {
                self.rpc_abort(&mut locked, error);
            } else {
                self.rpc_free(&mut locked);
            }
        }
    }

    /// Abort all RPCs to/from `addr` (optionally restricted to server port
    /// `port`): client RPCs surface `error`, server RPCs are freed.
    pub(crate) fn abort_peer_rpcs(&self, addr: IpAddr, port: u16, error: i32) {
        let rpcs: Vec<RpcHandle> = {
            let state = self.lock_state();
            state
                .client_rpcs
                .values()
                .chain(state.server_rpcs.values())
                .filter(|rpc| rpc.peer.addr == addr)
                .filter(|rpc| port == 0 || rpc.dport == port)
                .cloned()
                .collect()
        };
        for rpc in rpcs {
            let mut locked = rpc.lock();
            if locked.state == RpcState::Dead {
                continue;
            }
            if is_client_id(rpc.id) {
                self.rpc_abort(&mut locked, error);
            } else {
                self.rpc_free(&mut locked);
            }
        }
    }

    /// Take the first queued ready RPC of a category, clearing its queue
    /// link. Dead entries are claimed too; the wait loop discards them.
    pub(crate) fn pop_ready(queue: &mut VecDeque<RpcHandle>) -> Option<RpcHandle> {
        let rpc = queue.pop_front()?;
        rpc.clear_flags(FLAG_QUEUED_READY);
        Some(rpc)
    }

    /// True if any ready RPC is still queued.
    pub(crate) fn more_ready(state: &SockState) -> bool {
        !state.ready_requests.is_empty() || !state.ready_responses.is_empty()
    }

    pub(crate) fn notify_data_ready(state: &SockState) {
        if let Some(hook) = &state.data_ready_hook {
            hook();
        }
    }
}

impl Drop for HomaSocket {
    fn drop(&mut self) {
        self.homa.unregister_socket();
    }
}
