//! Inbound packet dispatch.
//!
//! One entry point routes every packet type to its handler, locating (or,
//! for server-bound DATA, creating) the target RPC first. Ingress context
//! must never block: nothing here sleeps, and the RPC lock is never held
//! across anything that could.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::metrics::inc_metric;
use crate::msgin::{msgin_init, DataSegment};
use crate::packet::{Ack, CommonHeader, Packet, PacketBody, MAX_ACKS_PER_PKT};
use crate::peer::Peer;
use crate::rpc::{is_client_id, local_id, LockedRpc, RpcState, FLAG_PKTS_READY};
use crate::socket::HomaSocket;
use crate::Homa;

/// One-entry cache of a locked RPC, retained across dispatch calls so a
/// burst of packets for one RPC locks it once.
///
/// Contract: the dispatcher may keep the previously locked RPC between
/// calls; any transition to a different RPC releases the old lock first, and
/// the cache is always released before acquiring any *other* RPC's lock
/// (ack processing, reaping).
#[derive(Default)]
pub struct LockCache {
    cached: Option<LockedRpc>,
}

impl LockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached lock, if any.
    pub fn release(&mut self) {
        self.cached = None;
    }

    /// True if the cache already holds the RPC a packet from
    /// `(src, sport)` with local id `id` targets.
    fn matches(&self, id: u64, src: IpAddr, sport: u16) -> bool {
        self.cached.as_ref().is_some_and(|locked| {
            let rpc = locked.rpc();
            rpc.id == id && rpc.peer.addr == src && rpc.dport == sport
        })
    }

    fn save(&mut self, locked: LockedRpc) {
        self.cached = Some(locked);
    }

    fn locked(&mut self) -> Option<&mut LockedRpc> {
        self.cached.as_mut()
    }
}

impl Homa {
    /// Parse and dispatch a batch of raw datagrams arriving on `sock`, then
    /// settle the incoming-byte accounting and issue any grants that became
    /// possible. This is the whole ingress entry point for one poll cycle.
    pub fn deliver<I>(&self, sock: &Arc<HomaSocket>, core: usize, frames: I)
    where
        I: IntoIterator<Item = (IpAddr, Vec<u8>)>,
    {
        self.cores.note_active(core);
        let mut lcache = LockCache::new();
        let mut delta = 0i64;
        for (src, bytes) in frames {
            match Packet::parse(src, &bytes) {
                Ok(pkt) => self.dispatch(sock, pkt, &mut lcache, &mut delta),
                Err(err) => {
                    inc_metric!(self.metrics.unknown_packet_types);
                    log::debug!("dropping undecodable packet from {}: {}", src, err);
                }
            }
        }
        lcache.release();
        if delta != 0 {
            self.grant.total_incoming.fetch_add(delta, Ordering::AcqRel);
            self.send_grants();
        }
    }

    /// Route one parsed packet. `delta` accumulates changes owed to
    /// `total_incoming`; the caller applies them (and calls `send_grants`)
    /// once per batch.
    pub fn dispatch(
        &self,
        sock: &Arc<HomaSocket>,
        pkt: Packet,
        lcache: &mut LockCache,
        delta: &mut i64,
    ) {
        let id = local_id(pkt.common.sender_id);

        // A piggybacked ack names a different RPC; its lock would nest with
        // ours, so release before processing it.
        if let PacketBody::Data { ack, .. } = &pkt.body {
            if !ack.is_empty() {
                lcache.release();
                self.rpc_acked(sock, pkt.src, ack);
            }
        }

        if !lcache.matches(id, pkt.src, pkt.common.sport) {
            lcache.release();
            let handle = if !is_client_id(id) {
                if let PacketBody::Data {
                    message_length,
                    incoming,
                    ..
                } = &pkt.body
                {
                    match sock.find_or_create_server(
                        pkt.src,
                        pkt.common.sport,
                        id,
                        *message_length,
                        *incoming,
                    ) {
                        Some((rpc, created)) => {
                            if created {
                                *delta += rpc.sched.granted();
                            }
                            Some(rpc)
                        }
                        None => {
                            inc_metric!(self.metrics.server_cant_create_rpcs);
                            None
                        }
                    }
                } else {
                    sock.find_server(pkt.src, pkt.common.sport, id)
                }
            } else {
                sock.find_client(id)
            };
            if let Some(rpc) = handle {
                let locked = rpc.lock();
                if locked.state != RpcState::Dead {
                    lcache.save(locked);
                }
            }
        }

        match lcache.locked() {
            None => {
                // Some control types are meaningful without an RPC.
                match &pkt.body {
                    PacketBody::Cutoffs { .. }
                    | PacketBody::NeedAck
                    | PacketBody::Ack { .. }
                    | PacketBody::Resend { .. } => {}
                    _ => {
                        log::debug!(
                            "discarding packet for unknown RPC id {}, peer {}:{}",
                            id,
                            pkt.src,
                            pkt.common.sport
                        );
                        // A GRANT straggling in after a server RPC completed
                        // is routine; don't count those.
                        if !matches!(pkt.body, PacketBody::Grant { .. }) || is_client_id(id) {
                            inc_metric!(self.metrics.unknown_rpcs);
                        }
                        return;
                    }
                }
            }
            Some(locked) => {
                if matches!(
                    pkt.body,
                    PacketBody::Data { .. } | PacketBody::Grant { .. } | PacketBody::Busy
                ) {
                    locked.rpc().silent_ticks.store(0, Ordering::Relaxed);
                }
                locked
                    .rpc()
                    .peer
                    .outstanding_resends
                    .store(0, Ordering::Relaxed);
            }
        }

        match pkt.body {
            PacketBody::Data {
                message_length,
                incoming,
                cutoff_version,
                retransmit,
                offset,
                payload,
                ..
            } => {
                if let Some(locked) = lcache.locked() {
                    self.data_pkt(
                        sock,
                        locked,
                        message_length,
                        incoming,
                        cutoff_version,
                        retransmit,
                        offset,
                        payload,
                        delta,
                    );
                }
                // If neither receivers nor the timer keep up with reaping,
                // the dispatch path has to pitch in.
                if sock.dead_buffs() >= 2 * self.config.dead_buffs_limit {
                    lcache.release();
                    sock.reap(self.config.reap_limit);
                }
            }
            PacketBody::Grant {
                offset,
                priority,
                resend_all,
            } => {
                if let Some(locked) = lcache.locked() {
                    self.grant_pkt(locked, offset, priority, resend_all);
                }
            }
            PacketBody::Resend {
                offset,
                length,
                priority,
            } => self.resend_pkt(&pkt.common, pkt.src, lcache, offset, length, priority),
            PacketBody::Unknown => {
                if let Some(locked) = lcache.locked() {
                    self.unknown_pkt(sock, locked);
                }
            }
            // Nothing to do beyond the silent-ticks reset above.
            PacketBody::Busy => {}
            PacketBody::Cutoffs {
                unsched_cutoffs,
                cutoff_version,
            } => {
                let peer = self.peers.find(pkt.src);
                peer.set_cutoffs(&unsched_cutoffs, cutoff_version);
            }
            PacketBody::NeedAck => self.need_ack_pkt(&pkt.common, pkt.src, lcache),
            PacketBody::Ack { acks } => {
                if let Some(locked) = lcache.locked() {
                    sock.rpc_free(locked);
                }
                lcache.release();
                for ack in &acks {
                    self.rpc_acked(sock, pkt.src, ack);
                }
            }
        }
    }

    /// DATA: initialize the inbound message if this is its first packet,
    /// integrate the segment, post a handoff when new data queued, re-rank
    /// on the grant list, and refresh the sender's cutoffs if stale.
    #[allow(clippy::too_many_arguments)]
    fn data_pkt(
        &self,
        sock: &Arc<HomaSocket>,
        locked: &mut LockedRpc,
        message_length: i64,
        incoming: i64,
        cutoff_version: u16,
        retransmit: bool,
        offset: i64,
        payload: Vec<u8>,
        delta: &mut i64,
    ) {
        let rpc = Arc::clone(locked.rpc());

        if locked.state != RpcState::Incoming {
            if is_client_id(rpc.id) {
                if locked.state != RpcState::Outgoing {
                    inc_metric!(self.metrics.packet_discards);
                    return;
                }
                inc_metric!(self.metrics.responses_received);
                locked.state = RpcState::Incoming;
                log::trace!(
                    "first response packet for id {}, length {}, unscheduled {}",
                    rpc.id,
                    message_length,
                    incoming
                );
                msgin_init(&rpc, locked, message_length, incoming, self.pool.as_ref());
                *delta += rpc.sched.granted();
            } else {
                // Server RPCs are born Incoming; anything else is a stray.
                inc_metric!(self.metrics.packet_discards);
                return;
            }
        }

        if locked.msgin.num_bpages == 0 {
            // Keeping packets we can't land would just bloat buffer usage.
            inc_metric!(self.metrics.dropped_data_no_bufs, payload.len() as u64);
            return;
        }

        let old_remaining = rpc.sched.bytes_remaining();
        let length = payload.len() as i64;
        let kept = locked.msgin.add_packet(
            &rpc.sched,
            DataSegment {
                offset,
                length,
                retransmit,
                payload,
            },
        );
        if kept {
            if retransmit {
                inc_metric!(self.metrics.resent_packets_used);
            }
        } else {
            log::debug!(
                "discarding segment for id {}: offset {}, length {}, retransmit {}",
                rpc.id,
                offset,
                length,
                retransmit
            );
            if retransmit {
                inc_metric!(self.metrics.resent_discards);
            } else {
                inc_metric!(self.metrics.packet_discards);
            }
        }
        *delta -= old_remaining - rpc.sched.bytes_remaining();

        if !locked.msgin.packets.is_empty() && !rpc.test_flags(FLAG_PKTS_READY) {
            rpc.set_flags(FLAG_PKTS_READY);
            sock.handoff(locked);
        }

        if rpc.sched.scheduled.load(Ordering::Relaxed) {
            self.check_grantable(&rpc);
        }

        if cutoff_version != self.config.cutoff_version && rpc.peer.may_send_cutoffs() {
            self.sink.xmit_control(
                &rpc.peer,
                reply_common(&rpc),
                PacketBody::Cutoffs {
                    unsched_cutoffs: self.config.unsched_cutoffs,
                    cutoff_version: self.config.cutoff_version,
                },
            );
        }
    }

    /// GRANT: advance the outbound high-water mark; honor `resend_all`.
    fn grant_pkt(&self, locked: &mut LockedRpc, offset: i64, priority: u8, resend_all: bool) {
        if locked.state != RpcState::Outgoing {
            return;
        }
        let rpc = Arc::clone(locked.rpc());
        log::trace!(
            "grant for id {}: offset {}, priority {}",
            rpc.id,
            offset,
            priority
        );
        if resend_all {
            self.sink
                .resend_data(&rpc.peer, rpc.id, 0..locked.msgout.next_xmit_offset, priority);
        }
        if offset > locked.msgout.granted {
            locked.msgout.granted = offset.min(locked.msgout.length);
        }
        locked.msgout.sched_priority = priority;
    }

    /// RESEND: retransmit the requested range, or answer BUSY when we have
    /// nothing (or choose not) to send. Unknown RPC gets UNKNOWN so the peer
    /// can restart.
    fn resend_pkt(
        &self,
        common: &CommonHeader,
        src: IpAddr,
        lcache: &mut LockCache,
        offset: i64,
        length: i64,
        priority: u8,
    ) {
        let Some(locked) = lcache.locked() else {
            let peer = self.peers.find(src);
            self.sink
                .xmit_control(&peer, echo_common(common), PacketBody::Unknown);
            return;
        };
        let rpc = Arc::clone(locked.rpc());

        if !is_client_id(rpc.id) && locked.state != RpcState::Outgoing {
            // Still working on the response; tell the client we're alive.
            self.sink
                .xmit_control(&rpc.peer, reply_common(&rpc), PacketBody::Busy);
            return;
        }
        if locked.msgout.next_xmit_offset < locked.msgout.granted {
            // We chose not to transmit yet; a resend would be wasted.
            self.sink
                .xmit_control(&rpc.peer, reply_common(&rpc), PacketBody::Busy);
        } else if length == 0 {
            // Liveness probe.
            self.sink
                .xmit_control(&rpc.peer, reply_common(&rpc), PacketBody::Busy);
        } else {
            self.sink
                .resend_data(&rpc.peer, rpc.id, offset..offset + length, priority);
        }
    }

    /// UNKNOWN: the peer has no state for this RPC. A client restarts its
    /// request from byte 0; a server just discards its copy.
    fn unknown_pkt(&self, sock: &Arc<HomaSocket>, locked: &mut LockedRpc) {
        let rpc = Arc::clone(locked.rpc());
        if is_client_id(rpc.id) {
            if locked.state == RpcState::Outgoing {
                let priority = rpc
                    .peer
                    .unsched_priority(self.config.num_priorities, locked.msgout.length);
                log::debug!(
                    "restarting id {}: retransmitting {} bytes",
                    rpc.id,
                    locked.msgout.next_xmit_offset
                );
                self.sink.resend_data(
                    &rpc.peer,
                    rpc.id,
                    0..locked.msgout.next_xmit_offset,
                    priority,
                );
            } else {
                log::error!(
                    "UNKNOWN for id {} in state {:?}; discarding",
                    rpc.id,
                    locked.state
                );
            }
        } else {
            sock.rpc_free(locked);
        }
    }

    /// NEED_ACK: safe to answer only if the peer may purge its state (the
    /// RPC is gone here, or its message is fully received). Otherwise stay
    /// silent and let the peer retry.
    fn need_ack_pkt(&self, common: &CommonHeader, src: IpAddr, lcache: &mut LockCache) {
        if let Some(locked) = lcache.locked() {
            let rpc = locked.rpc();
            if locked.state != RpcState::Incoming || rpc.sched.bytes_remaining() != 0 {
                return;
            }
        }
        let peer = self.peers.find(src);
        let acks = peer.get_acks(MAX_ACKS_PER_PKT);
        self.sink
            .xmit_control(&peer, echo_common(common), PacketBody::Ack { acks });
    }

    /// Process one ack: free the server-side RPC it names.
    pub(crate) fn rpc_acked(&self, sock: &Arc<HomaSocket>, src: IpAddr, ack: &Ack) {
        if ack.is_empty() || ack.server_port != sock.port {
            return;
        }
        let id = local_id(ack.client_id);
        let Some(rpc) = sock.find_server(src, ack.client_port, id) else {
            return;
        };
        let mut locked = rpc.lock();
        if locked.state != RpcState::Dead {
            sock.rpc_free(&mut locked);
        }
    }

    /// Emit a full batch of acks that outgrew a peer's buffer.
    pub(crate) fn xmit_ack_batch(&self, peer: &Arc<Peer>, sport: u16, dport: u16, batch: Vec<Ack>) {
        for chunk in batch.chunks(MAX_ACKS_PER_PKT) {
            self.sink.xmit_control(
                peer,
                CommonHeader {
                    sport,
                    dport,
                    sender_id: 0,
                },
                PacketBody::Ack {
                    acks: chunk.to_vec(),
                },
            );
        }
    }
}

/// Reply addressing for a control packet about `rpc`.
fn reply_common(rpc: &crate::rpc::HomaRpc) -> CommonHeader {
    CommonHeader {
        sport: rpc.port,
        dport: rpc.dport,
        sender_id: rpc.id,
    }
}

/// Reply addressing for a packet we have no RPC for: swap the ports, echo
/// the sender's id so it maps back into their space.
fn echo_common(common: &CommonHeader) -> CommonHeader {
    CommonHeader {
        sport: common.dport,
        dport: common.sport,
        sender_id: common.sender_id,
    }
}
