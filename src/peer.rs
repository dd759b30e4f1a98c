//! Per-peer state: unscheduled-priority cutoffs and ack accumulation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::MAX_PRIORITIES;
use crate::packet::Ack;
use crate::timing;

/// Acks buffered per peer before they force out an ACK packet.
pub(crate) const MAX_UNACKED: usize = 64;

struct CutoffState {
    /// `unsched_cutoffs[p]` is the largest message length that may use
    /// priority `p` for its unscheduled bytes. Slot 0 is pinned to `i32::MAX`
    /// so every length maps to some level.
    unsched_cutoffs: [i32; MAX_PRIORITIES],
    version: u16,
}

/// State for one remote host.
pub struct Peer {
    pub addr: IpAddr,
    cutoffs: Mutex<CutoffState>,
    /// Cleared whenever any packet arrives from this peer; the external
    /// timer uses it to pace RESEND escalation.
    pub(crate) outstanding_resends: AtomicU32,
    /// Millisecond tick of the last CUTOFFS we sent; limits replies to one
    /// per tick when a stale sender streams packets at us.
    last_cutoffs_sent_ms: AtomicU64,
    acks: Mutex<Vec<Ack>>,
}

impl Peer {
    fn new(addr: IpAddr) -> Self {
        let mut unsched_cutoffs = [0i32; MAX_PRIORITIES];
        unsched_cutoffs[0] = i32::MAX;
        Self {
            addr,
            cutoffs: Mutex::new(CutoffState {
                unsched_cutoffs,
                version: 0,
            }),
            outstanding_resends: AtomicU32::new(0),
            last_cutoffs_sent_ms: AtomicU64::new(u64::MAX),
            acks: Mutex::new(Vec::new()),
        }
    }

    /// Install cutoffs received in a CUTOFFS packet.
    pub fn set_cutoffs(&self, wire: &[i32; MAX_PRIORITIES], version: u16) {
        let mut state = self.cutoffs.lock().unwrap_or_else(|e| e.into_inner());
        state.unsched_cutoffs[0] = i32::MAX;
        state.unsched_cutoffs[1..].copy_from_slice(&wire[1..]);
        state.version = version;
    }

    /// Version of the cutoffs this peer last told us about.
    pub fn cutoff_version(&self) -> u16 {
        self.cutoffs.lock().unwrap_or_else(|e| e.into_inner()).version
    }

    /// Priority level this peer should use for the unscheduled bytes of a
    /// `length`-byte message.
    pub fn unsched_priority(&self, num_priorities: usize, length: i64) -> u8 {
        let state = self.cutoffs.lock().unwrap_or_else(|e| e.into_inner());
        for level in (0..num_priorities).rev() {
            if state.unsched_cutoffs[level] as i64 >= length {
                return level as u8;
            }
        }
        0
    }

    /// Returns true at most once per millisecond tick, and records the send.
    pub(crate) fn may_send_cutoffs(&self) -> bool {
        let now = timing::coarse_millis();
        self.last_cutoffs_sent_ms.swap(now, Ordering::Relaxed) != now
    }

    /// Buffer an ack to piggyback later. When the buffer fills, the whole
    /// batch (including `ack`) is handed back for immediate transmission.
    pub(crate) fn add_ack(&self, ack: Ack) -> Option<Vec<Ack>> {
        let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
        if acks.len() >= MAX_UNACKED {
            let mut batch = std::mem::take(&mut *acks);
            batch.push(ack);
            return Some(batch);
        }
        acks.push(ack);
        None
    }

    /// Take up to `max` buffered acks.
    pub(crate) fn get_acks(&self, max: usize) -> Vec<Ack> {
        let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
        let keep = acks.len().saturating_sub(max);
        acks.split_off(keep)
    }
}

/// All peers known to one protocol instance.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<IpAddr, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a peer, creating it on first contact.
    pub fn find(&self, addr: IpAddr) -> Arc<Peer> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .entry(addr)
            .or_insert_with(|| Arc::new(Peer::new(addr)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> Peer {
        Peer::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }

    #[test]
    fn test_unsched_priority_levels() {
        let p = peer();
        let mut wire = [0i32; MAX_PRIORITIES];
        // Messages up to 1000 bytes may use level 7, up to 10_000 level 6.
        wire[7] = 1_000;
        wire[6] = 10_000;
        p.set_cutoffs(&wire, 1);

        assert_eq!(p.unsched_priority(MAX_PRIORITIES, 500), 7);
        assert_eq!(p.unsched_priority(MAX_PRIORITIES, 5_000), 6);
        // Bigger than every cutoff: falls through to the pinned slot 0.
        assert_eq!(p.unsched_priority(MAX_PRIORITIES, 500_000), 0);
    }

    #[test]
    fn test_slot_zero_pinned() {
        let p = peer();
        let wire = [0i32; MAX_PRIORITIES];
        p.set_cutoffs(&wire, 3);
        assert_eq!(p.unsched_priority(MAX_PRIORITIES, i32::MAX as i64), 0);
        assert_eq!(p.cutoff_version(), 3);
    }

    #[test]
    fn test_cutoffs_rate_limit() {
        let p = peer();
        assert!(p.may_send_cutoffs());
        // Back-to-back calls land in the same millisecond tick (allow one
        // boundary crossing) and must be suppressed.
        let second = p.may_send_cutoffs();
        let third = p.may_send_cutoffs();
        assert!(!(second && third));
    }

    #[test]
    fn test_ack_batch_on_overflow() {
        let p = peer();
        for i in 0..MAX_UNACKED as u64 {
            let full = p.add_ack(Ack {
                client_id: 2 * (i + 1),
                client_port: 1,
                server_port: 2,
            });
            assert!(full.is_none());
        }
        let batch = p
            .add_ack(Ack {
                client_id: 1_000,
                client_port: 1,
                server_port: 2,
            })
            .expect("overflow should hand the batch back");
        assert_eq!(batch.len(), MAX_UNACKED + 1);
        assert!(p.get_acks(10).is_empty());
    }

    #[test]
    fn test_get_acks_drains_newest_first_bounded() {
        let p = peer();
        for i in 0..10u64 {
            p.add_ack(Ack {
                client_id: 2 * (i + 1),
                client_port: 1,
                server_port: 2,
            });
        }
        assert_eq!(p.get_acks(4).len(), 4);
        assert_eq!(p.get_acks(100).len(), 6);
    }
}
