//! # homa: receive side of the Homa datacenter transport
//!
//! This crate implements the receive path of Homa (NSDI 2018/2022): a
//! connectionless, message-oriented, priority-aware transport where the
//! *receiver* paces every sender by issuing GRANT packets that carry both a
//! byte offset and a priority level.
//!
//! ## Features
//!
//! - **Out-of-order reassembly** with explicit gap tracking per message
//! - **Receiver-driven grants**: SRPT ordering, per-peer caps, overcommit,
//!   dynamic windows, and FIFO anti-starvation grants
//! - **Priority assignment** that keeps high levels free for preemption
//! - **Lock-free handoff** of ready messages to waiting receiver threads,
//!   preferring threads on idle cores
//! - **Two-phase copy-out**: payload reaches user buffers with no RPC lock
//!   held, so ingress never stalls behind a memcpy
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use homa::{Homa, HomaConfig, HomaSocket, NullSink, PageBufferPool, RecvFlags};
//!
//! let pool = Arc::new(PageBufferPool::new(1024).unwrap());
//! let homa = Arc::new(Homa::new(HomaConfig::default(), pool, Arc::new(NullSink)));
//! let sock = HomaSocket::new(&homa, 4000);
//!
//! // Ingress threads feed datagrams in:
//! //   homa.deliver(&sock, core, frames);
//!
//! // Application threads block for complete messages:
//! let rpc = sock.wait_for_message(RecvFlags::REQUEST, 0).unwrap();
//! assert_eq!(rpc.error, 0);
//! ```
//!
//! ## Architecture
//!
//! - [`packet`]: wire formats (network byte order)
//! - [`msgin`]: per-RPC reassembly and copy-out
//! - [`dispatch`]: the single entry point for every inbound packet type
//! - [`grant`]: the grantable list and the grant scheduler
//! - [`socket`]: RPC tables, ready queues, handoff, reaping, aborts
//! - [`wait`]: the blocking receive loop
//! - [`buffer`] and [`transport`]: the contracts for the buffer-page pool
//!   and the outbound packet emitter, with ready-made implementations
//!
//! Ingress ("softirq-like") callers must never block: [`Homa::deliver`] and
//! everything under it only takes short critical sections. Application
//! threads may block only in [`HomaSocket::wait_for_message`].

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grant;
pub mod interest;
pub mod metrics;
pub mod msgin;
pub mod packet;
pub mod peer;
pub mod rpc;
pub mod socket;
pub mod timing;
pub mod transport;
pub mod wait;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::grant::GrantTable;
use crate::metrics::Metrics;
use crate::peer::PeerTable;
use crate::socket::HomaSocket as Socket;

pub use crate::buffer::{BufferPool, PageBufferPool, BPAGE_SIZE, MAX_MESSAGE_LENGTH};
pub use crate::config::{HomaConfig, MAX_GRANTS, MAX_PRIORITIES};
pub use crate::dispatch::LockCache;
pub use crate::error::{HomaError, Result};
pub use crate::metrics::MetricsSnapshot;
pub use crate::msgin::{Gap, MsgIn};
pub use crate::packet::{Ack, CommonHeader, Packet, PacketBody, PktType};
pub use crate::peer::{Peer, PeerTable as Peers};
pub use crate::rpc::{is_client_id, local_id, HomaRpc, LockedRpc, RpcHandle, RpcState};
pub use crate::socket::{DataReadyHook, HomaSocket};
pub use crate::transport::{NullSink, PacketSink, RecordingSink};
pub use crate::wait::RecvFlags;

/// Hook consulted by the wait loop at its signal-check points; returning
/// true surfaces [`HomaError::Interrupted`].
pub type SignalCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Per-core activity stamps, for steering handoffs toward idle cores.
pub(crate) struct CoreTracker {
    cores: Vec<CoreState>,
}

struct CoreState {
    /// Last cycle any transport work ran here.
    last_active: AtomicU64,
    /// Last cycle an application receiver was active here.
    last_app_active: AtomicU64,
}

impl CoreTracker {
    fn new() -> Self {
        // At least 16 slots so distinct core hints stay distinct even on
        // small machines.
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(16);
        Self {
            cores: (0..n)
                .map(|_| CoreState {
                    last_active: AtomicU64::new(0),
                    last_app_active: AtomicU64::new(0),
                })
                .collect(),
        }
    }

    #[inline]
    fn slot(&self, core: usize) -> &CoreState {
        &self.cores[core % self.cores.len()]
    }

    pub(crate) fn note_active(&self, core: usize) {
        self.slot(core)
            .last_active
            .store(crate::timing::rdtsc(), Ordering::Relaxed);
    }

    pub(crate) fn note_app_active(&self, core: usize) {
        self.slot(core)
            .last_app_active
            .store(crate::timing::rdtsc(), Ordering::Relaxed);
    }

    pub(crate) fn last_active(&self, core: usize) -> u64 {
        self.slot(core).last_active.load(Ordering::Relaxed)
    }
}

/// One Homa protocol instance.
///
/// Owns the global mutable state (grant table, peer table, counters) and the
/// two external contracts: the buffer-page pool payloads are copied into and
/// the sink outbound packets leave through. All receive-path operations hang
/// off this handle; nothing is ambient.
pub struct Homa {
    pub(crate) config: HomaConfig,
    pub(crate) grant: GrantTable,
    pub(crate) peers: PeerTable,
    pub(crate) pool: Arc<dyn BufferPool>,
    pub(crate) sink: Arc<dyn PacketSink>,
    pub(crate) metrics: Metrics,
    pub(crate) cores: CoreTracker,
    sockets: Mutex<Vec<Weak<Socket>>>,
    signal_check: Option<SignalCheck>,
}

impl Homa {
    /// Create a protocol instance. Derived configuration values are
    /// recomputed here, so field-by-field construction of the config is
    /// fine.
    pub fn new(mut config: HomaConfig, pool: Arc<dyn BufferPool>, sink: Arc<dyn PacketSink>) -> Self {
        config.derive();
        Self {
            grant: GrantTable::new(&config),
            config,
            peers: PeerTable::new(),
            pool,
            sink,
            metrics: Metrics::default(),
            cores: CoreTracker::new(),
            sockets: Mutex::new(Vec::new()),
            signal_check: None,
        }
    }

    /// The instance configuration.
    #[inline]
    pub fn config(&self) -> &HomaConfig {
        &self.config
    }

    /// Snapshot of the receive-path counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Bytes currently authorized across all inbound messages.
    pub fn total_incoming(&self) -> i64 {
        self.grant.total_incoming.load(Ordering::Acquire)
    }

    /// The peer table.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Install the signal hook. Must be called before the instance is
    /// shared.
    pub fn set_signal_check(&mut self, check: SignalCheck) {
        self.signal_check = Some(check);
    }

    pub(crate) fn signal_pending(&self) -> bool {
        self.signal_check.as_ref().is_some_and(|check| check())
    }

    pub(crate) fn register_socket(&self, sock: &Arc<Socket>) {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.push(Arc::downgrade(sock));
    }

    /// Prune registry entries whose sockets are gone.
    pub(crate) fn unregister_socket(&self) {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.retain(|weak| weak.strong_count() > 0);
    }

    /// Abort every RPC involving `addr` on every socket (restricted to
    /// server port `port` unless it is 0). Client RPCs stay observable with
    /// `error` set; server RPCs are freed. The reaction to an unreachable
    /// peer, driven by the external timer subsystem.
    pub fn abort_peer_rpcs(&self, addr: IpAddr, port: u16, error: i32) {
        let sockets: Vec<Arc<Socket>> = {
            let registry = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        for sock in sockets {
            sock.abort_peer_rpcs(addr, port, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_abort_peer_rpcs_spans_sockets() {
        let pool = Arc::new(PageBufferPool::new(16).unwrap());
        let homa = Arc::new(Homa::new(
            HomaConfig::default(),
            pool,
            Arc::new(NullSink),
        ));
        let sock_a = HomaSocket::new(&homa, 4000);
        let sock_b = HomaSocket::new(&homa, 4001);
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10));

        let client_a = sock_a.new_client_rpc(addr, 99, 100).unwrap();
        let client_b = sock_b.new_client_rpc(addr, 99, 100).unwrap();
        let unrelated = sock_a.new_client_rpc(other, 99, 100).unwrap();
        let (server_a, _) = sock_a
            .find_or_create_server(addr, 50_000, 43, 100, 100)
            .unwrap();

        homa.abort_peer_rpcs(addr, 0, -libc::ETIMEDOUT);

        assert_eq!(client_a.lock().error, -libc::ETIMEDOUT);
        assert_eq!(client_b.lock().error, -libc::ETIMEDOUT);
        assert_eq!(unrelated.lock().error, 0);
        assert!(server_a.is_dead());
    }

    #[test]
    fn test_abort_peer_rpcs_respects_port_filter() {
        let pool = Arc::new(PageBufferPool::new(16).unwrap());
        let homa = Arc::new(Homa::new(
            HomaConfig::default(),
            pool,
            Arc::new(NullSink),
        ));
        let sock = HomaSocket::new(&homa, 4000);
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

        let to_port_99 = sock.new_client_rpc(addr, 99, 100).unwrap();
        let to_port_88 = sock.new_client_rpc(addr, 88, 100).unwrap();

        homa.abort_peer_rpcs(addr, 99, -libc::ETIMEDOUT);
        assert_eq!(to_port_99.lock().error, -libc::ETIMEDOUT);
        assert_eq!(to_port_88.lock().error, 0);
    }
}
