//! The seam between the receive core and whatever actually puts packets on
//! the wire.
//!
//! The core never owns a socket or a NIC queue; it asks a [`PacketSink`] to
//! emit control packets and retransmissions. Production code plugs in its
//! datagram layer; tests use [`RecordingSink`].

use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::packet::{CommonHeader, PacketBody};
use crate::peer::Peer;

/// Outbound packet emitter.
///
/// Implementations must not block: every method is called from ingress
/// context, sometimes with an RPC lock held.
pub trait PacketSink: Send + Sync {
    /// Emit a control packet (anything but fresh DATA) to `peer`.
    fn xmit_control(&self, peer: &Arc<Peer>, common: CommonHeader, body: PacketBody);

    /// Retransmit bytes `range` of the outbound message of `rpc_id` at the
    /// given priority. An empty range is a no-op.
    fn resend_data(&self, peer: &Arc<Peer>, rpc_id: u64, range: Range<i64>, priority: u8);
}

/// Discards everything. For tooling that only exercises in-memory state.
pub struct NullSink;

impl PacketSink for NullSink {
    fn xmit_control(&self, _peer: &Arc<Peer>, _common: CommonHeader, _body: PacketBody) {}

    fn resend_data(&self, _peer: &Arc<Peer>, _rpc_id: u64, _range: Range<i64>, _priority: u8) {}
}

/// Captures everything emitted, for assertions.
#[derive(Default)]
pub struct RecordingSink {
    controls: Mutex<Vec<(CommonHeader, PacketBody)>>,
    resends: Mutex<Vec<(u64, Range<i64>, u8)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every control packet emitted so far, in order.
    pub fn controls(&self) -> Vec<(CommonHeader, PacketBody)> {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Emitted GRANTs as `(common, offset, priority, resend_all)`.
    pub fn grants(&self) -> Vec<(CommonHeader, i64, u8, bool)> {
        self.controls()
            .into_iter()
            .filter_map(|(common, body)| match body {
                PacketBody::Grant {
                    offset,
                    priority,
                    resend_all,
                } => Some((common, offset, priority, resend_all)),
                _ => None,
            })
            .collect()
    }

    /// Count of emitted control packets matching `pred`.
    pub fn count(&self, pred: impl Fn(&PacketBody) -> bool) -> usize {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, body)| pred(body))
            .count()
    }

    /// Recorded retransmission requests.
    pub fn resends(&self) -> Vec<(u64, Range<i64>, u8)> {
        self.resends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.resends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl PacketSink for RecordingSink {
    fn xmit_control(&self, _peer: &Arc<Peer>, common: CommonHeader, body: PacketBody) {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((common, body));
    }

    fn resend_data(&self, _peer: &Arc<Peer>, rpc_id: u64, range: Range<i64>, priority: u8) {
        self.resends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((rpc_id, range, priority));
    }
}
