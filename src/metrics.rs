//! Receive-path counters.
//!
//! Counters only; there is no export surface. Everything is relaxed: these
//! feed operator curiosity, not control decisions.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Counters for one protocol instance.
        #[derive(Debug, Default)]
        pub struct Metrics {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)*
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Metrics {
            /// Copy all counters.
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// DATA segments dropped: overran the message, violated a gap boundary,
    /// or duplicated received bytes.
    packet_discards,
    /// Same, but the segment was marked retransmitted.
    resent_discards,
    /// Retransmitted segments that were actually used.
    resent_packets_used,
    /// Bytes of DATA dropped because no buffer pages were available.
    dropped_data_no_bufs,
    /// Packets referencing an RPC this host knows nothing about.
    unknown_rpcs,
    /// Packets whose type code was not recognized.
    unknown_packet_types,
    /// Server RPCs that could not be created on first DATA.
    server_cant_create_rpcs,
    /// First response packets seen by client RPCs.
    responses_received,
    /// FIFO (anti-starvation) grants issued.
    fifo_grants,
    /// FIFO grants whose recipient had no ungranted received bytes.
    fifo_grants_no_incoming,
    /// Handoffs delivered directly to a waiting thread.
    handoffs_thread_waiting,
    /// Handoffs that skipped a busy-core thread for an idle one.
    handoffs_alt_thread,
    /// Ready RPCs queued because no thread was waiting.
    requests_queued,
    /// Ditto, responses.
    responses_queued,
    /// Wait-loop completions that never slept.
    fast_wakeups,
    /// Wait-loop completions that slept at least once.
    slow_wakeups,
    /// Cycles spent busy-polling in the wait loop.
    poll_cycles,
    /// Cycles the wait loop lost to involuntary preemption or sleep.
    blocked_cycles,
    /// Packet buffers reclaimed from dead RPCs.
    reaped_buffs,
}

/// Bump a counter, optionally by more than one.
macro_rules! inc_metric {
    ($field:expr) => {
        $field.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    };
    ($field:expr, $n:expr) => {
        $field.fetch_add($n as u64, std::sync::atomic::Ordering::Relaxed)
    };
}
pub(crate) use inc_metric;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_counts() {
        let m = Metrics::default();
        inc_metric!(m.packet_discards);
        inc_metric!(m.dropped_data_no_bufs, 1400);
        let snap = m.snapshot();
        assert_eq!(snap.packet_discards, 1);
        assert_eq!(snap.dropped_data_no_bufs, 1400);
        assert_eq!(snap.unknown_rpcs, 0);
    }
}
