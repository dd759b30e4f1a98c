//! Inbound message reassembly.
//!
//! Segments may arrive in any order; received coverage is tracked as a
//! contiguous prefix (`recv_end`) plus an ordered list of holes below it.
//! Accepted segments queue for copy-out in arrival order; user buffers are
//! addressed by segment offset, so queue order never matters for
//! correctness.

use std::collections::VecDeque;
use std::ptr;

use crate::buffer::BufferPool;
use crate::rpc::{LockedRpc, RpcHandle, RpcInner, SchedInfo, FLAG_COPYING_TO_USER};

/// Segments drained per copy-out batch while the RPC lock is dropped.
const MAX_COPY_BATCH: usize = 20;

/// When nothing at all has arrived for a message, ask the sender to
/// retransmit this many bytes; it will round up to one full packet carrying
/// the message metadata.
const RESEND_MIN_BYTES: i64 = 100;

/// A hole in received coverage: bytes `[start, end)` are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: i64,
    pub end: i64,
}

/// One accepted DATA segment, queued until copy-out.
#[derive(Debug, Clone)]
pub(crate) struct DataSegment {
    pub offset: i64,
    pub length: i64,
    pub retransmit: bool,
    pub payload: Vec<u8>,
}

/// Reassembly state for one inbound message.
///
/// Invariants: gaps are non-overlapping, strictly ordered by `start`, and
/// every gap ends at or below `recv_end`.
#[derive(Debug)]
pub struct MsgIn {
    /// Offset just past the highest byte ever observed (holes included).
    pub(crate) recv_end: i64,
    pub(crate) gaps: Vec<Gap>,
    pub(crate) packets: VecDeque<DataSegment>,
    /// Buffer pages reserved for copy-out; 0 means arriving data is being
    /// discarded until pages free up.
    pub(crate) num_bpages: usize,
}

impl MsgIn {
    pub(crate) fn new() -> Self {
        Self {
            recv_end: 0,
            gaps: Vec::new(),
            packets: VecDeque::new(),
            num_bpages: 0,
        }
    }

    /// Current holes, for diagnostics and tests.
    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// Segments awaiting copy-out.
    pub fn queued_packets(&self) -> usize {
        self.packets.len()
    }

    /// Offset just past the highest byte observed so far.
    pub fn recv_end(&self) -> i64 {
        self.recv_end
    }

    /// Buffer pages reserved for this message.
    pub fn num_bpages(&self) -> usize {
        self.num_bpages
    }

    /// Integrate one segment. Returns false if the segment was rejected:
    /// zero length, past the message end, straddling a gap boundary, or
    /// duplicating received bytes. Accepted segments join the copy-out queue
    /// and shrink `bytes_remaining`.
    pub(crate) fn add_packet(&mut self, sched: &SchedInfo, seg: DataSegment) -> bool {
        let start = seg.offset;
        let length = seg.length;
        let end = start + length;

        if length <= 0 || end > sched.length() {
            return false;
        }

        if start == self.recv_end {
            // Common case: sequential arrival.
            self.recv_end = end;
        } else if start > self.recv_end {
            // Beyond everything seen so far: the skipped range becomes a gap.
            self.gaps.push(Gap {
                start: self.recv_end,
                end: start,
            });
            self.recv_end = end;
        } else if !self.fill_gap(start, end) {
            return false;
        }

        sched
            .bytes_remaining
            .fetch_sub(length, std::sync::atomic::Ordering::Relaxed);
        self.packets.push_back(seg);
        true
    }

    /// Place `[start, end)` into the gap list. The segment must lie within
    /// exactly one gap, aligned to its start, its end, or strictly interior;
    /// anything else is a protocol violation and is rejected.
    fn fill_gap(&mut self, start: i64, end: i64) -> bool {
        for i in 0..self.gaps.len() {
            let gap = self.gaps[i];
            if start <= gap.start {
                if end <= gap.start {
                    // Entirely below this gap: already-received territory,
                    // keep scanning (later gaps are even higher).
                    continue;
                }
                if start < gap.start || end > gap.end {
                    // Straddles the gap start, or swallows past its end.
                    return false;
                }
                self.gaps[i].start = end;
                if self.gaps[i].start >= self.gaps[i].end {
                    self.gaps.remove(i);
                }
                return true;
            }
            if end >= gap.end {
                if start >= gap.end {
                    continue;
                }
                if end > gap.end {
                    return false;
                }
                self.gaps[i].end = start;
                return true;
            }
            // Strictly interior: the gap splits in two.
            let low = Gap {
                start: gap.start,
                end: start,
            };
            self.gaps[i].start = end;
            self.gaps.insert(i, low);
            return true;
        }
        // No gap matched: duplicate of received data.
        false
    }

    /// First missing range to ask the sender for: the first gap if any,
    /// otherwise the granted-but-unreceived tail, otherwise empty. For a
    /// message whose length is still unknown, request the metadata packet.
    pub fn resend_range(&self, sched: &SchedInfo) -> (i64, i64) {
        if sched.length() < 0 {
            return (0, RESEND_MIN_BYTES);
        }
        if let Some(gap) = self.gaps.first() {
            return (gap.start, gap.end - gap.start);
        }
        let granted = sched.granted();
        if granted >= self.recv_end {
            (self.recv_end, granted - self.recv_end)
        } else {
            (self.recv_end, 0)
        }
    }
}

/// Initialize the inbound message of `rpc` on first DATA arrival and reserve
/// its receive buffers. With no pages available, `granted` drops to zero so
/// arriving packets are discarded until buffers free up.
pub(crate) fn msgin_init(
    rpc: &RpcHandle,
    inner: &mut RpcInner,
    length: i64,
    unsched: i64,
    pool: &dyn BufferPool,
) {
    use std::sync::atomic::Ordering;

    let sched = &rpc.sched;
    sched.length.store(length, Ordering::Relaxed);
    sched.bytes_remaining.store(length, Ordering::Relaxed);
    sched
        .granted
        .store(unsched.min(length), Ordering::Relaxed);
    sched.scheduled.store(length > unsched, Ordering::Relaxed);
    sched.priority.store(0, Ordering::Relaxed);
    sched.resend_all.store(false, Ordering::Relaxed);

    inner.msgin = MsgIn::new();
    inner.msgin.num_bpages = pool.allocate(rpc.id, length as usize);
    if inner.msgin.num_bpages == 0 {
        sched.granted.store(0, Ordering::Relaxed);
    }
}

/// Drain the packet queue into the user's buffer pages.
///
/// Works in batches: detach up to [`MAX_COPY_BATCH`] segments under the RPC
/// lock, drop the lock, copy and free them, re-acquire, repeat. The lock is
/// never held across a copy, so packet handlers keep enqueuing onto the same
/// RPC throughout; `COPYING_TO_USER` advertises the window. Returns 0 or a
/// negative errno.
pub(crate) fn copy_to_user(pool: &dyn BufferPool, locked: &mut LockedRpc) -> i32 {
    loop {
        let mut batch: Vec<DataSegment> = Vec::new();
        while batch.len() < MAX_COPY_BATCH {
            match locked.msgin.packets.pop_front() {
                Some(seg) => batch.push(seg),
                None => break,
            }
        }
        if batch.is_empty() {
            return 0;
        }

        locked.rpc().set_flags(FLAG_COPYING_TO_USER);
        locked.unlocked(|rpc| {
            for seg in &batch {
                copy_segment(pool, rpc.id, seg);
            }
            // Segment buffers free here, outside the lock.
            drop(batch);
        });
        locked.rpc().clear_flags(FLAG_COPYING_TO_USER);
    }
}

fn copy_segment(pool: &dyn BufferPool, id: u64, seg: &DataSegment) {
    let mut copied: i64 = 0;
    while copied < seg.length {
        let Some((dst, avail)) = pool.get_buffer(id, (seg.offset + copied) as usize) else {
            // Reservation ran out under us (message truncated by a shorter
            // re-init, or pages revoked). Nothing sane to do with the rest.
            return;
        };
        let chunk = ((seg.length - copied) as usize).min(avail);
        // SAFETY: the pool contract guarantees `dst` addresses at least
        // `avail` writable bytes that no other segment's copy overlaps.
        unsafe {
            ptr::copy_nonoverlapping(seg.payload.as_ptr().add(copied as usize), dst.as_ptr(), chunk)
        };
        copied += chunk as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn sched(length: i64) -> SchedInfo {
        let sched = SchedInfo::new();
        sched
            .length
            .store(length, std::sync::atomic::Ordering::Relaxed);
        sched
            .bytes_remaining
            .store(length, std::sync::atomic::Ordering::Relaxed);
        sched
            .granted
            .store(length, std::sync::atomic::Ordering::Relaxed);
        sched
    }

    fn seg(offset: i64, length: i64) -> DataSegment {
        DataSegment {
            offset,
            length,
            retransmit: false,
            payload: vec![0; length as usize],
        }
    }

    #[test]
    fn test_sequential_arrival() {
        let sched = sched(3000);
        let mut msg = MsgIn::new();
        assert!(msg.add_packet(&sched, seg(0, 1000)));
        assert!(msg.add_packet(&sched, seg(1000, 2000)));
        assert_eq!(msg.recv_end, 3000);
        assert!(msg.gaps().is_empty());
        assert_eq!(sched.bytes_remaining(), 0);
        assert_eq!(msg.queued_packets(), 2);
    }

    #[test]
    fn test_gap_created_and_cleared() {
        let sched = sched(3000);
        let mut msg = MsgIn::new();
        assert!(msg.add_packet(&sched, seg(2000, 1000)));
        assert_eq!(msg.gaps(), &[Gap { start: 0, end: 2000 }]);
        assert_eq!(msg.recv_end, 3000);

        // Fills the gap exactly.
        assert!(msg.add_packet(&sched, seg(0, 2000)));
        assert!(msg.gaps().is_empty());
        assert_eq!(sched.bytes_remaining(), 0);
    }

    #[test]
    fn test_gap_trim_start_end_and_split() {
        let sched = sched(10_000);
        let mut msg = MsgIn::new();
        assert!(msg.add_packet(&sched, seg(9000, 1000)));
        assert_eq!(msg.gaps(), &[Gap { start: 0, end: 9000 }]);

        // Aligned at gap start.
        assert!(msg.add_packet(&sched, seg(0, 1000)));
        assert_eq!(msg.gaps(), &[Gap { start: 1000, end: 9000 }]);

        // Aligned at gap end.
        assert!(msg.add_packet(&sched, seg(8000, 1000)));
        assert_eq!(msg.gaps(), &[Gap { start: 1000, end: 8000 }]);

        // Strictly interior: splits.
        assert!(msg.add_packet(&sched, seg(4000, 1000)));
        assert_eq!(
            msg.gaps(),
            &[
                Gap { start: 1000, end: 4000 },
                Gap { start: 5000, end: 8000 }
            ]
        );
        assert_eq!(sched.bytes_remaining(), 10_000 - 4000);
    }

    #[test]
    fn test_boundary_violations_discarded() {
        let sched = sched(10_000);
        let mut msg = MsgIn::new();
        assert!(msg.add_packet(&sched, seg(0, 1000)));
        assert!(msg.add_packet(&sched, seg(5000, 1000)));
        // Gap is [1000, 5000).

        // Starts inside received data, ends inside the gap.
        assert!(!msg.add_packet(&sched, seg(500, 1000)));
        // Starts inside the gap, runs past its end into received data.
        assert!(!msg.add_packet(&sched, seg(4500, 1000)));
        // Unchanged.
        assert_eq!(msg.gaps(), &[Gap { start: 1000, end: 5000 }]);
        assert_eq!(sched.bytes_remaining(), 8000);
    }

    #[test]
    fn test_overrun_and_zero_length_discarded() {
        let sched = sched(1000);
        let mut msg = MsgIn::new();
        assert!(!msg.add_packet(&sched, seg(500, 1000)));
        assert!(!msg.add_packet(&sched, seg(0, 0)));
        assert_eq!(msg.queued_packets(), 0);
        assert_eq!(sched.bytes_remaining(), 1000);
    }

    #[test]
    fn test_duplicate_discarded() {
        let sched = sched(2000);
        let mut msg = MsgIn::new();
        assert!(msg.add_packet(&sched, seg(0, 1000)));
        let before = sched.bytes_remaining();
        assert!(!msg.add_packet(&sched, seg(0, 1000)));
        assert_eq!(sched.bytes_remaining(), before);
        assert_eq!(msg.queued_packets(), 1);
    }

    #[test]
    fn test_random_order_reassembles() {
        let mut rng = rand::thread_rng();
        let mut offsets: Vec<i64> = (0..20).map(|i| i * 500).collect();
        for _ in 0..10 {
            offsets.shuffle(&mut rng);
            let sched = sched(10_000);
            let mut msg = MsgIn::new();
            for &off in &offsets {
                assert!(msg.add_packet(&sched, seg(off, 500)), "offset {}", off);
            }
            assert!(msg.gaps().is_empty());
            assert_eq!(msg.recv_end, 10_000);
            assert_eq!(sched.bytes_remaining(), 0);
        }
    }

    #[test]
    fn test_resend_range() {
        let sched = sched(10_000);
        sched
            .granted
            .store(6000, std::sync::atomic::Ordering::Relaxed);
        let mut msg = MsgIn::new();

        // Nothing received yet: granted tail starting at zero.
        assert_eq!(msg.resend_range(&sched), (0, 6000));

        assert!(msg.add_packet(&sched, seg(0, 1000)));
        assert_eq!(msg.resend_range(&sched), (1000, 5000));

        // A gap takes precedence over the tail.
        assert!(msg.add_packet(&sched, seg(3000, 1000)));
        assert_eq!(msg.resend_range(&sched), (1000, 2000));
    }

    #[test]
    fn test_resend_range_unknown_length() {
        let sched = SchedInfo::new();
        let msg = MsgIn::new();
        assert_eq!(msg.resend_range(&sched), (0, RESEND_MIN_BYTES));
    }

    #[test]
    fn test_resend_range_grant_behind_recv_end() {
        let sched = sched(10_000);
        sched
            .granted
            .store(500, std::sync::atomic::Ordering::Relaxed);
        let mut msg = MsgIn::new();
        assert!(msg.add_packet(&sched, seg(0, 1000)));
        assert_eq!(msg.resend_range(&sched), (1000, 0));
    }
}
