//! Configuration for a Homa protocol instance.

use crate::timing;

/// Compile-time ceiling on `max_overcommit`; sizes the stack-allocated
/// scratch used during grant computation.
pub const MAX_GRANTS: usize = 10;

/// Number of priority levels carried on the wire.
pub const MAX_PRIORITIES: usize = 8;

/// Homa configuration.
///
/// Controls the grant engine, priority assignment and the receive wait loop.
/// Call [`HomaConfig::derive`] (done automatically by `Homa::new`) after
/// changing fields; it recomputes the values that depend on other knobs.
#[derive(Debug, Clone)]
pub struct HomaConfig {
    /// Ceiling on the total bytes all senders may have in flight toward this
    /// host under grants. Default: 400_000
    pub max_incoming: i64,
    /// Per-RPC grant window in bytes. 0 selects dynamic sizing
    /// (`max_incoming / (granted RPCs + 1)`). Default: 0
    pub window: i64,
    /// Number of RPCs granted to concurrently (clamped to [`MAX_GRANTS`]).
    /// Default: 8
    pub max_overcommit: usize,
    /// Ceiling on RPCs from a single peer chosen in one grant round.
    /// Default: 1
    pub max_rpcs_per_peer: usize,
    /// Priority levels in use (at most [`MAX_PRIORITIES`]). Default: 8
    pub num_priorities: usize,
    /// Highest priority level used for scheduled (granted) traffic; levels
    /// above it are reserved for unscheduled bytes. Default: 5
    pub max_sched_prio: u8,
    /// Bytes a sender may transmit with no grant. Default: 40_000
    pub unsched_bytes: i64,
    /// Per-mille of grant bandwidth diverted to FIFO anti-starvation grants
    /// (0..=500). Default: 50
    pub grant_fifo_fraction: u64,
    /// Size in bytes of one FIFO grant. Default: 10_000
    pub fifo_grant_increment: i64,
    /// How long a receiver busy-polls before sleeping, in microseconds.
    /// Default: 50
    pub poll_usecs: u64,
    /// A core counts as busy with transport work for this long after its
    /// last activity, in microseconds. Default: 100
    pub busy_usecs: u64,
    /// Reaping becomes mandatory on the dispatch path once a socket's dead
    /// RPCs hold twice this many packet buffers. Default: 5_000
    pub dead_buffs_limit: usize,
    /// Packet buffers reclaimed per reap call. Default: 10
    pub reap_limit: usize,
    /// Cutoffs advertised to senders: `unsched_cutoffs[p]` is the largest
    /// message that may use priority `p` for its unscheduled bytes.
    pub unsched_cutoffs: [i32; MAX_PRIORITIES],
    /// Version tag for `unsched_cutoffs`; bump it when they change so stale
    /// senders get a CUTOFFS refresh.
    pub cutoff_version: u16,

    // Derived; recomputed by derive().
    pub(crate) grant_nonfifo: i64,
    pub(crate) poll_cycles: u64,
    pub(crate) busy_cycles: u64,
}

impl Default for HomaConfig {
    fn default() -> Self {
        let mut config = Self {
            max_incoming: 400_000,
            window: 0,
            max_overcommit: 8,
            max_rpcs_per_peer: 1,
            num_priorities: MAX_PRIORITIES,
            max_sched_prio: 5,
            unsched_bytes: 40_000,
            grant_fifo_fraction: 50,
            fifo_grant_increment: 10_000,
            poll_usecs: 50,
            busy_usecs: 100,
            dead_buffs_limit: 5_000,
            reap_limit: 10,
            unsched_cutoffs: [
                i32::MAX,
                i32::MAX,
                i32::MAX,
                i32::MAX,
                40_000,
                15_000,
                2_800,
                1_400,
            ],
            cutoff_version: 1,
            grant_nonfifo: 0,
            poll_cycles: 0,
            busy_cycles: 0,
        };
        config.derive();
        config
    }
}

impl HomaConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the incoming-byte ceiling.
    pub fn with_max_incoming(mut self, max_incoming: i64) -> Self {
        self.max_incoming = max_incoming;
        self.derive();
        self
    }

    /// Set a fixed per-RPC grant window (0 = dynamic).
    pub fn with_window(mut self, window: i64) -> Self {
        self.window = window;
        self
    }

    /// Set the number of RPCs granted to concurrently.
    pub fn with_max_overcommit(mut self, max_overcommit: usize) -> Self {
        self.max_overcommit = max_overcommit;
        self.derive();
        self
    }

    /// Set the per-peer grant cap.
    pub fn with_max_rpcs_per_peer(mut self, max_rpcs_per_peer: usize) -> Self {
        self.max_rpcs_per_peer = max_rpcs_per_peer;
        self
    }

    /// Set the highest scheduled priority level.
    pub fn with_max_sched_prio(mut self, max_sched_prio: u8) -> Self {
        self.max_sched_prio = max_sched_prio;
        self
    }

    /// Set the unscheduled-byte allowance.
    pub fn with_unsched_bytes(mut self, unsched_bytes: i64) -> Self {
        self.unsched_bytes = unsched_bytes;
        self
    }

    /// Set the FIFO grant fraction, in per-mille.
    pub fn with_grant_fifo_fraction(mut self, per_mille: u64) -> Self {
        self.grant_fifo_fraction = per_mille;
        self.derive();
        self
    }

    /// Set the FIFO grant size.
    pub fn with_fifo_grant_increment(mut self, bytes: i64) -> Self {
        self.fifo_grant_increment = bytes;
        self.derive();
        self
    }

    /// Set the busy-poll duration.
    pub fn with_poll_usecs(mut self, poll_usecs: u64) -> Self {
        self.poll_usecs = poll_usecs;
        self.derive();
        self
    }

    /// Set the busy-core horizon.
    pub fn with_busy_usecs(mut self, busy_usecs: u64) -> Self {
        self.busy_usecs = busy_usecs;
        self.derive();
        self
    }

    /// Set the dead-buffer reap thresholds.
    pub fn with_reap_limits(mut self, dead_buffs_limit: usize, reap_limit: usize) -> Self {
        self.dead_buffs_limit = dead_buffs_limit;
        self.reap_limit = reap_limit;
        self
    }

    /// Recompute every derived parameter. Clamps out-of-range knobs rather
    /// than rejecting them.
    pub fn derive(&mut self) {
        if self.grant_fifo_fraction > 500 {
            self.grant_fifo_fraction = 500;
        }
        self.grant_nonfifo = if self.grant_fifo_fraction != 0 {
            (1000 * self.fifo_grant_increment) / self.grant_fifo_fraction as i64
                - self.fifo_grant_increment
        } else {
            0
        };

        if self.max_overcommit > MAX_GRANTS {
            self.max_overcommit = MAX_GRANTS;
        }
        if self.num_priorities > MAX_PRIORITIES {
            self.num_priorities = MAX_PRIORITIES;
        }
        if usize::from(self.max_sched_prio) >= self.num_priorities {
            self.max_sched_prio = (self.num_priorities - 1) as u8;
        }

        self.poll_cycles = timing::usecs_to_cycles(self.poll_usecs);
        self.busy_cycles = timing::usecs_to_cycles(self.busy_usecs);
    }
}
