//! Cycle-granularity clock used by the polling and scheduling paths.
//!
//! Grant ordering, busy-core detection and the receive-side poll loop all
//! work in raw cycle counts rather than `Instant`s. A single process-wide
//! calibration ties everything to one time base: it records when the clock
//! was first consulted and measures the cycle rate once, and platforms
//! without a hardware counter synthesize their cycle values from that same
//! state.

use std::sync::OnceLock;
use std::time::Instant;

/// Cycle rate of the synthetic clock on platforms with no hardware counter.
#[cfg(not(target_arch = "x86_64"))]
const NOMINAL_CYCLES_PER_USEC: u64 = 1_000;

/// Process-wide time base: when the clock started and how fast it ticks.
struct Calibration {
    base: Instant,
    cycles_per_usec: u64,
}

fn calibration() -> &'static Calibration {
    static CAL: OnceLock<Calibration> = OnceLock::new();
    CAL.get_or_init(|| {
        let base = Instant::now();
        Calibration {
            cycles_per_usec: measure_rate(base),
            base,
        }
    })
}

/// Measure cycles per microsecond of wall time. The synthetic clock runs at
/// its fixed nominal rate, so there is nothing to measure there.
fn measure_rate(base: Instant) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        let start = unsafe { std::arch::x86_64::_rdtsc() };
        while base.elapsed().as_micros() < 2_000 {
            std::hint::spin_loop();
        }
        let cycles = unsafe { std::arch::x86_64::_rdtsc() } - start;
        (cycles / base.elapsed().as_micros() as u64).max(1)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = base;
        NOMINAL_CYCLES_PER_USEC
    }
}

/// Read the clock in cycles.
///
/// Note: assumes a roughly constant CPU frequency. Good enough for the
/// poll/busy heuristics this crate uses it for.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let cal = calibration();
        cal.base.elapsed().as_micros() as u64 * cal.cycles_per_usec
    }
}

/// Cycles per microsecond, fixed at first use.
pub fn cycles_per_usec() -> u64 {
    calibration().cycles_per_usec
}

/// Convert a microsecond knob into cycles.
#[inline]
pub fn usecs_to_cycles(usecs: u64) -> u64 {
    usecs * cycles_per_usec()
}

/// Coarse millisecond tick, used to rate-limit per-peer control replies.
#[inline]
pub fn coarse_millis() -> u64 {
    rdtsc() / (cycles_per_usec() * 1000)
}

/// Index of the core the calling thread is currently running on.
///
/// Used only as a locality hint; 0 is a fine answer on platforms without
/// `sched_getcpu`.
#[inline]
pub fn current_core() -> usize {
    #[cfg(target_os = "linux")]
    {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            cpu as usize
        } else {
            0
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotone() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_calibration_sane() {
        // Any modern machine runs somewhere between 100 MHz and 10 GHz.
        let c = cycles_per_usec();
        assert!(c >= 1);
        assert!(c < 100_000);
    }

    #[test]
    fn test_usec_conversion_scales() {
        assert_eq!(usecs_to_cycles(0), 0);
        assert_eq!(usecs_to_cycles(7), 7 * cycles_per_usec());
    }
}
