//! Monotonic timebase.
//!
//! Every bounded register wait derives an absolute deadline from a
//! monotonic hardware counter. The counter is reached through a trait so
//! tests can substitute a simulated clock; on the target the generic timer
//! counter (CNTPCT_EL0) is the only implementation.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::Ticks;

/// Generic timer frequency assumed by the tick conversions, 24 MHz on the
/// supported SoCs.
pub const TICKS_PER_MICROSECOND: u64 = 24;

/// Ticks corresponding to a microsecond count.
pub const fn usecs(us: u64) -> Ticks {
    us * TICKS_PER_MICROSECOND
}

/// Source of monotonic time.
pub trait Timebase: Sync {
    /// Current counter value. Monotonically non-decreasing.
    fn now(&self) -> Ticks;
}

/// The architectural counter, CNTPCT_EL0.
pub struct CounterTimebase;

impl Timebase for CounterTimebase {
    #[cfg(target_arch = "aarch64")]
    fn now(&self) -> Ticks {
        let res: u64;
        unsafe {
            core::arch::asm!("mrs {}, CNTPCT_EL0", out(reg) res, options(nomem, nostack));
        }
        res
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn now(&self) -> Ticks {
        0
    }
}

/// An absolute deadline against a timebase.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Ticks,
    limit: Ticks,
}

impl Deadline {
    /// Deadline `limit` ticks after now.
    pub fn after(tb: &dyn Timebase, limit: Ticks) -> Self {
        Deadline {
            start: tb.now(),
            limit,
        }
    }

    /// True once elapsed time exceeds the limit. Never true before.
    pub fn expired(&self, tb: &dyn Timebase) -> bool {
        tb.now().wrapping_sub(self.start) > self.limit
    }

    /// Ticks elapsed since the deadline was taken.
    pub fn elapsed(&self, tb: &dyn Timebase) -> Ticks {
        tb.now().wrapping_sub(self.start)
    }
}

/// Busy-delay for a tick count. Only for pre-scheduler phases.
pub fn delay(tb: &dyn Timebase, ticks: Ticks) {
    let start = tb.now();
    while tb.now().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

/// A manually advanced clock for tests.
pub struct SimTimebase {
    ticks: AtomicU64,
}

impl SimTimebase {
    pub const fn new() -> Self {
        SimTimebase {
            ticks: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ticks: Ticks) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Timebase for SimTimebase {
    fn now(&self) -> Ticks {
        self.ticks.load(Ordering::SeqCst)
    }
}
