//! Deadline-bounded condition waits.
//!
//! Controller registers are polled, never interrupt-driven, during command
//! sequencing; only data completion uses the waiter-list path. Every poll
//! loop here carries an explicit deadline from the monotonic counter, so a
//! wedged controller costs bounded time and reports instead of hanging the
//! boot.
//!
//! What happens between polls is a strategy: [`Spin`] burns the CPU (for
//! pre-scheduler phases), while a [`Scheduler`] used as the [`Relax`]
//! dispatches other ready tasks between reads, which is how long card
//! bring-up coexists with concurrent transfers on the other controller.

use crate::sched::Scheduler;
use crate::timer::{Deadline, Timebase};
use crate::types::Ticks;

/// What a wait loop does between polls.
pub trait Relax {
    fn relax(&self);
}

/// Busy-wait relax for contexts with nothing else to run.
pub struct Spin;

impl Relax for Spin {
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Waiting on one device makes progress on everything else.
impl Relax for Scheduler<'_> {
    fn relax(&self) {
        self.run_next();
    }
}

/// Poll `read` until `(value & mask) == expected`, up to `timeout` ticks.
/// Returns false on deadline expiry, after logging the last value seen.
pub fn wait_masked<T, R, F>(
    tb: &dyn Timebase,
    relax: &R,
    read: F,
    mask: T,
    expected: T,
    timeout: Ticks,
    name: &str,
) -> bool
where
    T: Copy + PartialEq + core::ops::BitAnd<Output = T> + core::fmt::LowerHex,
    R: Relax + ?Sized,
    F: Fn() -> T,
{
    let deadline = Deadline::after(tb, timeout);
    loop {
        let val = read();
        if val & mask == expected {
            return true;
        }
        if deadline.expired(tb) {
            crate::println!(
                "{} timeout: reg {:#x} mask {:#x} expected {:#x}",
                name,
                val,
                mask,
                expected
            );
            return false;
        }
        relax.relax();
    }
}

/// Wait for all bits in `mask` to be set.
pub fn wait_set<T, R, F>(tb: &dyn Timebase, relax: &R, read: F, mask: T, timeout: Ticks, name: &str) -> bool
where
    T: Copy + PartialEq + core::ops::BitAnd<Output = T> + core::fmt::LowerHex,
    R: Relax + ?Sized,
    F: Fn() -> T,
{
    wait_masked(tb, relax, read, mask, mask, timeout, name)
}

/// Wait for all bits in `mask` to clear.
pub fn wait_unset<T, R, F>(tb: &dyn Timebase, relax: &R, read: F, mask: T, timeout: Ticks, name: &str) -> bool
where
    T: Copy + PartialEq + core::ops::BitAnd<Output = T> + core::fmt::LowerHex + Default,
    R: Relax + ?Sized,
    F: Fn() -> T,
{
    wait_masked(tb, relax, read, mask, T::default(), timeout, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::Reg;
    use crate::timer::SimTimebase;
    use core::sync::atomic::{AtomicU32, Ordering};

    /// Relax that advances the simulated clock, one tick per poll.
    struct Tick<'a>(&'a SimTimebase);

    impl Relax for Tick<'_> {
        fn relax(&self) {
            self.0.advance(1);
        }
    }

    #[test]
    fn test_immediate_success_costs_no_time() {
        let tb = SimTimebase::new();
        let reg: Reg<u32> = Reg::new(0x8000);
        assert!(wait_set(&tb, &Tick(&tb), || reg.read(), 0x8000, 10, "ready"));
        assert_eq!(tb.now(), 0);
    }

    #[test]
    fn test_timeout_is_deterministic() {
        let tb = SimTimebase::new();
        let reg: Reg<u32> = Reg::new(0);
        assert!(!wait_set(&tb, &Tick(&tb), || reg.read(), 1, 100, "stuck"));
        // One poll per tick; expiry strictly after the limit.
        assert_eq!(tb.now(), 101);
    }

    #[test]
    fn test_condition_met_mid_wait() {
        let tb = SimTimebase::new();
        let reg: Reg<u32> = Reg::new(0x1);
        struct Flip<'a> {
            tb: &'a SimTimebase,
            reg: &'a Reg<u32>,
        }
        impl Relax for Flip<'_> {
            fn relax(&self) {
                self.tb.advance(1);
                if self.tb.now() == 5 {
                    self.reg.write(0);
                }
            }
        }
        assert!(wait_unset(
            &tb,
            &Flip { tb: &tb, reg: &reg },
            || reg.read(),
            0x1,
            100,
            "busy"
        ));
        assert_eq!(tb.now(), 5);
    }

    #[test]
    fn test_scheduler_relax_dispatches_tasks() {
        use crate::sched::{Runnable, SchedContext, Step, Task};

        struct Bump<'a>(&'a AtomicU32);
        impl Runnable<'_> for Bump<'_> {
            fn resume(&self, _cx: &SchedContext<'_, '_>) -> Step {
                self.0.fetch_add(1, Ordering::SeqCst);
                Step::Yield
            }
        }

        let progressed = AtomicU32::new(0);
        let r = Bump(&progressed);
        let t = Task::new(&r);
        let sched = Scheduler::new();
        sched.enqueue(&t);

        let tb = SimTimebase::new();
        // Condition met once the background task has run three times.
        assert!(wait_set(
            &tb,
            &sched,
            || {
                tb.advance(1);
                u32::from(progressed.load(Ordering::SeqCst) >= 3)
            },
            1,
            100,
            "background"
        ));
        assert!(progressed.load(Ordering::SeqCst) >= 3);
    }
}
