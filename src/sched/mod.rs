//! Cooperative scheduler.
//!
//! One scheduler instance runs per processor core; nothing here does
//! cross-core work stealing. A task never loses the CPU involuntarily:
//! the only preemption point is the advisory flag check a task may make
//! before yielding. Blocking is built from exactly two pieces, the run
//! queue and a per-controller waiter list, with the transfer status word
//! standing in for a condition variable.
//!
//! Dispatch is a loop, not a non-returning context switch:
//! [`Scheduler::run_next`] resumes the head task and reports
//! [`Dispatch::Resumed`] or [`Dispatch::Idle`]; the embedding runtime (the
//! boot path in `main.rs`) owns the idle case.

pub mod runq;
pub mod task;

use core::sync::atomic::Ordering;

pub use runq::{RunList, RunQueue};
pub use task::{Runnable, Step, Task, TaskState};

// ============================================================================
// Dispatch
// ============================================================================

/// Result of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A task was resumed (it may have yielded, parked, or finished).
    Resumed,
    /// The run queue was empty; the caller must idle or halt.
    Idle,
}

/// Per-core scheduler: a FIFO run queue plus the yield/park/wake
/// primitives drivers build on.
pub struct Scheduler<'r> {
    rq: RunQueue<'r>,
}

/// Handed to a task while it runs; identifies the task and its scheduler.
pub struct SchedContext<'s, 'r> {
    pub sched: &'s Scheduler<'r>,
    pub task: &'r Task<'r>,
}

impl<'r> Scheduler<'r> {
    pub const fn new() -> Self {
        Scheduler {
            rq: RunQueue::new(),
        }
    }

    /// Admit a task at the run-queue tail. Callable from both cooperative
    /// and interrupt context; the release-ordered state store pairs with
    /// the acquire load in [`Scheduler::run_next`], so everything written
    /// before the handoff is visible when the task resumes.
    pub fn enqueue(&self, task: &'r Task<'r>) {
        debug_assert!(task.state() != TaskState::Dead);
        task.store_state(TaskState::Preempted, Ordering::Release);
        self.rq.push(task);
    }

    /// Resume the head task, if any.
    ///
    /// Never called from interrupt context; one dispatch context per core.
    pub fn run_next(&self) -> Dispatch {
        let Some(task) = self.rq.pop() else {
            return Dispatch::Idle;
        };
        let state = task.state(); // acquire
        debug_assert!(
            state == TaskState::Preempted || state == TaskState::Yielded,
            "dispatched a task in state {:?}",
            state
        );
        task.store_state(TaskState::Locked, Ordering::Relaxed);
        match task.runner.resume(&SchedContext { sched: self, task }) {
            Step::Yield => {
                // The cooperative yield point: the advisory preempt flag is
                // consumed here and nowhere else.
                task.take_preempt();
                task.store_state(TaskState::Yielded, Ordering::Release);
                self.rq.push(task);
            }
            Step::Park => {
                // The task put itself on a waiter list; nothing to do.
            }
            Step::Done => {
                task.store_state(TaskState::Dead, Ordering::Release);
            }
        }
        Dispatch::Resumed
    }

    /// Dispatch until the run queue is empty.
    pub fn run_to_idle(&self) {
        while self.run_next() == Dispatch::Resumed {}
    }

    pub fn is_idle(&self) -> bool {
        self.rq.is_empty()
    }

    /// Block `task` on `list` unless the wait condition already resolved.
    ///
    /// The task is pushed first and the condition re-checked after: if the
    /// event fired in between (interrupt context cannot be excluded), the
    /// whole list is requeued immediately, so the wakeup cannot be lost.
    /// The caller's resume function must return [`Step::Park`] afterwards
    /// and re-examine its own wait condition on every resumption; wake
    /// events are broadcast and spurious with respect to any one waiter.
    pub fn park_on<F: FnOnce() -> bool>(
        &self,
        task: &'r Task<'r>,
        list: &RunList<'r>,
        still_blocked: F,
    ) {
        task.store_state(TaskState::Waiting, Ordering::Release);
        list.push(task);
        if !still_blocked() {
            self.wake_all(list);
        }
    }

    /// Move every task on `list` onto the run queue. This is the wake
    /// primitive the interrupt bridge calls; it uses only atomics and is
    /// safe from interrupt context. Waiters that find their own condition
    /// still unmet simply park again.
    pub fn wake_all(&self, list: &RunList<'r>) {
        let chain = list.take_all();
        for task in chain.iter() {
            task.store_state(TaskState::Preempted, Ordering::Release);
        }
        self.rq.push_chain(chain);
    }
}

impl<'s, 'r> SchedContext<'s, 'r> {
    /// Park the current task on a waiter list; see [`Scheduler::park_on`].
    pub fn park_on<F: FnOnce() -> bool>(&self, list: &RunList<'r>, still_blocked: F) {
        self.sched.park_on(self.task, list, still_blocked);
    }

    /// Advisory: has someone asked this task to yield?
    pub fn preempt_requested(&self) -> bool {
        self.task.preempt_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8};

    struct Count {
        runs: AtomicU32,
        limit: u32,
    }

    impl Count {
        fn new(limit: u32) -> Self {
            Count {
                runs: AtomicU32::new(0),
                limit,
            }
        }
    }

    impl Runnable<'_> for Count {
        fn resume(&self, _cx: &SchedContext<'_, '_>) -> Step {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.limit {
                Step::Done
            } else {
                Step::Yield
            }
        }
    }

    #[test]
    fn test_yield_requeues_until_done() {
        let r = Count::new(3);
        let t = Task::new(&r);
        let sched = Scheduler::new();
        sched.enqueue(&t);
        sched.run_to_idle();
        assert_eq!(r.runs.load(Ordering::SeqCst), 3);
        assert_eq!(t.state(), TaskState::Dead);
        assert!(sched.is_idle());
    }

    #[test]
    fn test_idle_on_empty_queue() {
        let sched = Scheduler::new();
        assert_eq!(sched.run_next(), Dispatch::Idle);
    }

    #[test]
    fn test_round_robin_fairness() {
        // Two tasks yielding twice each must interleave strictly.
        static TRACE: spin::Mutex<heapless::Vec<u8, 8>> = spin::Mutex::new(heapless::Vec::new());
        TRACE.lock().clear();

        struct Tag {
            id: u8,
            left: AtomicU32,
        }
        impl Runnable<'_> for Tag {
            fn resume(&self, _cx: &SchedContext<'_, '_>) -> Step {
                TRACE.lock().push(self.id).unwrap();
                if self.left.fetch_sub(1, Ordering::SeqCst) == 1 {
                    Step::Done
                } else {
                    Step::Yield
                }
            }
        }

        let a = Tag {
            id: 0,
            left: AtomicU32::new(2),
        };
        let b = Tag {
            id: 1,
            left: AtomicU32::new(2),
        };
        let ta = Task::new(&a);
        let tb = Task::new(&b);
        let sched = Scheduler::new();
        sched.enqueue(&ta);
        sched.enqueue(&tb);
        sched.run_to_idle();
        assert_eq!(TRACE.lock().as_slice(), &[0, 1, 0, 1]);
    }

    struct WaitFor<'l> {
        list: &'l RunList<'l>,
        ready: &'l AtomicBool,
        done: AtomicBool,
        parks: AtomicU32,
    }

    impl<'l> Runnable<'l> for WaitFor<'l> {
        fn resume(&self, cx: &SchedContext<'_, 'l>) -> Step {
            if self.ready.load(Ordering::Acquire) {
                self.done.store(true, Ordering::SeqCst);
                return Step::Done;
            }
            self.parks.fetch_add(1, Ordering::SeqCst);
            cx.park_on(self.list, || !self.ready.load(Ordering::Acquire));
            Step::Park
        }
    }

    #[test]
    fn test_park_and_wake() {
        let ready = AtomicBool::new(false);
        let list = RunList::new();
        let w = WaitFor {
            list: &list,
            ready: &ready,
            done: AtomicBool::new(false),
            parks: AtomicU32::new(0),
        };
        let t = Task::new(&w);
        let sched = Scheduler::new();
        sched.enqueue(&t);
        sched.run_to_idle();
        // Task parked; queue idle, condition not met.
        assert_eq!(w.parks.load(Ordering::SeqCst), 1);
        assert_eq!(t.state(), TaskState::Waiting);
        assert!(sched.is_idle());

        // Interrupt side: condition then wake.
        ready.store(true, Ordering::Release);
        sched.wake_all(&list);
        sched.run_to_idle();
        assert!(w.done.load(Ordering::SeqCst));
        assert_eq!(t.state(), TaskState::Dead);
    }

    #[test]
    fn test_spurious_wake_reparks() {
        // One shared waiter list, two conditions: waking for B must make A
        // re-check and park again, and A completes only on its own event.
        let ready_a = AtomicBool::new(false);
        let ready_b = AtomicBool::new(false);
        let list = RunList::new();
        let a = WaitFor {
            list: &list,
            ready: &ready_a,
            done: AtomicBool::new(false),
            parks: AtomicU32::new(0),
        };
        let b = WaitFor {
            list: &list,
            ready: &ready_b,
            done: AtomicBool::new(false),
            parks: AtomicU32::new(0),
        };
        let ta = Task::new(&a);
        let tb = Task::new(&b);
        let sched = Scheduler::new();
        sched.enqueue(&ta);
        sched.enqueue(&tb);
        sched.run_to_idle();
        assert_eq!(a.parks.load(Ordering::SeqCst), 1);
        assert_eq!(b.parks.load(Ordering::SeqCst), 1);

        // B's event: broadcast wake. A must re-park, B must finish.
        ready_b.store(true, Ordering::Release);
        sched.wake_all(&list);
        sched.run_to_idle();
        assert!(b.done.load(Ordering::SeqCst));
        assert!(!a.done.load(Ordering::SeqCst));
        assert_eq!(a.parks.load(Ordering::SeqCst), 2);
        assert_eq!(ta.state(), TaskState::Waiting);

        ready_a.store(true, Ordering::Release);
        sched.wake_all(&list);
        sched.run_to_idle();
        assert!(a.done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_lost_wakeup_guard() {
        // Condition resolves between the waiter's check and its park: the
        // park_on re-check must requeue immediately.
        struct RacyWait<'l> {
            list: &'l RunList<'l>,
            state: AtomicU8, // 0 = first run, 1 = parked once, 2 = done
        }
        impl<'l> Runnable<'l> for RacyWait<'l> {
            fn resume(&self, cx: &SchedContext<'_, 'l>) -> Step {
                match self.state.load(Ordering::SeqCst) {
                    0 => {
                        self.state.store(1, Ordering::SeqCst);
                        // Condition already false at re-check time: park_on
                        // must wake the list rather than strand us.
                        cx.park_on(self.list, || false);
                        Step::Park
                    }
                    _ => {
                        self.state.store(2, Ordering::SeqCst);
                        Step::Done
                    }
                }
            }
        }

        let list = RunList::new();
        let r = RacyWait {
            list: &list,
            state: AtomicU8::new(0),
        };
        let t = Task::new(&r);
        let sched = Scheduler::new();
        sched.enqueue(&t);
        sched.run_to_idle();
        assert_eq!(r.state.load(Ordering::SeqCst), 2);
        assert_eq!(t.state(), TaskState::Dead);
    }

    #[test]
    fn test_preempt_flag_cleared_at_yield() {
        let r = Count::new(2);
        let t = Task::new(&r);
        let sched = Scheduler::new();
        sched.enqueue(&t);
        t.request_preempt();
        assert_eq!(sched.run_next(), Dispatch::Resumed); // yields once
        assert!(!t.preempt_requested());
        sched.run_to_idle();
        assert_eq!(t.state(), TaskState::Dead);
    }
}
