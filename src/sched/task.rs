//! Continuation records ("tasks").
//!
//! A task is the saved point of a cooperative thread: a resume capability,
//! one atomic scheduling word, and an intrusive link. There is no register
//! save area; suspension points are expressed by the resume function
//! returning a [`Step`], and the scheduler's dispatch loop (rather than a
//! non-returning context switch) decides what happens next. The run queue
//! and the waiter lists hold tasks by reference; a task is reachable from
//! at most one list at a time and its link field is owned by whichever
//! list currently holds it.
//!
//! ## Scheduling word
//!
//! The state tag and the advisory preempt-request flag live together in a
//! single atomic u32 so both are visible under one acquire load. The flag
//! is advisory only: it is consumed at the cooperative yield point, never
//! delivered asynchronously.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

// ============================================================================
// Task State
// ============================================================================

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    /// Owned by a dispatch context: newly constructed or currently running.
    Locked = 0,
    /// Ready, on a run queue, admitted by another context (wake or external
    /// enqueue).
    Preempted = 1,
    /// Parked outside scheduler control (e.g. a halted secondary core).
    Stopped = 2,
    /// Ready, on a run queue, gave up the CPU voluntarily.
    Yielded = 3,
    /// Terminal. Entered only by explicit completion, never implicitly.
    Dead = 4,
    /// Blocked on a controller waiter list; not on any run queue.
    Waiting = 5,
}

const STATE_MASK: u32 = 0x7;

/// Advisory preempt-request flag, stored alongside the state tag.
pub const PREEMPT_REQUEST: u32 = 1 << 31;

fn state_of(word: u32) -> TaskState {
    match word & STATE_MASK {
        0 => TaskState::Locked,
        1 => TaskState::Preempted,
        2 => TaskState::Stopped,
        3 => TaskState::Yielded,
        4 => TaskState::Dead,
        5 => TaskState::Waiting,
        _ => unreachable!(),
    }
}

// ============================================================================
// Resume Capability
// ============================================================================

/// What a task did with its turn on the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Gave up the CPU voluntarily; requeue at the run-queue tail.
    Yield,
    /// Parked itself on a waiter list via [`SchedContext::park_on`]; the
    /// waker will requeue it.
    Park,
    /// Finished. The task becomes Dead and is never resumed again.
    Done,
}

/// The resume capability of a task.
///
/// `resume` runs until the task's next suspension point and reports how it
/// left the CPU. A long-running task may consult
/// [`SchedContext::preempt_requested`] and return [`Step::Yield`] early;
/// that check is the system's only preemption point.
///
/// The lifetime parameter ties the implementor to the task graph it may
/// park on: a runner can only wait on lists living at least as long as
/// the tasks themselves.
pub trait Runnable<'r>: Sync {
    fn resume(&self, cx: &crate::sched::SchedContext<'_, 'r>) -> Step;
}

// ============================================================================
// Task Record
// ============================================================================

/// A continuation record.
///
/// Tasks are borrowed into the scheduler, not owned by it; the creator
/// keeps them alive (statics, or stack frames outliving the scheduler) and
/// must not drop a task while any list still links it.
pub struct Task<'r> {
    /// State tag + preempt flag; see module docs.
    word: AtomicU32,
    /// Intrusive link, exclusively owned by the list holding this task.
    pub(crate) next: AtomicPtr<Task<'r>>,
    pub(crate) runner: &'r (dyn Runnable<'r> + 'r),
}

impl<'r> Task<'r> {
    /// A new task in the Locked state; it runs once first enqueued.
    pub const fn new(runner: &'r (dyn Runnable<'r> + 'r)) -> Self {
        Task {
            word: AtomicU32::new(TaskState::Locked as u32),
            next: AtomicPtr::new(core::ptr::null_mut()),
            runner,
        }
    }

    /// Current state tag. Acquire: pairs with the release store made by
    /// whichever context handed the task over, so everything that context
    /// wrote is visible to the caller.
    pub fn state(&self) -> TaskState {
        state_of(self.word.load(Ordering::Acquire))
    }

    /// Replace the state tag, preserving the preempt flag.
    pub(crate) fn store_state(&self, state: TaskState, order: Ordering) {
        let fetch_order = match order {
            Ordering::Release | Ordering::AcqRel => Ordering::Acquire,
            _ => Ordering::Relaxed,
        };
        let _ = self
            .word
            .fetch_update(order, fetch_order, |w| {
                Some((w & !STATE_MASK) | state as u32)
            });
    }

    /// Request that this task yield at its next cooperative checkpoint.
    /// Callable from interrupt context; advisory only.
    pub fn request_preempt(&self) {
        self.word.fetch_or(PREEMPT_REQUEST, Ordering::Release);
    }

    /// True if a preempt request is pending. Does not consume it.
    pub fn preempt_requested(&self) -> bool {
        self.word.load(Ordering::Acquire) & PREEMPT_REQUEST != 0
    }

    /// Consume a pending preempt request. Called by the dispatcher at the
    /// yield point.
    pub(crate) fn take_preempt(&self) -> bool {
        self.word.fetch_and(!PREEMPT_REQUEST, Ordering::AcqRel) & PREEMPT_REQUEST != 0
    }

    /// Park this task outside scheduler control.
    pub fn mark_stopped(&self) {
        self.store_state(TaskState::Stopped, Ordering::Release);
    }
}

// SAFETY: all shared fields are atomics and the runner is required Sync.
unsafe impl Sync for Task<'_> {}
