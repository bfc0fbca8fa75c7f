//! Run queue management.
//!
//! Two layers make up a run queue:
//!
//! - [`RunList`]: an intrusive atomic list. Pushing at the head is the only
//!   insertion that is simple to do lock-free, so entries are stored in
//!   *reverse* admission order. This is the only structure interrupt
//!   context is allowed to touch, and it doubles as the controller waiter
//!   list.
//! - [`RunQueue`]: the per-core FIFO. All admissions land on an embedded
//!   "fresh" [`RunList`]; the dispatch context drains it (reversing it back
//!   to admission order) into a locally owned head/tail list. Draining only
//!   happens when the local list is empty, so dequeue order equals
//!   admission order across batches.
//!
//! Insertion order is a correctness requirement: fairness, and preserving
//! the relative order of interrupt-woken work.

use core::ptr;
use core::sync::atomic::Ordering;
use spin::Mutex;

use super::task::Task;

// ============================================================================
// Atomic Runnable List
// ============================================================================

/// Intrusive lock-free LIFO of tasks. Entries are linked through
/// `Task::next`, which the list exclusively owns while the task is on it.
pub struct RunList<'r> {
    head: core::sync::atomic::AtomicPtr<Task<'r>>,
}

/// A detached chain of tasks, in reverse admission order (newest first).
/// Produced by [`RunList::take_all`]; the holder owns every link in it.
pub struct Chain<'r> {
    pub(crate) head: *mut Task<'r>,
}

impl<'r> RunList<'r> {
    pub const fn new() -> Self {
        RunList {
            head: core::sync::atomic::AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a task. Safe from any context, including interrupt handlers.
    /// Release: the task's state word and whatever the pusher wrote become
    /// visible to whoever takes the list.
    pub fn push(&self, task: &'r Task<'r>) {
        let node = task as *const Task<'r> as *mut Task<'r>;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            task.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }

    /// Detach the whole list. Acquire: pairs with `push`.
    pub fn take_all(&self) -> Chain<'r> {
        Chain {
            head: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

impl<'r> Chain<'r> {
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Walk the chain front to back (newest admission first).
    pub fn iter(&self) -> ChainIter<'r> {
        ChainIter { cur: self.head }
    }
}

pub struct ChainIter<'r> {
    cur: *mut Task<'r>,
}

impl<'r> Iterator for ChainIter<'r> {
    type Item = &'r Task<'r>;

    fn next(&mut self) -> Option<&'r Task<'r>> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: chain links are only built from &'r Task borrows, and the
        // chain owner holds them exclusively until requeued.
        let task: &'r Task<'r> = unsafe { &*self.cur };
        self.cur = task.next.load(Ordering::Relaxed);
        Some(task)
    }
}

// ============================================================================
// Per-Core Run Queue
// ============================================================================

struct Local<'r> {
    head: *mut Task<'r>,
    tail: *mut Task<'r>,
}

// SAFETY: the raw pointers only ever refer to &'r Task borrows.
unsafe impl Send for Local<'_> {}

/// FIFO run queue owned by one core's dispatch context.
///
/// The fresh list takes admissions from any context; the local list is
/// only touched under the mutex by the dispatch context, so an interrupt
/// handler never contends for it.
pub struct RunQueue<'r> {
    fresh: RunList<'r>,
    local: Mutex<Local<'r>>,
}

impl<'r> RunQueue<'r> {
    pub const fn new() -> Self {
        RunQueue {
            fresh: RunList::new(),
            local: Mutex::new(Local {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }),
        }
    }

    /// Admit a task at the queue tail. Safe from any context.
    pub fn push(&self, task: &'r Task<'r>) {
        self.fresh.push(task);
    }

    /// Splice a detached chain (in reverse admission order, as produced by
    /// [`RunList::take_all`]) into the queue, preserving the chain's own
    /// admission order. Safe from any context.
    pub fn push_chain(&self, chain: Chain<'r>) {
        if chain.is_empty() {
            return;
        }
        // Find the chain tail; the whole chain keeps its reversed layout,
        // so after the dispatch context's drain-reversal it comes out in
        // admission order.
        let first = chain.head;
        let mut last = first;
        // SAFETY: we own the detached chain.
        unsafe {
            loop {
                let next = (*last).next.load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                last = next;
            }
            let mut head = self.fresh.head.load(Ordering::Relaxed);
            loop {
                (*last).next.store(head, Ordering::Relaxed);
                match self.fresh.head.compare_exchange_weak(
                    head,
                    first,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(h) => head = h,
                }
            }
        }
    }

    /// Dequeue the head task, or None if the queue is idle.
    /// Dispatch context only.
    pub fn pop(&self) -> Option<&'r Task<'r>> {
        let mut local = self.local.lock();
        if local.head.is_null() {
            self.drain_fresh(&mut local);
        }
        let head = local.head;
        if head.is_null() {
            return None;
        }
        // SAFETY: local list nodes are &'r Task borrows owned by this queue.
        unsafe {
            local.head = (*head).next.load(Ordering::Relaxed);
            if local.head.is_null() {
                local.tail = ptr::null_mut();
            }
            (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
            Some(&*head)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fresh.is_empty() && self.local.lock().head.is_null()
    }

    /// Reverse the fresh list onto the local tail. Only called with the
    /// local list empty, which keeps batches in admission order.
    fn drain_fresh(&self, local: &mut Local<'r>) {
        let chain = self.fresh.take_all();
        let mut prev: *mut Task<'r> = ptr::null_mut();
        let mut cur = chain.head;
        let batch_tail = chain.head;
        // SAFETY: the detached chain is exclusively ours.
        unsafe {
            while !cur.is_null() {
                let next = (*cur).next.load(Ordering::Relaxed);
                (*cur).next.store(prev, Ordering::Relaxed);
                prev = cur;
                cur = next;
            }
        }
        if prev.is_null() {
            return;
        }
        debug_assert!(local.head.is_null());
        local.head = prev;
        local.tail = batch_tail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::{Runnable, Step};
    use crate::sched::SchedContext;

    struct Nop;
    impl Runnable<'_> for Nop {
        fn resume(&self, _cx: &SchedContext<'_, '_>) -> Step {
            Step::Done
        }
    }

    fn ids<'r>(rq: &RunQueue<'r>, tasks: &[&'r Task<'r>]) -> heapless::Vec<usize, 16> {
        let mut out = heapless::Vec::new();
        while let Some(t) = rq.pop() {
            let idx = tasks
                .iter()
                .position(|c| core::ptr::eq(*c, t))
                .expect("unknown task");
            out.push(idx).unwrap();
        }
        out
    }

    #[test]
    fn test_fifo_order() {
        let r = Nop;
        let t0 = Task::new(&r);
        let t1 = Task::new(&r);
        let t2 = Task::new(&r);
        let rq = RunQueue::new();
        rq.push(&t0);
        rq.push(&t1);
        rq.push(&t2);
        assert_eq!(ids(&rq, &[&t0, &t1, &t2]).as_slice(), &[0, 1, 2]);
        assert!(rq.pop().is_none());
    }

    #[test]
    fn test_fifo_across_batches() {
        let r = Nop;
        let tasks = [Task::new(&r), Task::new(&r), Task::new(&r), Task::new(&r)];
        let rq = RunQueue::new();
        rq.push(&tasks[0]);
        rq.push(&tasks[1]);
        // Partial drain, then more admissions: order must still hold.
        let first = rq.pop().unwrap();
        assert!(core::ptr::eq(first, &tasks[0]));
        rq.push(&tasks[2]);
        rq.push(&tasks[3]);
        let refs: [&Task; 4] = [&tasks[0], &tasks[1], &tasks[2], &tasks[3]];
        assert_eq!(ids(&rq, &refs).as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_no_duplicate_or_lost_entries() {
        let r = Nop;
        let tasks = [
            Task::new(&r),
            Task::new(&r),
            Task::new(&r),
            Task::new(&r),
            Task::new(&r),
        ];
        let rq = RunQueue::new();
        for t in &tasks {
            rq.push(t);
        }
        let refs: [&Task; 5] = [&tasks[0], &tasks[1], &tasks[2], &tasks[3], &tasks[4]];
        let order = ids(&rq, &refs);
        assert_eq!(order.as_slice(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_chain_splice_preserves_admission_order() {
        let r = Nop;
        let w0 = Task::new(&r);
        let w1 = Task::new(&r);
        let w2 = Task::new(&r);
        let waiters = RunList::new();
        waiters.push(&w0);
        waiters.push(&w1);
        waiters.push(&w2);

        let rq = RunQueue::new();
        rq.push_chain(waiters.take_all());
        assert_eq!(ids(&rq, &[&w0, &w1, &w2]).as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn test_chain_splice_after_existing_entries() {
        let r = Nop;
        let e0 = Task::new(&r);
        let w0 = Task::new(&r);
        let w1 = Task::new(&r);
        let waiters = RunList::new();
        waiters.push(&w0);
        waiters.push(&w1);

        let rq = RunQueue::new();
        rq.push(&e0);
        rq.push_chain(waiters.take_all());
        assert_eq!(ids(&rq, &[&e0, &w0, &w1]).as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn test_take_all_empties_list() {
        let r = Nop;
        let t = Task::new(&r);
        let list = RunList::new();
        assert!(list.is_empty());
        list.push(&t);
        assert!(!list.is_empty());
        let chain = list.take_all();
        assert!(list.is_empty());
        assert_eq!(chain.iter().count(), 1);
    }
}
