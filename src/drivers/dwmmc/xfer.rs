//! Transfer descriptors for the SD/MMC engine.
//!
//! A [`Transfer`] is a reusable request slot. Its life cycle is driven
//! entirely through the atomic status byte: the terminal [`IoStatus`]
//! codes occupy values 0..NUM_IOST, and two in-flight markers sit above
//! them, so a single acquire load tells a waiter everything. The mutable
//! body (block address, scatter ring) hides behind a mutex that is only
//! contended by protocol violation: the owner fills it while Creating, the
//! interrupt bridge services it while Submitted, and nobody else touches
//! it.

use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

use crate::dma::SegRing;
use crate::iost::{IoStatus, NUM_IOST};
use crate::types::PhysRange;

/// Descriptor slots in each transfer's segment ring.
pub const RING_CAPACITY: usize = 4;

/// Status marker: claimed by an owner that is still adding buffers.
pub const XFER_CREATING: u8 = NUM_IOST;
/// Status marker: handed to hardware; only the interrupt bridge may move
/// the status from here.
pub const XFER_SUBMITTED: u8 = NUM_IOST + 1;

pub struct Transfer {
    status: AtomicU8,
    pub(super) body: Mutex<TransferBody>,
}

pub(super) struct TransferBody {
    pub block_addr: u32,
    pub ring: SegRing<RING_CAPACITY>,
}

impl Transfer {
    pub const fn new() -> Self {
        Transfer {
            status: AtomicU8::new(IoStatus::Ok as u8),
            body: Mutex::new(TransferBody {
                block_addr: 0,
                ring: SegRing::new(),
            }),
        }
    }

    /// Claim the descriptor for a new request starting at `block_addr`.
    /// Fails with `Transient` while a previous submission is still in
    /// flight; any terminal state is claimable.
    pub fn begin_request(&self, block_addr: u32) -> IoStatus {
        let mut status = self.status.load(Ordering::Acquire);
        loop {
            if status == XFER_SUBMITTED {
                return IoStatus::Transient;
            }
            match self.status.compare_exchange_weak(
                status,
                XFER_CREATING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(s) => status = s,
            }
        }
        let mut body = self.body.lock();
        body.block_addr = block_addr;
        body.ring.reset();
        IoStatus::Ok
    }

    /// Append a physical range to the scatter list. Word alignment is a
    /// hardware requirement; unaligned or over-long lists are rejected
    /// without touching the ring.
    pub fn add_phys_buffer(&self, range: PhysRange) -> bool {
        debug_assert_eq!(self.status.load(Ordering::Relaxed), XFER_CREATING);
        if range.start.0 & 3 != 0 || range.end.0 & 3 != 0 {
            return false;
        }
        self.body.lock().ring.add_range(range)
    }

    /// Raw status byte (terminal code or in-flight marker).
    pub fn status_raw(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    /// Terminal outcome, if the transfer has reached one.
    pub fn outcome(&self) -> Option<IoStatus> {
        IoStatus::from_u8(self.status_raw())
    }

    /// Creating -> Submitted, done by the controller at hand-off time.
    pub(super) fn mark_submitted(&self) -> bool {
        self.status
            .compare_exchange(
                XFER_CREATING,
                XFER_SUBMITTED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Roll a failed hand-off back so the owner may retry or drop it.
    pub(super) fn unsubmit(&self) {
        self.status.store(XFER_CREATING, Ordering::Relaxed);
    }

    /// Record the terminal outcome. Release pairs with the acquire in
    /// [`outcome`](Self::outcome): the ring counters and buffer contents
    /// are visible to whoever observes the terminal state.
    pub(super) fn finish(&self, st: IoStatus) {
        self.status.store(st as u8, Ordering::Release);
    }
}
