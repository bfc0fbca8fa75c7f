//! Transfer descriptors for the eMMC engine.
//!
//! Same claim protocol as the SD slot's transfers: a single atomic status
//! byte carries either a terminal [`IoStatus`] or one of two in-flight
//! markers, and the mutable body hides behind a mutex nobody contends
//! unless the protocol is violated.
//!
//! The body is shaped for SDMA rather than a descriptor ring: one
//! contiguous destination range, plus the next boundary address the
//! service path programs whenever the engine pauses at a DMA boundary.

use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

use crate::iost::{IoStatus, NUM_IOST};
use crate::types::{PhysAddr, PhysRange};

/// SDMA buffer boundary: the engine raises an interrupt and stalls every
/// time the transfer crosses a 512 KiB line.
pub const SDMA_BOUNDARY: u64 = 512 * 1024;
/// Boundary select field for the block_size register (512 KiB).
pub const SDMA_BOUNDARY_FIELD: u16 = 7 << 12;

/// Status marker: claimed by an owner that is still adding buffers.
pub const XFER_CREATING: u8 = NUM_IOST;
/// Status marker: handed to hardware.
pub const XFER_SUBMITTED: u8 = NUM_IOST + 1;

pub struct Transfer {
    status: AtomicU8,
    pub(super) body: Mutex<TransferBody>,
}

pub(super) struct TransferBody {
    pub block_addr: u32,
    pub buf: PhysRange,
    /// Address to write into the system address register at the next
    /// boundary stall.
    pub next_boundary: u64,
}

impl Transfer {
    pub const fn new() -> Self {
        Transfer {
            status: AtomicU8::new(IoStatus::Ok as u8),
            body: Mutex::new(TransferBody {
                block_addr: 0,
                buf: PhysRange {
                    start: PhysAddr(0),
                    end: PhysAddr(0),
                },
                next_boundary: 0,
            }),
        }
    }

    /// Claim the descriptor for a new request starting at `block_addr`.
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
        body.buf = PhysRange::new(PhysAddr(0), PhysAddr(0));
        body.next_boundary = 0;
        IoStatus::Ok
    }

    /// Extend the destination buffer. SDMA walks one linear region, so a
    /// second range is accepted only if it continues exactly where the
    /// first ended; anything else is rejected.
    pub fn add_phys_buffer(&self, range: PhysRange) -> bool {
        debug_assert_eq!(self.status.load(Ordering::Relaxed), XFER_CREATING);
        if range.start.0 & 3 != 0 || range.end.0 & 3 != 0 {
            return false;
        }
        if range.is_empty() {
            return true;
        }
        let mut body = self.body.lock();
        if body.buf.is_empty() {
            body.buf = range;
        } else if range.start == body.buf.end {
            body.buf.end = range.end;
        } else {
            return false;
        }
        true
    }

    pub fn status_raw(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    /// Terminal outcome, if the transfer has reached one.
    pub fn outcome(&self) -> Option<IoStatus> {
        IoStatus::from_u8(self.status_raw())
    }

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

    pub(super) fn unsubmit(&self) {
        self.status.store(XFER_CREATING, Ordering::Relaxed);
    }

    pub(super) fn finish(&self, st: IoStatus) {
        self.status.store(st as u8, Ordering::Release);
    }
}

/// First 512 KiB boundary strictly above `addr`.
pub(super) fn next_boundary_after(addr: u64) -> u64 {
    (addr | (SDMA_BOUNDARY - 1)) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, len: u64) -> PhysRange {
        PhysRange::new(PhysAddr(start), PhysAddr(start + len))
    }

    #[test]
    fn test_contiguous_extension_only() {
        let xfer = Transfer::new();
        assert_eq!(xfer.begin_request(0), IoStatus::Ok);
        assert!(xfer.add_phys_buffer(range(0x10_0000, 512)));
        assert!(xfer.add_phys_buffer(range(0x10_0200, 512)));
        // A gap cannot be expressed to the SDMA engine.
        assert!(!xfer.add_phys_buffer(range(0x20_0000, 512)));
        assert_eq!(xfer.body.lock().buf.len(), 1024);
    }

    #[test]
    fn test_unaligned_rejected() {
        let xfer = Transfer::new();
        assert_eq!(xfer.begin_request(0), IoStatus::Ok);
        assert!(!xfer.add_phys_buffer(range(0x10_0001, 512)));
        assert!(xfer.body.lock().buf.is_empty());
    }

    #[test]
    fn test_reclaim_after_terminal() {
        let xfer = Transfer::new();
        assert_eq!(xfer.begin_request(1), IoStatus::Ok);
        assert!(xfer.mark_submitted());
        assert_eq!(xfer.begin_request(2), IoStatus::Transient);
        xfer.finish(IoStatus::Local);
        assert_eq!(xfer.outcome(), Some(IoStatus::Local));
        assert_eq!(xfer.begin_request(2), IoStatus::Ok);
        assert!(xfer.body.lock().buf.is_empty());
    }

    #[test]
    fn test_boundary_arithmetic() {
        assert_eq!(next_boundary_after(0), SDMA_BOUNDARY);
        assert_eq!(next_boundary_after(SDMA_BOUNDARY - 1), SDMA_BOUNDARY);
        assert_eq!(next_boundary_after(SDMA_BOUNDARY), 2 * SDMA_BOUNDARY);
        assert_eq!(next_boundary_after(0x12_3456), 3 * SDMA_BOUNDARY);
    }
}
