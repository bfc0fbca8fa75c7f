//! iDMAC descriptors and the bounded segment ring.
//!
//! The SD/MMC controller's internal DMA engine walks a list of 16-byte
//! descriptors, each covering up to two buffer segments of at most 4 KiB.
//! Ownership of a descriptor is a single bit: software fills the fields,
//! then release-publishes the control word with OWN set; hardware clears
//! OWN when the segment is done. Descriptors therefore retire strictly in
//! issue order, and the ring's two monotonic counters (`written`,
//! `completed`) never drift more than the capacity apart.
//!
//! When a transfer needs more segments than the ring holds, the engine
//! raises a descriptor-unavailable interrupt; the service path retires
//! finished slots, refills them with the next segments, and pokes the
//! engine's poll-demand register to resume. That keeps the descriptor
//! memory footprint constant no matter how large the transfer is.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::mmio::barrier_st;
use crate::types::{PhysAddr, PhysRange};

/// Largest byte count one descriptor buffer slot may carry.
pub const SEG_MAX: usize = 4096;

/// Width of one buffer-size field in the descriptor `sizes` word.
const SIZE_MASK: u32 = 0x1fff;

// ==== descriptor control bits ====
pub const DES_OWN: u32 = 1 << 31;
/// Card error summary, set by hardware on the faulting descriptor.
pub const DES_CES: u32 = 1 << 30;
pub const DES_END_OF_RING: u32 = 1 << 5;
pub const DES_CHAIN_PTR: u32 = 1 << 4;
pub const DES_FIRST: u32 = 1 << 3;
pub const DES_LAST: u32 = 1 << 2;
pub const DES_DISABLE_INTERRUPT: u32 = 1 << 1;

// ============================================================================
// Descriptor
// ============================================================================

/// One internal-DMA descriptor, in the controller's wire layout.
///
/// Every field is atomic because hardware writes `control` concurrently
/// with software reading it; each descriptor sits alone on a cache line so
/// maintenance operations never clobber a neighbor.
#[repr(C, align(64))]
pub struct IdmacDesc {
    control: AtomicU32,
    sizes: AtomicU32,
    ptr1: AtomicU32,
    ptr2: AtomicU32,
}

impl IdmacDesc {
    pub const fn new() -> Self {
        IdmacDesc {
            control: AtomicU32::new(0),
            sizes: AtomicU32::new(0),
            ptr1: AtomicU32::new(0),
            ptr2: AtomicU32::new(0),
        }
    }

    /// Fill the primary buffer slot. Must precede [`publish`](Self::publish).
    pub fn set_buf1(&self, addr: PhysAddr, size: u32) {
        debug_assert!(size <= SEG_MAX as u32);
        self.ptr1.store(addr.lo32(), Ordering::Relaxed);
        self.sizes.store(size & SIZE_MASK, Ordering::Relaxed);
    }

    /// Fill the secondary buffer slot of an already half-filled descriptor.
    pub fn set_buf2(&self, addr: PhysAddr, size: u32) {
        debug_assert!(size <= SEG_MAX as u32);
        self.ptr2.store(addr.lo32(), Ordering::Relaxed);
        let sizes = self.sizes.load(Ordering::Relaxed);
        self.sizes
            .store(sizes | (size & SIZE_MASK) << 13, Ordering::Relaxed);
    }

    /// Point the chain link at the next descriptor (chained mode only; the
    /// secondary buffer slot doubles as the link).
    pub fn set_chain(&self, next: PhysAddr) {
        self.ptr2.store(next.lo32(), Ordering::Relaxed);
    }

    /// Hand the descriptor to hardware. Release pairs with the acquire in
    /// [`is_owned`](Self::is_owned) so the buffer fields are committed
    /// first.
    pub fn publish(&self, control: u32) {
        self.control.store(control, Ordering::Release);
    }

    pub fn control(&self) -> u32 {
        self.control.load(Ordering::Acquire)
    }

    /// True while hardware still owns the descriptor.
    pub fn is_owned(&self) -> bool {
        self.control() & DES_OWN != 0
    }

    /// Total bytes covered by both buffer slots.
    pub fn byte_count(&self) -> u32 {
        let sizes = self.sizes.load(Ordering::Relaxed);
        (sizes & SIZE_MASK) + (sizes >> 13 & SIZE_MASK)
    }

    pub fn clear(&self) {
        self.control.store(0, Ordering::Relaxed);
        self.sizes.store(0, Ordering::Relaxed);
        self.ptr1.store(0, Ordering::Relaxed);
        self.ptr2.store(0, Ordering::Relaxed);
    }
}

/// Make a descriptor the engine wrote visible to us. The engine writes
/// physical memory directly, so the local cache line must be discarded
/// before reading the control word back.
#[inline]
pub fn sync_desc_for_read(desc: &IdmacDesc) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "dc ivac, {0}",
            "dmb sy",
            in(reg) desc as *const IdmacDesc,
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = desc;
}

/// Discard cached copies of a buffer the engine filled, line by line.
pub fn invalidate_buffer(range: PhysRange) {
    #[cfg(target_arch = "aarch64")]
    {
        let mut addr = range.start.0 & !63;
        while addr < range.end.0 {
            unsafe {
                core::arch::asm!("dc ivac, {0}", in(reg) addr, options(nostack, preserves_flags));
            }
            addr += 64;
        }
        crate::mmio::barrier_sy();
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = range;
}

// ============================================================================
// Segment Ring
// ============================================================================

/// Most physical ranges one transfer's scatter list may carry.
pub const MAX_SEGS: usize = 16;

/// A fixed-capacity descriptor ring feeding one receive transfer.
///
/// The transfer's scatter list is queued up front with
/// [`add_range`](Self::add_range); [`refill`](Self::refill) carves it into
/// hardware segments of at most [`SEG_MAX`] bytes as slots free up.
/// `written` and `completed` count descriptors ever issued and ever
/// retired; both only grow, and `written - completed` is the number of
/// slots hardware currently owns, bounded by `N`. Slot reuse is pure
/// modular indexing, so the ring serves transfers of any length.
pub struct SegRing<const N: usize> {
    desc: [IdmacDesc; N],
    written: u32,
    completed: u32,
    pending: heapless::Deque<PhysRange, MAX_SEGS>,
    bytes_left: usize,
    bytes_done: usize,
    total: usize,
}

impl<const N: usize> SegRing<N> {
    pub const fn new() -> Self {
        SegRing {
            desc: [const { IdmacDesc::new() }; N],
            written: 0,
            completed: 0,
            pending: heapless::Deque::new(),
            bytes_left: 0,
            bytes_done: 0,
            total: 0,
        }
    }

    /// Physical address of the first descriptor, for the engine's
    /// list-base register.
    pub fn base(&self) -> PhysAddr {
        PhysAddr::from_ref(&self.desc[0])
    }

    /// Drop all queued work and forget past counters. The caller must not
    /// reset a ring hardware is still walking.
    pub fn reset(&mut self) {
        for d in &self.desc {
            d.clear();
        }
        self.written = 0;
        self.completed = 0;
        self.pending.clear();
        self.bytes_left = 0;
        self.bytes_done = 0;
        self.total = 0;
    }

    /// Queue one scatter-list range. Fails when the list is full; empty
    /// ranges are accepted and ignored.
    pub fn add_range(&mut self, range: PhysRange) -> bool {
        if range.is_empty() {
            return true;
        }
        if self.pending.push_back(range).is_err() {
            return false;
        }
        self.bytes_left += range.len() as usize;
        self.total += range.len() as usize;
        true
    }

    /// Reset, queue a single contiguous buffer, and issue the first batch
    /// of segments. The polled read path uses this shape.
    pub fn start(&mut self, buf: PhysRange) {
        self.reset();
        let ok = self.add_range(buf);
        debug_assert!(ok);
        self.refill();
    }

    /// Descriptors currently owned by hardware.
    pub fn in_flight(&self) -> u32 {
        debug_assert!(self.written - self.completed <= N as u32);
        self.written - self.completed
    }

    /// True once every byte of the transfer has been issued and retired.
    pub fn is_complete(&self) -> bool {
        self.bytes_left == 0 && self.completed == self.written
    }

    pub fn bytes_transferred(&self) -> usize {
        self.bytes_done
    }

    /// Total bytes across the whole queued scatter list.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Retire descriptors hardware has released, oldest first, stopping at
    /// the first one still owned. Returns the bytes newly completed.
    pub fn retire(&mut self) -> usize {
        let mut freed = 0;
        while self.completed < self.written {
            let desc = &self.desc[self.completed as usize % N];
            sync_desc_for_read(desc);
            if desc.is_owned() {
                break;
            }
            let bytes = desc.byte_count() as usize;
            let start = PhysAddr(desc.ptr1.load(Ordering::Relaxed) as u64);
            invalidate_buffer(PhysRange::new(start, PhysAddr(start.0 + bytes as u64)));
            freed += bytes;
            self.completed += 1;
        }
        self.bytes_done += freed;
        freed
    }

    /// Mock-device hook: complete the `count` oldest in-flight
    /// descriptors by clearing their OWN bits.
    #[cfg(test)]
    pub(crate) fn testing_release(&self, count: u32) {
        let mut done = 0;
        let mut idx = self.completed;
        while done < count && idx < self.written {
            let desc = &self.desc[idx as usize % N];
            assert!(desc.is_owned(), "device completed an unowned descriptor");
            desc.publish(desc.control() & !DES_OWN);
            idx += 1;
            done += 1;
        }
        assert_eq!(done, count, "not enough in-flight descriptors");
    }

    /// Issue segments into every free slot. Returns true if the caller
    /// should poke the engine's poll-demand register because descriptors
    /// were previously exhausted.
    pub fn refill(&mut self) -> bool {
        let mut wrote = false;
        while self.bytes_left > 0 && self.completed + N as u32 > self.written {
            let Some(range) = self.pending.front_mut() else {
                debug_assert!(false, "byte count out of sync with scatter list");
                break;
            };
            let size = (range.len() as usize).min(SEG_MAX) as u32;
            let idx = self.written as usize % N;
            let desc = &self.desc[idx];
            desc.set_buf1(range.start, size);
            desc.set_chain(PhysAddr(0));
            range.start = PhysAddr(range.start.0 + size as u64);
            if range.is_empty() {
                self.pending.pop_front();
            }
            self.bytes_left -= size as usize;

            let mut control = DES_OWN;
            if self.written == 0 {
                control |= DES_FIRST;
            }
            if self.bytes_left == 0 {
                control |= DES_LAST;
            }
            if idx == N - 1 {
                control |= DES_END_OF_RING;
            }
            // The fields must be in memory before hardware can see OWN.
            barrier_st();
            desc.publish(control);
            self.written += 1;
            wrote = true;
        }
        wrote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw_release<const N: usize>(ring: &SegRing<N>, count: u32) {
        ring.testing_release(count);
    }

    fn buf(len: usize) -> PhysRange {
        PhysRange::new(PhysAddr(0x10_0000), PhysAddr(0x10_0000 + len as u64))
    }

    #[test]
    fn test_single_segment() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.start(buf(512));
        assert_eq!(ring.in_flight(), 1);
        let c = ring.desc[0].control();
        assert_eq!(c & (DES_FIRST | DES_LAST | DES_OWN), DES_FIRST | DES_LAST | DES_OWN);
        assert_eq!(ring.desc[0].byte_count(), 512);

        hw_release(&ring, 1);
        assert_eq!(ring.retire(), 512);
        assert!(ring.is_complete());
        assert_eq!(ring.bytes_transferred(), 512);
    }

    #[test]
    fn test_short_tail_segment() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.start(buf(4096 + 512));
        assert_eq!(ring.in_flight(), 2);
        assert_eq!(ring.desc[0].byte_count(), 4096);
        assert_eq!(ring.desc[1].byte_count(), 512);
        assert_eq!(ring.desc[0].control() & DES_LAST, 0);
        assert_ne!(ring.desc[1].control() & DES_LAST, 0);
    }

    #[test]
    fn test_in_flight_bounded_by_capacity() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.start(buf(10 * 4096));
        assert_eq!(ring.in_flight(), 4);
        // No slot free: refill must be a no-op.
        assert!(!ring.refill());
        assert_eq!(ring.in_flight(), 4);
    }

    #[test]
    fn test_retire_stops_at_owned() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.start(buf(3 * 4096));
        hw_release(&ring, 1);
        assert_eq!(ring.retire(), 4096);
        assert_eq!(ring.in_flight(), 2);
        // Second call with nothing new released retires nothing.
        assert_eq!(ring.retire(), 0);
    }

    #[test]
    fn test_long_transfer_reuses_slots() {
        // 10 segments through a 4-deep ring, serviced the way the
        // interrupt path does: retire, then refill.
        let mut ring: SegRing<4> = SegRing::new();
        ring.start(buf(10 * 4096));
        let mut total = 0;
        while !ring.is_complete() {
            hw_release(&ring, 1);
            total += ring.retire();
            ring.refill();
            assert!(ring.in_flight() <= 4);
        }
        assert_eq!(total, 10 * 4096);
        assert_eq!(ring.written, 10);
        assert_eq!(ring.completed, 10);
        // LAST must have landed on the final segment only.
        assert_ne!(ring.desc[(10 - 1) % 4].control() & DES_LAST, 0);
    }

    #[test]
    fn test_end_of_ring_on_wrap_slot() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.start(buf(6 * 4096));
        assert_ne!(ring.desc[3].control() & DES_END_OF_RING, 0);
        assert_eq!(ring.desc[0].control() & DES_END_OF_RING, 0);
        // Wrap: slot 3 keeps END_OF_RING on its next use as well.
        hw_release(&ring, 4);
        ring.retire();
        ring.refill();
        hw_release(&ring, 2);
        ring.retire();
        assert!(ring.is_complete());
        assert_ne!(ring.desc[3].control() & DES_END_OF_RING, 0);
    }

    #[test]
    fn test_scatter_ranges_issue_in_order() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.reset();
        assert!(ring.add_range(PhysRange::new(PhysAddr(0x2000), PhysAddr(0x2200))));
        assert!(ring.add_range(PhysRange::new(PhysAddr(0x8000), PhysAddr(0x8200))));
        assert_eq!(ring.total_bytes(), 0x400);
        ring.refill();
        assert_eq!(ring.desc[0].ptr1.load(Ordering::Relaxed), 0x2000);
        assert_eq!(ring.desc[1].ptr1.load(Ordering::Relaxed), 0x8000);
        // LAST lands on the final range's final segment only.
        assert_eq!(ring.desc[0].control() & DES_LAST, 0);
        assert_ne!(ring.desc[1].control() & DES_LAST, 0);
    }

    #[test]
    fn test_scatter_list_capacity() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.reset();
        for i in 0..MAX_SEGS as u64 {
            let base = 0x10_0000 + i * 0x1000;
            assert!(ring.add_range(PhysRange::new(PhysAddr(base), PhysAddr(base + 512))));
        }
        assert!(!ring.add_range(PhysRange::new(PhysAddr(0x80_0000), PhysAddr(0x80_0200))));
        // Empty ranges never consume a slot.
        assert!(ring.add_range(PhysRange::new(PhysAddr(8), PhysAddr(8))));
    }

    #[test]
    fn test_consecutive_segment_addresses() {
        let mut ring: SegRing<4> = SegRing::new();
        ring.start(buf(2 * 4096));
        assert_eq!(ring.desc[0].ptr1.load(Ordering::Relaxed), 0x10_0000);
        assert_eq!(ring.desc[1].ptr1.load(Ordering::Relaxed), 0x10_1000);
    }
}
