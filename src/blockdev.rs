//! The block-device seam between boot logic and controller drivers.

use crate::iost::IoStatus;
use crate::types::PhysRange;

/// A device that reads whole blocks into physical memory.
///
/// `start` only admits the request; completion is reported through the
/// driver's own transfer handle, which the caller waits on. Implementations
/// return [`IoStatus::Invalid`] for out-of-range or misaligned requests
/// without touching hardware.
pub trait BlockDev {
    /// Bytes per addressable block, a power of two.
    fn block_size(&self) -> u32;

    /// Total addressable blocks.
    fn num_blocks(&self) -> u64;

    /// Begin reading `buf.len() / block_size` blocks starting at `addr`.
    fn start(&self, addr: u64, buf: PhysRange) -> IoStatus;
}
