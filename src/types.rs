//! Core types shared across the firmware.

/// A physical address as seen by DMA engines.
///
/// The boot stage runs with an identity mapping, so conversion from a
/// kernel pointer is a plain cast; the newtype exists so that driver
/// signatures say which address space they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Physical address of an object, under the boot-stage identity map.
    pub fn from_ref<T>(r: &T) -> Self {
        PhysAddr(r as *const T as u64)
    }

    /// Low 32 bits, for controllers with 32-bit DMA registers.
    pub fn lo32(self) -> u32 {
        self.0 as u32
    }
}

/// A half-open physical buffer range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

impl PhysRange {
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        PhysRange { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.0 - self.start.0
    }

    pub fn is_empty(&self) -> bool {
        self.end.0 <= self.start.0
    }
}

/// Block size used by both storage controller families.
pub const BLOCK_SIZE: u32 = 512;

/// Raw ticks of the monotonic hardware counter.
pub type Ticks = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_range() {
        let r = PhysRange::new(PhysAddr(0x1000), PhysAddr(0x3000));
        assert_eq!(r.len(), 0x2000);
        assert!(!r.is_empty());
        assert!(PhysRange::new(PhysAddr(8), PhysAddr(8)).is_empty());
    }

    #[test]
    fn test_phys_addr_lo32() {
        assert_eq!(PhysAddr(0x1_2345_6789).lo32(), 0x2345_6789);
    }
}
