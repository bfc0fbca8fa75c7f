//! Emberboot - boot-stage firmware core for an ARM64 system-on-chip
//!
//! This crate provides the concurrency core of a bare-metal boot stage: a
//! cooperative scheduler built on intrusive run queues, and the
//! interrupt-synchronized DMA transfer engines used by the SD/MMC and eMMC
//! controller drivers to load the next boot stage without busy-waiting.
//!
//! The boot-medium selection ladder lives in the binary (`main.rs`) and
//! consumes the drivers through the [`blockdev::BlockDev`] seam, deciding
//! retry/fallback policy from the graded [`iost::IoStatus`] codes.

#![no_std]
// Firmware-appropriate clippy configuration
// Many hardware types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]
// Register-level code needs explicit casts for memory-mapped I/O
#![allow(clippy::unnecessary_cast)]

// Core types
pub mod types;

// Re-exports
pub mod blockdev;
pub mod console;
pub mod dma;
pub mod drivers;
pub mod iost;
pub mod mmc;
pub mod mmio;
pub mod panic;
pub mod sched;
pub mod timer;
pub mod wait;

/// Firmware version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Firmware name
pub const NAME: &str = "emberboot";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "emberboot");
        assert!(!VERSION.is_empty());
    }
}
