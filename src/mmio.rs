//! Memory-mapped register access.
//!
//! Register blocks are plain `#[repr(C)]` structs whose fields are [`Reg`]
//! cells. Every access goes through a volatile read or write, so the
//! compiler may not elide, cache, or reorder them; this is the access
//! contract the drivers rely on, stated here once instead of at every call
//! site. Because a register block is just memory with that contract, tests
//! instantiate the same struct in ordinary RAM and poke it as a mock
//! device.
//!
//! Field offsets are pinned by `offset_of!` assertions next to each layout
//! so a reordered field fails the build, not the board.

use core::cell::UnsafeCell;

/// A single hardware register of primitive width.
#[repr(transparent)]
pub struct Reg<T: Copy> {
    value: UnsafeCell<T>,
}

// Register blocks are shared between the command-sequencing context and the
// interrupt bridge; the hardware access protocol (single writer per field
// at a time) is what makes that sound, not the type system.
unsafe impl<T: Copy> Sync for Reg<T> {}

impl<T: Copy> Reg<T> {
    /// A register cell with an initial value, for mock blocks in tests.
    pub const fn new(value: T) -> Self {
        Reg {
            value: UnsafeCell::new(value),
        }
    }

    /// Volatile read.
    pub fn read(&self) -> T {
        unsafe { core::ptr::read_volatile(self.value.get()) }
    }

    /// Volatile write.
    pub fn write(&self, value: T) {
        unsafe { core::ptr::write_volatile(self.value.get(), value) }
    }
}

impl<T: Copy + core::ops::BitOr<Output = T>> Reg<T> {
    /// Read-modify-write OR. Not atomic; callers hold the single-writer
    /// responsibility for the field.
    pub fn set_bits(&self, bits: T) {
        self.write(self.read() | bits);
    }
}

impl<T: Copy + core::ops::BitAnd<Output = T> + core::ops::Not<Output = T>> Reg<T> {
    /// Read-modify-write AND-NOT.
    pub fn clear_bits(&self, bits: T) {
        self.write(self.read() & !bits);
    }
}

/// Borrow a register block from its physical base address.
///
/// # Safety
/// `base` must be the physical base of a live device register block with
/// layout `T`, mapped device-memory, and the returned borrow must be the
/// only typed view constructed for it.
pub unsafe fn device<'a, T>(base: usize) -> &'a T {
    &*(base as *const T)
}

/// Store barrier: all prior register/memory writes become globally visible
/// before any later write. Required between programming a transfer and the
/// command-start write that makes hardware look at it.
#[inline(always)]
pub fn barrier_sy() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Store-only barrier, for ordering plain stores before a command write.
#[inline(always)]
pub fn barrier_st() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb st", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_read_write() {
        let r: Reg<u32> = Reg::new(0);
        r.write(0xdead_beef);
        assert_eq!(r.read(), 0xdead_beef);
    }

    #[test]
    fn test_reg_bit_ops() {
        let r: Reg<u32> = Reg::new(0x0f);
        r.set_bits(0xf0);
        assert_eq!(r.read(), 0xff);
        r.clear_bits(0x0f);
        assert_eq!(r.read(), 0xf0);
    }

    #[test]
    fn test_reg_is_transparent() {
        assert_eq!(core::mem::size_of::<Reg<u32>>(), 4);
        assert_eq!(core::mem::size_of::<Reg<u16>>(), 2);
        assert_eq!(core::mem::size_of::<Reg<u8>>(), 1);
    }
}
