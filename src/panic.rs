//! Panic handling.
//!
//! A panic in the boot stage means a failed invariant or a corrupted
//! execution environment; there is no trusted context to recover into, so
//! the handler reports once and parks the processor.

/// Park the processor. Interrupts stay masked from the caller's context;
/// WFI still wakes for physical interrupts but we loop right back.
pub fn halt() -> ! {
    loop {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "aarch64"))]
        core::hint::spin_loop();
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::println!("PANIC: {}", info);
    halt()
}
