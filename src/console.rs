//! Console output for the boot stage.
//!
//! Bring-up and the drivers log status transitions here. The UART itself is
//! a simple polled peripheral outside this core; this module only owns the
//! global writer and the formatting macros.

use core::fmt::{self, Write};
use spin::Mutex;

// Debug UART base on the supported SoC (identity-mapped).
const UART_BASE: usize = 0xff1a_0000;
const UART_THR: usize = 0x0;
const UART_LSR: usize = 0x14;
const UART_LSR_THRE: u8 = 0x20;

struct Uart {
    base: usize,
}

impl Uart {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    unsafe fn putc(&self, c: u8) {
        let lsr = (self.base + UART_LSR) as *const u8;
        while lsr.read_volatile() & UART_LSR_THRE == 0 {
            core::hint::spin_loop();
        }
        let thr = (self.base + UART_THR) as *mut u8;
        thr.write_volatile(c);
    }
}

/// Console writer
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<1024>,
}

impl Console {
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(not(test))]
        {
            unsafe {
                Uart::new(UART_BASE).putc(byte);
            }
        }
    }

    /// Write a string, translating newlines for serial output
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str(s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for firmware use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Verbose driver tracing; compiled out unless the `debug_msg` feature is on.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(feature = "debug_msg") {
            $crate::console::print(format_args!("{}\n", format_args!($($arg)*)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_write() {
        let mut c = Console::new();
        c.write_str("ok\n");
        assert_eq!(c.buffer.as_str(), "ok\r\n");
    }
}
