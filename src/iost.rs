//! Graded I/O outcome codes.
//!
//! Every fallible storage operation reports one of these five codes instead
//! of an error type hierarchy. The codes form a severity ladder, not a flat
//! set: callers implement policy by threshold (retry on `Transient`, abandon
//! the device on `Local`/`Global`, treat `Invalid` as a logic bug to report).

/// Outcome of a storage operation, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum IoStatus {
    /// The operation completed.
    Ok = 0,
    /// Transient fault: the same request may be tried again.
    Transient = 1,
    /// Invalid request: malformed or permanently rejected, but the hardware
    /// is operating normally.
    Invalid = 2,
    /// Local fault: this request should not be retried, but others on the
    /// same device may still work.
    Local = 3,
    /// Global fault: the device may be in a completely broken state; do not
    /// retry on this device.
    Global = 4,
}

/// Number of outcome codes; drivers use values at and above this as
/// non-terminal in-flight markers in transfer status words.
pub const NUM_IOST: u8 = 5;

impl IoStatus {
    /// Decode a status byte. Values at or above [`NUM_IOST`] are in-flight
    /// markers, not outcomes.
    pub fn from_u8(v: u8) -> Option<IoStatus> {
        match v {
            0 => Some(IoStatus::Ok),
            1 => Some(IoStatus::Transient),
            2 => Some(IoStatus::Invalid),
            3 => Some(IoStatus::Local),
            4 => Some(IoStatus::Global),
            _ => None,
        }
    }

    /// True if this outcome is at least as severe as `bar`.
    pub fn at_least(self, bar: IoStatus) -> bool {
        self >= bar
    }

    /// True if the same request may be retried on the same device.
    pub fn retryable(self) -> bool {
        self == IoStatus::Transient
    }

    /// True if the device as a whole should be given up on.
    pub fn device_failed(self) -> bool {
        self >= IoStatus::Local
    }

    pub fn name(self) -> &'static str {
        match self {
            IoStatus::Ok => "OK",
            IoStatus::Transient => "TRANSIENT",
            IoStatus::Invalid => "INVALID",
            IoStatus::Local => "LOCAL",
            IoStatus::Global => "GLOBAL",
        }
    }
}
