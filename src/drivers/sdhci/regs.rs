//! SDHC register block and bit assignments.
//!
//! Unlike the SD slot controller this one mixes register widths, so the
//! layout carries 8-, 16- and 32-bit cells. The normal and error
//! interrupt status halves are adjacent and handled as one 32-bit word,
//! with the error causes in the high half.

use crate::mmio::Reg;

#[repr(C)]
pub struct SdhciRegs {
    /// SDMA system address; doubles as argument 2 for CMD23.
    pub system_addr: Reg<u32>,
    pub block_size: Reg<u16>,
    pub block_count: Reg<u16>,
    pub arg: Reg<u32>,
    pub transfer_mode: Reg<u16>,
    pub cmd: Reg<u16>,
    pub resp: [Reg<u32>; 4],
    pub fifo: Reg<u32>,
    pub present_state: Reg<u32>,
    pub host_control1: Reg<u8>,
    pub power_control: Reg<u8>,
    pub block_gap_control: Reg<u8>,
    _pad0: Reg<u8>,
    pub clock_control: Reg<u16>,
    pub timeout_control: Reg<u8>,
    pub swreset: Reg<u8>,
    /// Normal (low half) and error (high half) interrupt status.
    pub int_st: Reg<u32>,
    pub int_st_enable: Reg<u32>,
    pub int_signal_enable: Reg<u32>,
    pub auto_cmd_error_st: Reg<u16>,
    pub host_control2: Reg<u16>,
    pub capabilities: [Reg<u32>; 2],
    pub max_current: [Reg<u32>; 2],
    pub force_event_auto_cmd: Reg<u16>,
    pub force_event: Reg<u16>,
    pub adma_error_st: Reg<u16>,
    _pad1: Reg<u16>,
    pub adma_addr: [Reg<u32>; 2],
    pub preset_value: [Reg<u16>; 7],
    _pad2: Reg<u16>,
    pub boot_timeout: Reg<u32>,
    pub preset_value_hs400: Reg<u16>,
    _pad3: Reg<u16>,
    pub vendor: Reg<u16>,
    _pad4: [Reg<u8>; 0x82],
    pub slot_int_st: Reg<u16>,
    pub version: Reg<u16>,
}

const _: () = {
    use core::mem::offset_of;
    assert!(offset_of!(SdhciRegs, block_size) == 0x04);
    assert!(offset_of!(SdhciRegs, present_state) == 0x24);
    assert!(offset_of!(SdhciRegs, swreset) == 0x2f);
    assert!(offset_of!(SdhciRegs, int_st) == 0x30);
    assert!(offset_of!(SdhciRegs, capabilities) == 0x40);
    assert!(offset_of!(SdhciRegs, force_event_auto_cmd) == 0x50);
    assert!(offset_of!(SdhciRegs, preset_value) == 0x60);
    assert!(offset_of!(SdhciRegs, boot_timeout) == 0x70);
    assert!(offset_of!(SdhciRegs, version) == 0xfe);
};

#[cfg(test)]
impl SdhciRegs {
    /// All-zero register file for mock devices.
    pub fn mock() -> Self {
        // SAFETY: every field is a Reg over a primitive, transparent over
        // UnsafeCell, for which all-zeroes is valid.
        unsafe { core::mem::zeroed() }
    }
}

// ==== transfer_mode ====
pub const TRANSMOD_MULTIBLOCK: u16 = 1 << 5;
pub const TRANSMOD_READ: u16 = 1 << 4;
pub const TRANSMOD_AUTO_CMD12: u16 = 1 << 2;
pub const TRANSMOD_BLOCK_COUNT: u16 = 1 << 1;
pub const TRANSMOD_DMA: u16 = 1 << 0;

// ==== cmd ====
pub const CMD_RESP136: u16 = 1;
pub const CMD_RESP48: u16 = 2;
pub const CMD_RESP48_BUSY: u16 = 3;
pub const CMD_RESP_MASK: u16 = 3;
pub const CMD_CRC: u16 = 1 << 3;
pub const CMD_RESPIDX: u16 = 1 << 4;
pub const CMD_DATA: u16 = 1 << 5;
pub const CMD_ABORT: u16 = 3 << 6;

pub const R1: u16 = CMD_RESP48 | CMD_CRC | CMD_RESPIDX;
pub const R1B: u16 = CMD_RESP48_BUSY | CMD_CRC | CMD_RESPIDX;
pub const R2: u16 = CMD_RESP136 | CMD_CRC;
pub const R3: u16 = CMD_RESP48;

/// Command index into the cmd register's index field.
pub const fn sdhci_cmd(index: u16) -> u16 {
    index << 8
}

// ==== present_state ====
pub const PRESTS_READ_READY: u32 = 1 << 11;
pub const PRESTS_WRITE_READY: u32 = 1 << 10;
pub const PRESTS_READ_ACTIVE: u32 = 1 << 9;
pub const PRESTS_WRITE_ACTIVE: u32 = 1 << 8;
pub const PRESTS_DAT_INHIBIT: u32 = 1 << 1;
pub const PRESTS_CMD_INHIBIT: u32 = 1 << 0;

// ==== host_control1 ====
pub const HOSTCTRL1_BUS_WIDTH_8: u8 = 1 << 5;
pub const HOSTCTRL1_DMA_MASK: u8 = 3 << 3;
pub const HOSTCTRL1_SDMA: u8 = 0;
pub const HOSTCTRL1_HIGH_SPEED_MODE: u8 = 1 << 2;
pub const HOSTCTRL1_BUS_WIDTH_4: u8 = 1 << 1;

// ==== power_control ====
pub const PWRCTRL_ON: u8 = 1;
pub const PWRCTRL_1V8: u8 = 0xa;
pub const PWRCTRL_3V0: u8 = 0xc;
pub const PWRCTRL_3V3: u8 = 0xe;

// ==== clock_control ====
pub const CLKCTRL_SDCLK_EN: u16 = 4;
pub const CLKCTRL_INTCLK_STABLE: u16 = 2;
pub const CLKCTRL_INTCLK_EN: u16 = 1;

/// Encode a 10-bit clock divider: low eight bits at 15:8, high two at 7:6.
/// Callers keep `div` below 0x400; anything larger does not fit the field.
pub const fn clkctrl_div(div: u32) -> u16 {
    (div >> 1 << 8) as u16 | (div >> 3 & 0xc0) as u16
}

// ==== swreset ====
pub const SWRST_DAT: u8 = 4;
pub const SWRST_CMD: u8 = 2;
pub const SWRST_ALL: u8 = 1;

// ==== int_st (32-bit view) ====
pub const INT_CMD_COMPLETE: u32 = 1 << 0;
pub const INT_XFER_COMPLETE: u32 = 1 << 1;
pub const INT_BLOCK_GAP: u32 = 1 << 2;
/// SDMA boundary crossing: the engine pauses until the system address
/// register is rewritten.
pub const INT_DMA: u32 = 1 << 3;
pub const INT_BUFFER_WRITE_READY: u32 = 1 << 4;
pub const INT_BUFFER_READ_READY: u32 = 1 << 5;
pub const INT_CARD_INT: u32 = 1 << 8;
pub const INT_ERROR: u32 = 1 << 15;
pub const ERRINT_CMD_TIMEOUT: u32 = 1 << 16;
pub const ERRINT_CMD_CRC: u32 = 1 << 17;
pub const ERRINT_CMD_END_BIT: u32 = 1 << 18;
pub const ERRINT_CMD_INDEX: u32 = 1 << 19;
pub const ERRINT_DATA_TIMEOUT: u32 = 1 << 20;
pub const ERRINT_DATA_CRC: u32 = 1 << 21;
pub const ERRINT_DATA_END_BIT: u32 = 1 << 22;
pub const INT_ERROR_MASK: u32 = 0xffff_0000;
pub const INTMASK_ALL: u32 = 0x13ff_f1ff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clkctrl_div_encoding() {
        // Divider 500: N = 250 = 0xfa in bits 15:8, high bits clear.
        assert_eq!(clkctrl_div(500), 0xfa00);
        // Largest encodable divider spills into the 7:6 field.
        assert_eq!(clkctrl_div(0x3ff), 0xff40);
        assert_eq!(clkctrl_div(2), 0x0100);
    }
}
