//! DesignWare MSHC register block and bit assignments.

use crate::mmio::Reg;

/// The controller's register file. Instantiated over the device's MMIO
/// window on the target and over plain RAM in tests.
#[repr(C)]
pub struct DwmmcRegs {
    pub ctrl: Reg<u32>,
    pub pwren: Reg<u32>,
    pub clkdiv: Reg<u32>,
    pub clksrc: Reg<u32>,
    pub clkena: Reg<u32>,
    pub tmout: Reg<u32>,
    pub ctype: Reg<u32>,
    pub blksiz: Reg<u32>,
    pub bytcnt: Reg<u32>,
    pub intmask: Reg<u32>,
    pub cmdarg: Reg<u32>,
    pub cmd: Reg<u32>,
    pub resp: [Reg<u32>; 4],
    pub mintsts: Reg<u32>,
    pub rintsts: Reg<u32>,
    pub status: Reg<u32>,
    pub fifoth: Reg<u32>,
    pub cdetect: Reg<u32>,
    pub wrtprt: Reg<u32>,
    _pad0: Reg<u32>,
    pub tcbcnt: Reg<u32>,
    pub tbbcnt: Reg<u32>,
    pub debnce: Reg<u32>,
    pub usrid: Reg<u32>,
    pub verid: Reg<u32>,
    pub hcon: Reg<u32>,
    pub uhs_reg: Reg<u32>,
    pub rst_n: Reg<u32>,
    _pad1: Reg<u32>,
    pub bmod: Reg<u32>,
    pub poll_demand: Reg<u32>,
    pub desc_list_base: Reg<u32>,
    pub idmac_status: Reg<u32>,
    pub idmac_int_enable: Reg<u32>,
    pub cur_desc_addr: Reg<u32>,
    pub cur_buf_addr: Reg<u32>,
    _pad2: [Reg<u32>; 25],
    pub card_threshold: Reg<u32>,
    pub back_end_power: Reg<u32>,
    pub emmc_ddr: Reg<u32>,
    _pad3: [Reg<u32>; 61],
    pub fifo: Reg<u32>,
}

const _: () = {
    use core::mem::offset_of;
    assert!(offset_of!(DwmmcRegs, cmdarg) == 0x28);
    assert!(offset_of!(DwmmcRegs, cmd) == 0x2c);
    assert!(offset_of!(DwmmcRegs, rintsts) == 0x44);
    assert!(offset_of!(DwmmcRegs, status) == 0x48);
    assert!(offset_of!(DwmmcRegs, hcon) == 0x70);
    assert!(offset_of!(DwmmcRegs, bmod) == 0x80);
    assert!(offset_of!(DwmmcRegs, card_threshold) == 0x100);
    assert!(offset_of!(DwmmcRegs, fifo) == 0x200);
};

#[cfg(test)]
impl DwmmcRegs {
    /// All-zero register file for mock devices. Zero is the reset value of
    /// every field the driver inspects.
    pub fn mock() -> Self {
        // SAFETY: every field is a Reg<u32>, and Reg is transparent over
        // UnsafeCell<u32>, for which all-zeroes is valid.
        unsafe { core::mem::zeroed() }
    }
}

// ==== ctrl ====
pub const CTRL_USE_IDMAC: u32 = 1 << 25;
pub const CTRL_INT_ENABLE: u32 = 1 << 4;
pub const CTRL_DMA_RESET: u32 = 1 << 2;
pub const CTRL_FIFO_RESET: u32 = 1 << 1;
pub const CTRL_CONTROLLER_RESET: u32 = 1 << 0;

// ==== cmd ====
pub const CMD_START: u32 = 1 << 31;
pub const CMD_USE_HOLD_REG: u32 = 1 << 29;
pub const CMD_UPDATE_CLOCKS: u32 = 1 << 21;
pub const CMD_SEND_INITIALIZATION: u32 = 1 << 15;
pub const CMD_SYNC_DATA: u32 = 1 << 13;
pub const CMD_AUTO_STOP: u32 = 1 << 12;
pub const CMD_WRITE: u32 = 1 << 10;
pub const CMD_DATA_EXPECTED: u32 = 1 << 9;
pub const CMD_CHECK_RESPONSE_CRC: u32 = 1 << 8;
pub const CMD_RESPONSE_LENGTH: u32 = 1 << 7;
pub const CMD_RESPONSE_EXPECT: u32 = 1 << 6;

// Response templates by command class.
pub const R1: u32 = CMD_SYNC_DATA | CMD_CHECK_RESPONSE_CRC | CMD_RESPONSE_EXPECT;
pub const R2: u32 = CMD_SYNC_DATA | CMD_CHECK_RESPONSE_CRC | CMD_RESPONSE_EXPECT | CMD_RESPONSE_LENGTH;
/// No CRC checking on R3.
pub const R3: u32 = CMD_SYNC_DATA | CMD_RESPONSE_EXPECT;
pub const R6: u32 = CMD_SYNC_DATA | CMD_CHECK_RESPONSE_CRC | CMD_RESPONSE_EXPECT;

// ==== rintsts / intmask ====
pub const INT_DATA_NO_BUSY: u32 = 0x10000;
pub const INT_RESP_TIMEOUT: u32 = 0x100;
pub const INT_RX_FIFO_DATA_REQ: u32 = 0x20;
pub const INT_TX_FIFO_DATA_REQ: u32 = 0x10;
/// Asserted whenever the data state machine leaves busy (success, read
/// timeout, abort).
pub const INT_DATA_TRANSFER_OVER: u32 = 8;
/// Asserted whenever the command FSM returns to idle.
pub const INT_CMD_DONE: u32 = 4;
pub const INT_RESP_ERR: u32 = 2;
pub const ERROR_INT_MASK: u32 = 0xb8c2;
pub const INTMASK_ALL: u32 = 0x0101_ffff;

// ==== status ====
pub const STATUS_DATA_SM_BUSY: u32 = 1 << 10;
pub const STATUS_DATA_BUSY: u32 = 1 << 9;

/// FIFO fill level in 32-bit words, from the status register.
pub fn status_fifo_level(status: u32) -> u32 {
    status >> 17 & 0x1fff
}

// ==== bmod ====
pub const BMOD_IDMAC_ENABLE: u32 = 1 << 7;
pub const BMOD_SOFT_RESET: u32 = 1 << 0;

// ==== idmac_status / idmac_int_enable ====
pub const IDMAC_INT_ABNORMAL: u32 = 1 << 9;
pub const IDMAC_INT_NORMAL: u32 = 1 << 8;
pub const IDMAC_INT_DESC_UNAVAILABLE: u32 = 1 << 4;
pub const IDMAC_INT_FATAL_BUS_ERROR: u32 = 1 << 2;
pub const IDMAC_INT_RECEIVE: u32 = 1 << 1;
pub const IDMAC_INTMASK_ABNORMAL: u32 = 0x214;
pub const IDMAC_INTMASK_ALL: u32 = 0x337;

/// FIFO watermark configuration used for every transfer.
pub const FIFOTH_DEFAULT: u32 = 0x307f_0080;
