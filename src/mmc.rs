//! Card-protocol vocabulary shared by both controller drivers.
//!
//! Constants follow the eMMC (JESD84) and SD physical-layer register
//! layouts; the drivers own the command sequencing, this module only knows
//! what the bytes mean.

// ==== EXT_CSD byte indices ====
pub const EXTCSD_DATA_SECTOR_SIZE: usize = 61;
pub const EXTCSD_BUS_WIDTH: usize = 183;
pub const EXTCSD_HS_TIMING: usize = 185;
pub const EXTCSD_REV: usize = 192;
pub const EXTCSD_STRUCTURE: usize = 194;
pub const EXTCSD_CARD_TYPE: usize = 196;
pub const EXTCSD_SEC_CNT: usize = 212;
pub const EXTCSD_GENERIC_CMD6_TIME: usize = 248;

// ==== EXT_CSD BUS_WIDTH values ====
pub const MMC_BUS_WIDTH_1: u8 = 0;
pub const MMC_BUS_WIDTH_4: u8 = 1;
pub const MMC_BUS_WIDTH_8: u8 = 2;

// ==== EXT_CSD HS_TIMING values ====
pub const MMC_TIMING_BC: u8 = 0;
pub const MMC_TIMING_HS: u8 = 1;

// ==== EXT_CSD CARD_TYPE bits ====
pub const MMC_CARD_TYPE_HS52: u8 = 2;
pub const MMC_CARD_TYPE_HS26: u8 = 1;

// ==== card status (R1) bits the drivers inspect ====
pub const MMC_R1_APP_CMD: u32 = 1 << 5;
pub const MMC_R1_SWITCH_ERR: u32 = 1 << 7;
pub const MMC_R1_READY_FOR_DATA: u32 = 1 << 8;
pub const MMC_R1_ERR: u32 = 1 << 19;
pub const MMC_R1_ILLEGAL_CMD: u32 = 1 << 22;

/// Current-state field of an R1 response, bits 9..13.
pub fn r1_state(resp: u32) -> u32 {
    resp >> 9 & 0xf
}

pub const MMC_STATE_IDLE: u32 = 0;
pub const MMC_STATE_READY: u32 = 1;
pub const MMC_STATE_IDENT: u32 = 2;
pub const MMC_STATE_STBY: u32 = 3;
pub const MMC_STATE_TRAN: u32 = 4;

// ==== SD OCR bits ====
pub const SD_OCR_HIGH_CAPACITY: u32 = 1 << 30;
pub const SD_OCR_XPC: u32 = 1 << 28;
pub const SD_OCR_S18R: u32 = 1 << 24;
/// OCR busy bit: set once card power-up is complete.
pub const SD_RESP_BUSY: u32 = 1 << 31;

/// CMD6 (SWITCH) argument writing one EXT_CSD byte.
pub const fn switch_set_byte(idx: usize, val: u8) -> u32 {
    0x0300_0000 | (val as u32) << 8 | (idx as u32) << 16
}

/// Repack a 136-bit response from the controller's four response words.
///
/// SDHC hosts strip the CRC byte, leaving bits 127:8 of the card register
/// right-aligned across the response registers; shifting each word up by
/// eight restores the standard register alignment. `dest[0]` receives the
/// most significant word.
pub fn write_cxd(dest: &mut [u32; 4], resp: [u32; 4]) {
    dest[0] = resp[3] << 8 | resp[2] >> 24;
    dest[1] = resp[2] << 8 | resp[1] >> 24;
    dest[2] = resp[1] << 8 | resp[0] >> 24;
    dest[3] = resp[0] << 8;
}

/// Identity and capability state collected during card bring-up.
///
/// `cxd` holds the CSD in the first four words (most significant first)
/// and the CID in the last four; `ext_csd` is the 512-byte extended CSD
/// read with CMD8 (eMMC) and stays zeroed for SD cards.
pub struct CardInfo {
    pub rocr: u32,
    pub cxd: [u32; 8],
    pub ext_csd: [u8; 512],
}

impl CardInfo {
    pub const fn new() -> Self {
        CardInfo {
            rocr: 0,
            cxd: [0; 8],
            ext_csd: [0; 512],
        }
    }

    /// True if the card speaks a layout this firmware can interpret
    /// (eMMC CSD with EXT_CSD structure revision 2).
    pub fn understood(&self) -> bool {
        self.cxd[3] >> 30 == 2 && self.ext_csd[EXTCSD_STRUCTURE] == 2
    }

    /// Device capacity in 512-byte sectors, from EXT_CSD SEC_COUNT.
    pub fn sector_count(&self) -> u32 {
        u32::from_le_bytes([
            self.ext_csd[EXTCSD_SEC_CNT],
            self.ext_csd[EXTCSD_SEC_CNT + 1],
            self.ext_csd[EXTCSD_SEC_CNT + 2],
            self.ext_csd[EXTCSD_SEC_CNT + 3],
        ])
    }

    /// High-speed (52 MHz) capability bit from EXT_CSD CARD_TYPE.
    pub fn supports_hs52(&self) -> bool {
        self.ext_csd[EXTCSD_CARD_TYPE] & MMC_CARD_TYPE_HS52 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_cxd_restores_alignment() {
        let mut dest = [0u32; 4];
        write_cxd(&mut dest, [0x11223344, 0x55667788, 0x99aabbcc, 0x00ddeeff]);
        assert_eq!(dest, [0xddeeff99, 0xaabbcc55, 0x66778811, 0x22334400]);
        // Low byte (the stripped CRC slot) always comes back zero.
        assert_eq!(dest[3] & 0xff, 0);
    }

    #[test]
    fn test_switch_set_byte() {
        assert_eq!(
            switch_set_byte(EXTCSD_BUS_WIDTH, MMC_BUS_WIDTH_8),
            0x03b7_0200
        );
        assert_eq!(switch_set_byte(EXTCSD_HS_TIMING, MMC_TIMING_HS), 0x03b9_0100);
    }

    #[test]
    fn test_sector_count_little_endian() {
        let mut card = CardInfo::new();
        card.ext_csd[EXTCSD_SEC_CNT] = 0x00;
        card.ext_csd[EXTCSD_SEC_CNT + 1] = 0x00;
        card.ext_csd[EXTCSD_SEC_CNT + 2] = 0x74;
        card.ext_csd[EXTCSD_SEC_CNT + 3] = 0x00;
        assert_eq!(card.sector_count(), 0x0074_0000);
    }

    #[test]
    fn test_understood_requires_csd_v3_and_extcsd_rev2() {
        let mut card = CardInfo::new();
        assert!(!card.understood());
        card.cxd[3] = 2 << 30;
        assert!(!card.understood());
        card.ext_csd[EXTCSD_STRUCTURE] = 2;
        assert!(card.understood());
        card.cxd[3] = 1 << 30;
        assert!(!card.understood());
    }

    #[test]
    fn test_r1_state_field() {
        assert_eq!(r1_state(MMC_STATE_TRAN << 9 | MMC_R1_READY_FOR_DATA), MMC_STATE_TRAN);
    }
}
