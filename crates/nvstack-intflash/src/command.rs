//! Flash command sequences
//!
//! A [`FlashCommand`] is the transient content of the FCCOB registers for one
//! program, erase, read-once or swap operation: opcode, 24-bit address and up
//! to eight data bytes.

use heapless::Vec;

use crate::regs::{
    phrase_fccob, CMD_ERASE_SECTOR, CMD_PROGRAM_PHRASE, CMD_READ_ONCE, CMD_SWAP_CONTROL,
    FCCOB_ADDR_HI, FCCOB_ADDR_LO, FCCOB_ADDR_MID, FCCOB_CMD, FCCOB_COUNT, FCCOB_SWAP_CODE,
    PHRASE_SIZE,
};

/// How the data bytes map onto FCCOB registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataLayout {
    /// Phrase byte order (big-endian words)
    Phrase,
    /// Consecutive registers from FCCOB4
    Sequential,
}

/// One command object ready to be loaded into the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashCommand {
    /// Command opcode
    pub opcode: u8,
    /// Target address (24 bits used)
    pub address: u32,
    data: Vec<u8, PHRASE_SIZE>,
    layout: DataLayout,
}

impl FlashCommand {
    fn new(opcode: u8, address: u32) -> Self {
        Self {
            opcode,
            address,
            data: Vec::new(),
            layout: DataLayout::Sequential,
        }
    }

    /// Erase the sector at `address`
    pub fn erase_sector(address: u32) -> Self {
        Self::new(CMD_ERASE_SECTOR, address)
    }

    /// Program one phrase at `address`
    pub fn program_phrase(address: u32, phrase: &[u8; PHRASE_SIZE]) -> Self {
        let mut cmd = Self::new(CMD_PROGRAM_PHRASE, address);
        cmd.data = Vec::from_slice(phrase).unwrap_or_default();
        cmd.layout = DataLayout::Phrase;
        cmd
    }

    /// Read program-once record `index`
    ///
    /// The record index travels in the first address byte.
    pub fn read_once(index: u8) -> Self {
        Self::new(CMD_READ_ONCE, (index as u32) << 16)
    }

    /// Swap control with `code` against the indicator at `address`
    ///
    /// The result registers FCCOB5..7 are preset to 0xFF.
    pub fn swap_control(address: u32, code: u8) -> Self {
        let mut cmd = Self::new(CMD_SWAP_CONTROL, address);
        cmd.data = Vec::from_slice(&[code, 0xFF, 0xFF, 0xFF]).unwrap_or_default();
        cmd
    }

    /// Data bytes in logical order
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Register writes needed to load this command, as `(index, value)`
    pub fn fccob_writes(&self) -> Vec<(usize, u8), FCCOB_COUNT> {
        let mut writes = Vec::new();
        let regs = [
            (FCCOB_CMD, self.opcode),
            (FCCOB_ADDR_HI, (self.address >> 16) as u8),
            (FCCOB_ADDR_MID, (self.address >> 8) as u8),
            (FCCOB_ADDR_LO, self.address as u8),
        ];
        let data = self.data.iter().enumerate().map(|(i, &b)| match self.layout {
            DataLayout::Phrase => (phrase_fccob(i), b),
            DataLayout::Sequential => (FCCOB_SWAP_CODE + i, b),
        });
        for write in regs.into_iter().chain(data) {
            // At most 4 + 8 entries, which is the capacity
            let _ = writes.push(write);
        }
        writes
    }
}
