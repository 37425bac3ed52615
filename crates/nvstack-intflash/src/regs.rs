//! Flash memory module (FTFE) register definitions
//!
//! Command opcodes, status bits and the layout of the FCCOB command object
//! registers used by the program/erase sequences.

use bitflags::bitflags;

// ============================================================================
// Command opcodes (FCCOB0)
// ============================================================================

/// Program an 8-byte phrase
pub const CMD_PROGRAM_PHRASE: u8 = 0x07;
/// Erase a 4 KiB sector
pub const CMD_ERASE_SECTOR: u8 = 0x09;
/// Read an 8-byte record of the program-once field
pub const CMD_READ_ONCE: u8 = 0x41;
/// Dual-bank swap control
pub const CMD_SWAP_CONTROL: u8 = 0x46;

// ============================================================================
// FCCOB register indices
// ============================================================================

/// Number of FCCOB registers
pub const FCCOB_COUNT: usize = 12;
/// Command opcode
pub const FCCOB_CMD: usize = 0x0;
/// Address bits 23:16
pub const FCCOB_ADDR_HI: usize = 0x1;
/// Address bits 15:8
pub const FCCOB_ADDR_MID: usize = 0x2;
/// Address bits 7:0
pub const FCCOB_ADDR_LO: usize = 0x3;
/// Swap control code (swap command only)
pub const FCCOB_SWAP_CODE: usize = 0x4;
/// Swap mode result
pub const FCCOB_SWAP_MODE: usize = 0x5;
/// Swap current block result
pub const FCCOB_SWAP_CURRENT: usize = 0x6;
/// Swap next block result
pub const FCCOB_SWAP_NEXT: usize = 0x7;

/// FCCOB index holding byte `i` of an 8-byte phrase
///
/// The registers are big-endian within each 32-bit word: phrase bytes 0..3
/// land in FCCOB7..4 and bytes 4..7 in FCCOBB..8.
pub const fn phrase_fccob(i: usize) -> usize {
    if i < 4 {
        0x7 - i
    } else {
        0xB - (i - 4)
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Erase granule in bytes
pub const SECTOR_SIZE: usize = 4096;
/// Program granule in bytes
pub const PHRASE_SIZE: usize = 8;
/// Size of one program-once record
pub const ONCE_RECORD_SIZE: usize = 8;
/// Number of program-once records
pub const ONCE_RECORD_COUNT: u8 = 8;

bitflags! {
    /// Flash status register (FSTAT)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FStat: u8 {
        /// Command complete
        const CCIF = 0x80;
        /// Read collision error
        const RDCOLERR = 0x40;
        /// Access error
        const ACCERR = 0x20;
        /// Protection violation
        const FPVIOL = 0x10;
        /// Memory controller command completion status
        const MGSTAT0 = 0x01;
    }
}

impl FStat {
    /// Bits that turn a completed command into a failure
    pub const FAULTS: Self = Self::ACCERR.union(Self::FPVIOL).union(Self::MGSTAT0);
    /// Bits cleared before launching a command
    pub const CLEARABLE: Self = Self::ACCERR.union(Self::FPVIOL).union(Self::RDCOLERR);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phrase_mapping() {
        let order: Vec<usize> = (0..8).map(phrase_fccob).collect();
        assert_eq!(order, vec![7, 6, 5, 4, 0xB, 0xA, 9, 8]);
    }

    #[test]
    fn test_fault_masks() {
        assert_eq!(FStat::FAULTS.bits(), 0x31);
        assert_eq!(FStat::CLEARABLE.bits(), 0x70);
    }
}
