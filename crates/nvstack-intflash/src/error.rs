//! Error types for the internal flash driver

use nvstack_core::{EraseFailure, Error as CoreError};

use crate::regs::CMD_ERASE_SECTOR;

/// Failures of a single flash command
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IntFlashError {
    /// The controller reported an access error, protection violation or
    /// margin-read failure
    #[error("flash command 0x{opcode:02X} at 0x{addr:08X} failed (FSTAT=0x{status:02X})")]
    Fault {
        /// Command opcode
        opcode: u8,
        /// Target address
        addr: u32,
        /// Status bits read after completion
        status: u8,
    },
    /// The completion interrupt did not arrive in time
    #[error("flash command 0x{opcode:02X} at 0x{addr:08X} not completed within {timeout_ms} ms")]
    Timeout {
        /// Command opcode
        opcode: u8,
        /// Target address
        addr: u32,
        /// Wait that elapsed
        timeout_ms: u64,
    },
    /// The swap command returned a reserved mode byte
    #[error("swap control returned unknown mode 0x{0:02X}")]
    UnknownSwapMode(u8),
}

impl From<IntFlashError> for CoreError {
    fn from(e: IntFlashError) -> Self {
        match e {
            IntFlashError::Fault { opcode, addr, .. } if opcode == CMD_ERASE_SECTOR => {
                CoreError::EraseError(EraseFailure::CommandFailed { addr })
            }
            IntFlashError::Fault { addr, status, .. } => CoreError::FlashFault { addr, status },
            IntFlashError::Timeout { .. } => CoreError::Timeout,
            IntFlashError::UnknownSwapMode(_) => CoreError::ReadError,
        }
    }
}

/// Result type for flash command execution
pub type Result<T> = core::result::Result<T, IntFlashError>;
