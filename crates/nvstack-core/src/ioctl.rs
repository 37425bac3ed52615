//! Control commands carried through the `ioctl` operation
//!
//! Each driver handles the commands it understands and forwards the rest
//! down its chain. The bank-swap vocabulary lives here so that any layer can
//! name it without depending on the flash driver.

/// Dual-bank swap command codes as written to the flash controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwapCommand {
    /// Program the swap indicator and enter the update-erased state
    Init = 0x01,
    /// Move from ready to update
    Update = 0x02,
    /// Finish the swap; the banks exchange at the next reset
    Complete = 0x04,
    /// Report the current swap state without changing it
    GetStatus = 0x08,
}

impl SwapCommand {
    /// Raw command code
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// State the controller must report before this command may be issued
    ///
    /// `None` means the command is accepted in any state.
    pub const fn required_mode(self) -> Option<SwapMode> {
        match self {
            Self::Init => Some(SwapMode::Uninitialized),
            Self::Update => Some(SwapMode::Ready),
            Self::Complete => Some(SwapMode::UpdateErased),
            Self::GetStatus => None,
        }
    }
}

/// Swap state machine position reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwapMode {
    /// Swap system has never been initialised
    Uninitialized = 0,
    /// Initialised and idle
    Ready = 1,
    /// Update in progress, inactive indicator not yet erased
    Update = 2,
    /// Update in progress, inactive indicator erased
    UpdateErased = 3,
    /// Swap complete, waiting for reset
    Complete = 4,
}

impl SwapMode {
    /// Decode the mode byte, rejecting reserved values
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Ready),
            2 => Some(Self::Update),
            3 => Some(Self::UpdateErased),
            4 => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Which physical block pair is mapped at address zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwapBlock {
    /// Blocks 0/1 are the active (code) bank
    Block0_1 = 0,
    /// Blocks 2/3 are the active (code) bank
    Block2_3 = 1,
}

impl SwapBlock {
    /// Decode the block byte; any non-zero value selects the upper pair
    pub fn from_raw(raw: u8) -> Self {
        if raw == 0 {
            Self::Block0_1
        } else {
            Self::Block2_3
        }
    }
}

/// Status returned by every swap command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStatus {
    /// Current state machine position
    pub mode: SwapMode,
    /// Block pair active now
    pub current_block: SwapBlock,
    /// Block pair active after the next reset
    pub next_block: SwapBlock,
}

/// Command passed to [`crate::MemDriver::ioctl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Drive the dual-bank swap state machine
    FlashSwap(SwapCommand),
    /// Read an 8-byte program-once record by index
    ReadOnce(u8),
}

/// Result of a successful ioctl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlResponse {
    /// Swap state after the command ran
    SwapStatus(SwapStatus),
    /// Contents of a program-once record
    OnceRecord([u8; 8]),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_preconditions() {
        assert_eq!(SwapCommand::Init.required_mode(), Some(SwapMode::Uninitialized));
        assert_eq!(SwapCommand::Update.required_mode(), Some(SwapMode::Ready));
        assert_eq!(
            SwapCommand::Complete.required_mode(),
            Some(SwapMode::UpdateErased)
        );
        assert_eq!(SwapCommand::GetStatus.required_mode(), None);
    }

    #[test]
    fn test_swap_codes() {
        assert_eq!(SwapCommand::Init.code(), 1);
        assert_eq!(SwapCommand::Update.code(), 2);
        assert_eq!(SwapCommand::Complete.code(), 4);
        assert_eq!(SwapCommand::GetStatus.code(), 8);
    }

    #[test]
    fn test_mode_decode() {
        assert_eq!(SwapMode::from_raw(3), Some(SwapMode::UpdateErased));
        assert_eq!(SwapMode::from_raw(9), None);
        assert_eq!(SwapBlock::from_raw(0), SwapBlock::Block0_1);
        assert_eq!(SwapBlock::from_raw(1), SwapBlock::Block2_3);
    }
}
