//! Dual-bank swap and program-once commands
//!
//! The swap system moves through `Uninitialized -> Ready -> Update ->
//! UpdateErased -> Complete`; after a reset in `Complete` the banks exchange
//! and the system is `Ready` again. Each step is one swap-control command
//! against the swap indicator address, and the controller reports the
//! resulting state in FCCOB5..7.

use nvstack_core::{SwapBlock, SwapCommand, SwapMode, SwapStatus};

use crate::command::FlashCommand;
use crate::controller::FlashController;
use crate::error::{IntFlashError, Result};
use crate::exec::{CommandEngine, ExecMode};
use crate::regs::{phrase_fccob, FCCOB_SWAP_CURRENT, FCCOB_SWAP_MODE, FCCOB_SWAP_NEXT, ONCE_RECORD_SIZE};

impl<C: FlashController> CommandEngine<C> {
    /// Issue one swap-control command and decode the reported status
    ///
    /// Swap commands always use the same-bank strategy since they change
    /// which bank is mapped for execution.
    pub fn swap_control(&mut self, indicator: u32, code: SwapCommand) -> Result<SwapStatus> {
        let cmd = FlashCommand::swap_control(indicator, code.code());
        self.execute_with(&cmd, ExecMode::SameBank)?;

        let ctrl = self.controller();
        let raw_mode = ctrl.read_fccob(FCCOB_SWAP_MODE);
        let mode = SwapMode::from_raw(raw_mode).ok_or(IntFlashError::UnknownSwapMode(raw_mode))?;
        Ok(SwapStatus {
            mode,
            current_block: SwapBlock::from_raw(ctrl.read_fccob(FCCOB_SWAP_CURRENT)),
            next_block: SwapBlock::from_raw(ctrl.read_fccob(FCCOB_SWAP_NEXT)),
        })
    }

    /// Read one 8-byte record of the program-once field
    pub fn read_once(&mut self, index: u8) -> Result<[u8; ONCE_RECORD_SIZE]> {
        let cmd = FlashCommand::read_once(index);
        self.execute_with(&cmd, ExecMode::SameBank)?;

        let mut record = [0u8; ONCE_RECORD_SIZE];
        for (i, byte) in record.iter_mut().enumerate() {
            *byte = self.controller().read_fccob(phrase_fccob(i));
        }
        Ok(record)
    }
}

/// Outcome of checking a swap command against the reported state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDecision {
    /// Status only; nothing else to issue
    StatusOnly,
    /// Precondition met; issue the command
    Issue,
    /// Precondition not met
    Reject {
        /// State the command requires
        expected: SwapMode,
    },
}

/// Decide whether `cmd` may be issued while the controller reports `current`
pub fn check_swap(cmd: SwapCommand, current: SwapMode) -> SwapDecision {
    match cmd.required_mode() {
        None => SwapDecision::StatusOnly,
        Some(expected) if expected == current => SwapDecision::Issue,
        Some(expected) => SwapDecision::Reject { expected },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_swap() {
        assert_eq!(
            check_swap(SwapCommand::GetStatus, SwapMode::Complete),
            SwapDecision::StatusOnly
        );
        assert_eq!(
            check_swap(SwapCommand::Init, SwapMode::Uninitialized),
            SwapDecision::Issue
        );
        assert_eq!(
            check_swap(SwapCommand::Update, SwapMode::Ready),
            SwapDecision::Issue
        );
        assert_eq!(
            check_swap(SwapCommand::Update, SwapMode::Update),
            SwapDecision::Reject {
                expected: SwapMode::Ready
            }
        );
        assert_eq!(
            check_swap(SwapCommand::Complete, SwapMode::Update),
            SwapDecision::Reject {
                expected: SwapMode::UpdateErased
            }
        );
    }
}
