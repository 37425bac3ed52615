//! Command execution
//!
//! Every command runs through `Idle -> Launched -> {Completed | Faulted}`.
//! Which of the two execution strategies is used depends on whether the
//! target lies in the bank the CPU is executing from:
//!
//! - same bank: interrupts are masked for the launch and the completion poll,
//!   since no handler may fetch code from the bank being modified, and the
//!   previous PRIMASK is restored exactly afterwards
//! - other bank: the command runs with interrupts enabled and the caller
//!   blocks on the completion semaphore with a bounded wait

use std::hint;
use std::sync::Arc;
use std::time::Duration;

use crate::command::FlashCommand;
use crate::controller::{Completion, FlashController, IrqHandle};
use crate::error::{IntFlashError, Result};
use crate::regs::FStat;

/// Default bound on the completion wait for other-bank commands
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Position of the most recent command in its life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    /// No command issued yet
    #[default]
    Idle,
    /// Command launched, completion not yet observed
    Launched,
    /// Command finished without fault
    Completed,
    /// Command faulted or its completion wait timed out
    Faulted,
}

/// How a command is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Interrupts masked, completion polled
    SameBank,
    /// Interrupts enabled, completion awaited
    OtherBank,
}

/// Owns the controller and runs commands on it
pub struct CommandEngine<C> {
    ctrl: C,
    completion: Arc<Completion>,
    timeout: Duration,
    code_bank_end: u32,
    state: CommandState,
}

impl<C: FlashController> CommandEngine<C> {
    /// Take ownership of a controller and hook up its completion interrupt
    ///
    /// Addresses below `code_bank_end` are treated as the executing bank.
    pub fn new(mut ctrl: C, code_bank_end: u32, timeout: Duration) -> Self {
        let completion = Arc::new(Completion::new());
        ctrl.set_completion_handler(IrqHandle::new(completion.clone()));
        Self {
            ctrl,
            completion,
            timeout,
            code_bank_end,
            state: CommandState::Idle,
        }
    }

    /// The controller
    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    /// The controller, mutably
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    /// State of the most recent command
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Strategy used for a command targeting `addr`
    pub fn mode_for(&self, addr: u32) -> ExecMode {
        if addr < self.code_bank_end {
            ExecMode::SameBank
        } else {
            ExecMode::OtherBank
        }
    }

    /// Run a command with the strategy its target address calls for
    pub fn execute(&mut self, cmd: &FlashCommand) -> Result<()> {
        let mode = self.mode_for(cmd.address);
        self.execute_with(cmd, mode)
    }

    /// Run a command with an explicit strategy
    pub fn execute_with(&mut self, cmd: &FlashCommand, mode: ExecMode) -> Result<()> {
        log::trace!(
            "Flash command 0x{:02X} at 0x{:06X} ({:?})",
            cmd.opcode,
            cmd.address,
            mode
        );
        match mode {
            ExecMode::SameBank => self.execute_same_bank(cmd),
            ExecMode::OtherBank => self.execute_other_bank(cmd),
        }
    }

    fn prepare(&mut self, cmd: &FlashCommand) {
        self.wait_idle();
        self.ctrl.clear_errors();
        self.ctrl.load_command(cmd);
    }

    fn execute_same_bank(&mut self, cmd: &FlashCommand) -> Result<()> {
        self.prepare(cmd);

        let saved = if self.ctrl.interrupts_enabled() {
            let primask = self.ctrl.primask();
            self.ctrl.disable_interrupts();
            Some(primask)
        } else {
            None
        };

        self.ctrl.launch();
        self.state = CommandState::Launched;
        self.wait_idle();

        if let Some(primask) = saved {
            self.ctrl.set_primask(primask);
        }

        self.finish(cmd)
    }

    fn execute_other_bank(&mut self, cmd: &FlashCommand) -> Result<()> {
        self.prepare(cmd);
        self.completion.reset();

        self.ctrl.launch();
        self.state = CommandState::Launched;
        self.ctrl.enable_completion_interrupt();

        if !self.completion.wait_timeout(self.timeout) {
            self.state = CommandState::Faulted;
            log::error!(
                "Flash command 0x{:02X} at 0x{:06X} timed out after {} ms",
                cmd.opcode,
                cmd.address,
                self.timeout.as_millis()
            );
            return Err(IntFlashError::Timeout {
                opcode: cmd.opcode,
                addr: cmd.address,
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }

        self.finish(cmd)
    }

    fn finish(&mut self, cmd: &FlashCommand) -> Result<()> {
        let status = self.ctrl.status();
        if status.intersects(FStat::FAULTS) {
            self.state = CommandState::Faulted;
            log::error!(
                "Flash command 0x{:02X} at 0x{:06X} faulted: {:?}",
                cmd.opcode,
                cmd.address,
                status & FStat::FAULTS
            );
            return Err(IntFlashError::Fault {
                opcode: cmd.opcode,
                addr: cmd.address,
                status: status.bits(),
            });
        }
        self.state = CommandState::Completed;
        Ok(())
    }

    /// Spin until no command is in flight
    ///
    /// A launched command always completes in hardware.
    fn wait_idle(&self) {
        while !self.ctrl.is_idle() {
            hint::spin_loop();
        }
    }
}
