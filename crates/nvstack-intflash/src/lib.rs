//! nvstack-intflash - Raw internal flash driver
//!
//! Drives an FTFE-style flash memory module: 4 KiB erase sectors, 8-byte
//! program phrases, command objects loaded into FCCOB registers and launched
//! by clearing CCIF.
//!
//! Commands targeting the bank the CPU executes from run with interrupts
//! masked and a polled completion. Commands on the other bank run with
//! interrupts enabled and wait on a completion signal with a bounded timeout.
//!
//! The module also exposes the dual-bank swap state machine and the
//! program-once field through `ioctl`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod command;
pub mod controller;
mod driver;
pub mod error;
pub mod exec;
pub mod regs;
pub mod sector;
pub mod swap;

pub use command::FlashCommand;
pub use controller::{Completion, FlashController, IrqHandle};
pub use driver::{IntFlashConfig, IntFlashDriver};
pub use error::IntFlashError;
pub use exec::{CommandEngine, CommandState, ExecMode, DEFAULT_COMPLETION_TIMEOUT};
pub use regs::FStat;
