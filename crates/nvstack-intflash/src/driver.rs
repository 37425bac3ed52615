//! Internal flash memory driver
//!
//! Terminal driver of a chain: reads are memory-mapped copies, writes and
//! erases are turned into sector erase and phrase program commands. All
//! access goes through one lock, which also guards the sector scratch buffer.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nvstack_core::{
    DriverChain, EraseFailure, Error, IoctlCmd, IoctlResponse, MemDriver, Partition, PowerMode,
    Result, SwapCommand, SwapStatus,
};

use crate::command::FlashCommand;
use crate::controller::FlashController;
use crate::exec::{CommandEngine, CommandState, DEFAULT_COMPLETION_TIMEOUT};
use crate::regs::{ONCE_RECORD_COUNT, ONCE_RECORD_SIZE, SECTOR_SIZE};
use crate::sector::{is_blank_phrase, is_erased, need_erase, phrases, sector_spans};
use crate::swap::{check_swap, SwapDecision};

/// Geometry and timing of the internal flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntFlashConfig {
    /// Size of the flash array in bytes
    pub flash_size: u32,
    /// First address past the bank the CPU executes from
    pub code_bank_end: u32,
    /// Address of the swap indicator
    pub swap_indicator: u32,
    /// Bound on the completion wait for other-bank commands
    pub completion_timeout: Duration,
}

impl Default for IntFlashConfig {
    fn default() -> Self {
        Self {
            flash_size: 1024 * 1024,
            code_bank_end: 512 * 1024,
            swap_indicator: 512 * 1024 - SECTOR_SIZE as u32,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }
}

struct Inner<C> {
    engine: CommandEngine<C>,
    sector: Vec<u8>,
}

/// Raw internal flash driver
pub struct IntFlashDriver<C> {
    inner: Mutex<Inner<C>>,
    config: IntFlashConfig,
}

impl<C: FlashController> IntFlashDriver<C> {
    /// Create a driver that owns `ctrl`
    pub fn new(ctrl: C, config: IntFlashConfig) -> Self {
        let engine = CommandEngine::new(ctrl, config.code_bank_end, config.completion_timeout);
        Self {
            inner: Mutex::new(Inner {
                engine,
                sector: vec![0xFF; SECTOR_SIZE],
            }),
            config,
        }
    }

    /// Driver configuration
    pub fn config(&self) -> &IntFlashConfig {
        &self.config
    }

    /// State of the most recently issued command
    pub fn command_state(&self) -> CommandState {
        self.lock().engine.state()
    }

    /// Run `f` with exclusive access to the controller
    pub fn with_controller<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(self.lock().engine.controller_mut())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<()> {
        if Partition::range_fits(addr, len, self.config.flash_size) {
            Ok(())
        } else {
            Err(Error::AddressOutOfBounds)
        }
    }

    /// Read flash at an absolute address
    pub fn read_at(&self, addr: u32, dst: &mut [u8]) -> Result<()> {
        self.check_range(addr, dst.len())?;
        self.lock().engine.controller().read_mem(addr, dst);
        Ok(())
    }

    /// Write flash at an absolute address
    ///
    /// Sectors whose contents already match are left alone. A sector is
    /// erased only when some bit has to go from 0 to 1; after that every
    /// phrase that is not all 0xFF is programmed.
    pub fn write_at(&self, addr: u32, src: &[u8]) -> Result<()> {
        self.check_range(addr, src.len())?;
        let mut inner = self.lock();

        let mut current = vec![0u8; src.len()];
        inner.engine.controller().read_mem(addr, &mut current);
        if current == src {
            log::trace!("Write at 0x{:06X} unchanged, skipping", addr);
            return Ok(());
        }

        for span in sector_spans(addr, src.len(), SECTOR_SIZE) {
            inner.write_sector(span.base, span.offset, &src[span.pos..span.pos + span.len])?;
        }
        Ok(())
    }

    /// Erase flash at an absolute address
    ///
    /// Whole aligned sectors are erased directly. Partially covered sectors
    /// are read back, erased and the bytes outside the range reprogrammed.
    pub fn erase_at(&self, addr: u32, len: u32) -> Result<()> {
        self.check_range(addr, len as usize)?;
        let mut inner = self.lock();

        for span in sector_spans(addr, len as usize, SECTOR_SIZE) {
            if span.is_full(SECTOR_SIZE) {
                inner
                    .engine
                    .execute(&FlashCommand::erase_sector(span.base))
                    .map_err(Error::from)?;
            } else {
                inner.erase_partial(span.base, span.offset, span.len)?;
            }
        }
        Ok(())
    }

    /// Drive the dual-bank swap state machine one step
    ///
    /// The current status is always read first. A command whose required
    /// state does not match is rejected without touching the controller
    /// again.
    pub fn flash_swap(&self, cmd: SwapCommand) -> Result<SwapStatus> {
        let indicator = self.config.swap_indicator;
        let mut inner = self.lock();

        let status = inner
            .engine
            .swap_control(indicator, SwapCommand::GetStatus)
            .map_err(Error::from)?;

        match check_swap(cmd, status.mode) {
            SwapDecision::StatusOnly => Ok(status),
            SwapDecision::Issue => {
                let next = inner
                    .engine
                    .swap_control(indicator, cmd)
                    .map_err(Error::from)?;
                log::info!("Flash swap {:?}: {:?} -> {:?}", cmd, status.mode, next.mode);
                Ok(next)
            }
            SwapDecision::Reject { expected } => {
                log::warn!(
                    "Flash swap {:?} rejected: requires {:?}, controller reports {:?}",
                    cmd,
                    expected,
                    status.mode
                );
                Err(Error::InvalidSwapState {
                    expected,
                    found: status.mode,
                })
            }
        }
    }

    /// Read a program-once record
    pub fn read_once(&self, index: u8) -> Result<[u8; ONCE_RECORD_SIZE]> {
        if index >= ONCE_RECORD_COUNT {
            return Err(Error::InvalidParameter);
        }
        self.lock().engine.read_once(index).map_err(Error::from)
    }
}

impl<C: FlashController> Inner<C> {
    fn write_sector(&mut self, base: u32, offset: usize, src: &[u8]) -> Result<()> {
        let Inner { engine, sector } = self;
        engine.controller().read_mem(base, sector.as_mut_slice());

        let target = &sector[offset..offset + src.len()];
        if target == src {
            return Ok(());
        }

        let erased = if is_erased(sector.as_slice()) {
            true
        } else if need_erase(target, src) {
            log::debug!("Erasing sector 0x{:06X} before programming", base);
            engine
                .execute(&FlashCommand::erase_sector(base))
                .map_err(Error::from)?;
            true
        } else {
            false
        };

        sector[offset..offset + src.len()].copy_from_slice(src);

        for (addr, phrase) in phrases(base, sector.as_slice()) {
            if is_blank_phrase(phrase) {
                continue;
            }
            if !erased {
                let mut on_flash = [0u8; 8];
                engine.controller().read_mem(addr, &mut on_flash);
                if on_flash == *phrase {
                    continue;
                }
            }
            engine
                .execute(&FlashCommand::program_phrase(addr, phrase))
                .map_err(Error::from)?;
        }
        Ok(())
    }

    fn erase_partial(&mut self, base: u32, offset: usize, len: usize) -> Result<()> {
        let Inner { engine, sector } = self;
        engine.controller().read_mem(base, sector.as_mut_slice());
        engine
            .execute(&FlashCommand::erase_sector(base))
            .map_err(Error::from)?;

        sector[offset..offset + len].fill(0xFF);
        for (addr, phrase) in phrases(base, sector.as_slice()) {
            if is_blank_phrase(phrase) {
                continue;
            }
            engine
                .execute(&FlashCommand::program_phrase(addr, phrase))
                .map_err(|e| {
                    log::error!("Reprogramming sector 0x{:06X} after erase failed: {}", base, e);
                    Error::EraseError(EraseFailure::MergeFailed { addr: base })
                })?;
        }
        Ok(())
    }
}

impl<C: FlashController> MemDriver for IntFlashDriver<C> {
    fn name(&self) -> &'static str {
        "intflash"
    }

    fn init(&self, part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        log::debug!(
            "Internal flash serving '{}' at 0x{:06X}..0x{:06X}",
            part.name,
            part.phys_start,
            part.phys_end()
        );
        self.check_range(part.phys_start, part.size as usize)
    }

    fn open(&self, _part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }

    fn close(&self, _part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }

    fn set_power_mode(&self, _part: &Partition, _mode: PowerMode, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }

    fn read(&self, part: &Partition, dst: &mut [u8], offset: u32, _next: DriverChain<'_>) -> Result<()> {
        self.read_at(part.phys_addr(offset), dst)
    }

    fn write(&self, part: &Partition, src: &[u8], offset: u32, _next: DriverChain<'_>) -> Result<()> {
        self.write_at(part.phys_addr(offset), src)
    }

    fn erase(&self, part: &Partition, offset: u32, len: u32, _next: DriverChain<'_>) -> Result<()> {
        self.erase_at(part.phys_addr(offset), len)
    }

    fn flush(&self, _part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }

    fn ioctl(&self, _part: &Partition, cmd: &IoctlCmd, _next: DriverChain<'_>) -> Result<IoctlResponse> {
        match *cmd {
            IoctlCmd::FlashSwap(swap) => self.flash_swap(swap).map(IoctlResponse::SwapStatus),
            IoctlCmd::ReadOnce(index) => self.read_once(index).map(IoctlResponse::OnceRecord),
        }
    }

    fn time_slice(&self, _part: &Partition, _next: DriverChain<'_>) -> bool {
        false
    }
}
