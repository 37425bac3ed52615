//! Simulated flash memory module
//!
//! Models the parts of an FTFE module the driver relies on: FCCOB command
//! registers, FSTAT, the completion interrupt, the global interrupt mask,
//! erase-before-program memory (programming can only clear bits), the
//! program-once field and the dual-bank swap state machine.
//!
//! Commands complete instantly when launched. Every launched command is
//! recorded together with the interrupt mask state at launch, so tests can
//! check which commands ran and how.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nvstack_core::SwapMode;
use nvstack_intflash::regs::{
    phrase_fccob, CMD_ERASE_SECTOR, CMD_PROGRAM_PHRASE, CMD_READ_ONCE, CMD_SWAP_CONTROL,
    FCCOB_ADDR_HI, FCCOB_ADDR_LO, FCCOB_ADDR_MID, FCCOB_CMD, FCCOB_COUNT, FCCOB_SWAP_CODE,
    FCCOB_SWAP_CURRENT, FCCOB_SWAP_MODE, FCCOB_SWAP_NEXT, ONCE_RECORD_COUNT, ONCE_RECORD_SIZE,
    PHRASE_SIZE,
};
use nvstack_intflash::{FStat, FlashController, IrqHandle};

/// Configuration for the simulated flash
#[derive(Debug, Clone)]
pub struct SimFlashConfig {
    /// Flash size in bytes
    pub size: usize,
    /// Sector size for erase
    pub sector_size: usize,
}

impl Default for SimFlashConfig {
    fn default() -> Self {
        Self {
            size: 1024 * 1024,
            sector_size: 4096,
        }
    }
}

impl SimFlashConfig {
    /// Size of one swappable block pair
    pub fn bank_size(&self) -> usize {
        self.size / 2
    }
}

/// One launched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Opcode from FCCOB0
    pub opcode: u8,
    /// Address from FCCOB1..3
    pub address: u32,
    /// Whether interrupts were globally enabled at launch
    pub irqs_enabled: bool,
}

impl CommandRecord {
    /// Whether this was a sector erase
    pub fn is_erase(&self) -> bool {
        self.opcode == CMD_ERASE_SECTOR
    }

    /// Whether this was a phrase program
    pub fn is_program(&self) -> bool {
        self.opcode == CMD_PROGRAM_PHRASE
    }
}

#[derive(Debug)]
struct SwapModel {
    mode: SwapMode,
    upper_active: bool,
    indicator: Option<u32>,
}

struct SimState {
    config: SimFlashConfig,
    data: Vec<u8>,
    fccob: [u8; FCCOB_COUNT],
    fstat: FStat,
    ccie: bool,
    primask: u32,
    handler: Option<IrqHandle>,
    irq_suppressed: bool,
    injected: Option<FStat>,
    once: [u8; ONCE_RECORD_SIZE * ONCE_RECORD_COUNT as usize],
    swap: SwapModel,
    log: Vec<CommandRecord>,
}

/// Simulated flash controller
///
/// Cloning yields another handle to the same simulated device, so a test can
/// keep one handle while the driver owns the other.
#[derive(Clone)]
pub struct SimFlash {
    state: Arc<Mutex<SimState>>,
}

impl SimFlash {
    /// Create an erased flash with the given configuration
    pub fn new(config: SimFlashConfig) -> Self {
        let data = vec![0xFF; config.size];
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                data,
                fccob: [0; FCCOB_COUNT],
                fstat: FStat::CCIF,
                ccie: false,
                primask: 0,
                handler: None,
                irq_suppressed: false,
                injected: None,
                once: [0xFF; ONCE_RECORD_SIZE * ONCE_RECORD_COUNT as usize],
                swap: SwapModel {
                    mode: SwapMode::Uninitialized,
                    upper_active: false,
                    indicator: None,
                },
                log: Vec::new(),
            })),
        }
    }

    /// Create a 1 MiB erased flash
    pub fn new_default() -> Self {
        Self::new(SimFlashConfig::default())
    }

    /// Create a flash with pre-filled contents
    pub fn with_data(config: SimFlashConfig, initial_data: &[u8]) -> Self {
        let flash = Self::new(config);
        {
            let mut state = flash.lock();
            let len = initial_data.len().min(state.data.len());
            state.data[..len].copy_from_slice(&initial_data[..len]);
        }
        flash
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the whole flash array
    pub fn data(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Overwrite flash contents directly, bypassing the command interface
    pub fn poke(&self, addr: usize, bytes: &[u8]) {
        let mut state = self.lock();
        let end = (addr + bytes.len()).min(state.data.len());
        if addr < end {
            state.data[addr..end].copy_from_slice(&bytes[..end - addr]);
        }
    }

    /// Commands launched so far
    pub fn command_log(&self) -> Vec<CommandRecord> {
        self.lock().log.clone()
    }

    /// Forget recorded commands
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Number of sector erases launched so far
    pub fn erase_count(&self) -> usize {
        self.lock().log.iter().filter(|c| c.is_erase()).count()
    }

    /// Number of phrase programs launched so far
    pub fn program_count(&self) -> usize {
        self.lock().log.iter().filter(|c| c.is_program()).count()
    }

    /// Current PRIMASK (0 means interrupts enabled)
    pub fn irq_mask(&self) -> u32 {
        self.lock().primask
    }

    /// Force PRIMASK, e.g. to start a test with interrupts already masked
    pub fn set_irq_mask(&self, primask: u32) {
        self.lock().primask = primask;
    }

    /// Stop delivering the completion interrupt
    pub fn suppress_completion_irq(&self, suppressed: bool) {
        self.lock().irq_suppressed = suppressed;
    }

    /// Make the next command complete with the given fault bits
    pub fn inject_fault(&self, bits: FStat) {
        self.lock().injected = Some(bits & FStat::FAULTS);
    }

    /// Fill a program-once record
    pub fn set_once_record(&self, index: u8, record: [u8; ONCE_RECORD_SIZE]) {
        let start = index as usize * ONCE_RECORD_SIZE;
        let mut state = self.lock();
        if let Some(slot) = state.once.get_mut(start..start + ONCE_RECORD_SIZE) {
            slot.copy_from_slice(&record);
        }
    }

    /// Swap state machine position
    pub fn swap_mode(&self) -> SwapMode {
        self.lock().swap.mode
    }

    /// Whether the upper block pair is mapped for execution
    pub fn upper_bank_active(&self) -> bool {
        self.lock().swap.upper_active
    }

    /// Simulate a reset
    ///
    /// A completed swap takes effect here: the active block pair flips and
    /// the swap system returns to ready.
    pub fn reset(&self) {
        let mut state = self.lock();
        if state.swap.mode == SwapMode::Complete {
            state.swap.upper_active = !state.swap.upper_active;
            state.swap.mode = SwapMode::Ready;
            log::debug!("Simulated reset: swap taken, upper bank active = {}", state.swap.upper_active);
        }
        state.primask = 0;
        state.ccie = false;
        state.fstat = FStat::CCIF;
    }
}

impl SimState {
    fn address(&self) -> u32 {
        (self.fccob[FCCOB_ADDR_HI] as u32) << 16
            | (self.fccob[FCCOB_ADDR_MID] as u32) << 8
            | self.fccob[FCCOB_ADDR_LO] as u32
    }

    fn launch(&mut self) {
        let opcode = self.fccob[FCCOB_CMD];
        let address = self.address();
        self.log.push(CommandRecord {
            opcode,
            address,
            irqs_enabled: self.primask == 0,
        });

        let mut result = self.run(opcode, address);
        if let Some(bits) = self.injected.take() {
            result |= bits;
        }
        self.fstat = result | FStat::CCIF;
        self.maybe_interrupt();
    }

    fn maybe_interrupt(&mut self) {
        if self.ccie && self.fstat.contains(FStat::CCIF) && !self.irq_suppressed {
            // The handler masks CCIE before signalling
            self.ccie = false;
            if let Some(handler) = &self.handler {
                handler.on_command_complete();
            }
        }
    }

    fn run(&mut self, opcode: u8, address: u32) -> FStat {
        match opcode {
            CMD_ERASE_SECTOR => self.erase_sector(address as usize),
            CMD_PROGRAM_PHRASE => self.program_phrase(address as usize),
            CMD_READ_ONCE => self.read_once(self.fccob[FCCOB_ADDR_HI]),
            CMD_SWAP_CONTROL => self.swap_control(address),
            _ => FStat::ACCERR,
        }
    }

    fn erase_sector(&mut self, addr: usize) -> FStat {
        let sector = self.config.sector_size;
        if addr % sector != 0 || addr + sector > self.data.len() {
            return FStat::ACCERR;
        }
        self.data[addr..addr + sector].fill(0xFF);
        FStat::empty()
    }

    fn program_phrase(&mut self, addr: usize) -> FStat {
        if addr % PHRASE_SIZE != 0 || addr + PHRASE_SIZE > self.data.len() {
            return FStat::ACCERR;
        }
        for i in 0..PHRASE_SIZE {
            // Programming can only clear bits
            self.data[addr + i] &= self.fccob[phrase_fccob(i)];
        }
        FStat::empty()
    }

    fn read_once(&mut self, index: u8) -> FStat {
        if index >= ONCE_RECORD_COUNT {
            return FStat::ACCERR;
        }
        let start = index as usize * ONCE_RECORD_SIZE;
        for i in 0..ONCE_RECORD_SIZE {
            self.fccob[phrase_fccob(i)] = self.once[start + i];
        }
        FStat::empty()
    }

    fn swap_control(&mut self, address: u32) -> FStat {
        let code = self.fccob[FCCOB_SWAP_CODE];
        let swap = &mut self.swap;

        if let Some(indicator) = swap.indicator {
            if indicator != address {
                return FStat::ACCERR;
            }
        }

        match (code, swap.mode) {
            (0x01, SwapMode::Uninitialized) => {
                swap.indicator = Some(address);
                swap.mode = SwapMode::UpdateErased;
            }
            (0x02, SwapMode::Ready) => swap.mode = SwapMode::Update,
            (0x04, SwapMode::UpdateErased) => swap.mode = SwapMode::Complete,
            (0x08, SwapMode::Update) => {
                // Update-erased once the indicator copy in the inactive
                // block has been erased
                let bank = self.config.bank_size();
                let other = (address as usize + bank) % self.config.size;
                let sector = self.config.sector_size;
                let start = other - other % sector;
                if self.data[start..start + sector].iter().all(|&b| b == 0xFF) {
                    swap.mode = SwapMode::UpdateErased;
                }
            }
            (0x08, _) => {}
            _ => return FStat::ACCERR,
        }

        let next_upper = if swap.mode == SwapMode::Complete {
            !swap.upper_active
        } else {
            swap.upper_active
        };
        self.fccob[FCCOB_SWAP_MODE] = swap.mode as u8;
        self.fccob[FCCOB_SWAP_CURRENT] = swap.upper_active as u8;
        self.fccob[FCCOB_SWAP_NEXT] = next_upper as u8;
        FStat::empty()
    }
}

impl FlashController for SimFlash {
    fn read_mem(&self, addr: u32, buf: &mut [u8]) {
        let state = self.lock();
        let start = addr as usize;
        match state.data.get(start..start + buf.len()) {
            Some(src) => buf.copy_from_slice(src),
            None => buf.fill(0xFF),
        }
    }

    fn status(&self) -> FStat {
        self.lock().fstat
    }

    fn write_status(&mut self, bits: FStat) {
        let mut state = self.lock();
        // Write-1-to-clear for the error flags
        let clear = bits & FStat::CLEARABLE;
        state.fstat.remove(clear);
        if bits.contains(FStat::CCIF) && state.fstat.contains(FStat::CCIF) {
            state.fstat.remove(FStat::CCIF);
            state.launch();
        }
    }

    fn write_fccob(&mut self, index: usize, value: u8) {
        if let Some(reg) = self.lock().fccob.get_mut(index) {
            *reg = value;
        }
    }

    fn read_fccob(&self, index: usize) -> u8 {
        self.lock().fccob.get(index).copied().unwrap_or(0)
    }

    fn enable_completion_interrupt(&mut self) {
        let mut state = self.lock();
        state.ccie = true;
        // A pending completion raises the interrupt right away
        state.maybe_interrupt();
    }

    fn interrupts_enabled(&self) -> bool {
        self.lock().primask == 0
    }

    fn primask(&self) -> u32 {
        self.lock().primask
    }

    fn disable_interrupts(&mut self) {
        self.lock().primask = 1;
    }

    fn set_primask(&mut self, primask: u32) {
        self.lock().primask = primask;
    }

    fn set_completion_handler(&mut self, handler: IrqHandle) {
        self.lock().handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvstack_core::{
        DriverChain, EraseFailure, Error, IoctlCmd, IoctlResponse, MemDriver, Partition,
        SwapBlock, SwapCommand,
    };
    use nvstack_intflash::{CommandState, FlashCommand, IntFlashConfig, IntFlashDriver};
    use std::time::{Duration, Instant};

    const SECTOR: usize = 4096;

    /// Code bank is the lower half; tests use the upper half unless noted
    fn driver(sim: &SimFlash) -> IntFlashDriver<SimFlash> {
        IntFlashDriver::new(sim.clone(), IntFlashConfig::default())
    }

    fn other_bank_partition(drv: &Arc<IntFlashDriver<SimFlash>>) -> Partition {
        Partition::builder("upper", 0x80000, 0x4000)
            .driver(drv.clone())
            .build()
    }

    #[test]
    fn test_read_write() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);

        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        drv.write_at(0x90003, &data).unwrap();

        let mut buf = [0u8; 4];
        drv.read_at(0x90003, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(drv.command_state(), CommandState::Completed);
    }

    #[test]
    fn test_write_into_erased_sector_programs_only() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);

        let data: Vec<u8> = (0..SECTOR).map(|i| (i % 251) as u8).collect();
        drv.write_at(0x90000, &data).unwrap();

        assert_eq!(sim.erase_count(), 0);
        assert_eq!(sim.program_count(), SECTOR / 8);
        assert_eq!(&sim.data()[0x90000..0x90000 + SECTOR], data.as_slice());
    }

    #[test]
    fn test_unchanged_write_is_skipped() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);
        drv.write_at(0x90000, &[1, 2, 3]).unwrap();
        sim.clear_log();

        drv.write_at(0x90000, &[1, 2, 3]).unwrap();
        assert!(sim.command_log().is_empty());
    }

    #[test]
    fn test_erase_only_on_zero_to_one() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);
        drv.write_at(0x90000, &[0xF0; 16]).unwrap();
        sim.clear_log();

        // Clearing more bits needs no erase
        drv.write_at(0x90000, &[0x30; 16]).unwrap();
        assert_eq!(sim.erase_count(), 0);
        assert_eq!(sim.program_count(), 2);

        // Setting a bit again does
        sim.clear_log();
        drv.write_at(0x90004, &[0x31]).unwrap();
        let log = sim.command_log();
        assert!(log[0].is_erase());
        assert_eq!(log[0].address, 0x90000);
        assert!(log[1..].iter().all(CommandRecord::is_program));

        let mut buf = [0u8; 16];
        drv.read_at(0x90000, &mut buf).unwrap();
        let mut expected = [0x30; 16];
        expected[4] = 0x31;
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_erase_preserves_neighbours() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);
        let data: Vec<u8> = (0..2 * SECTOR).map(|i| i as u8 | 1).collect();
        drv.write_at(0x90000, &data).unwrap();

        // Partial head, one whole sector would be next, partial tail
        drv.erase_at(0x90010, (SECTOR + 32) as u32).unwrap();

        let flash = sim.data();
        assert_eq!(&flash[0x90000..0x90010], &data[..0x10]);
        assert!(flash[0x90010..0x90000 + SECTOR + 0x30].iter().all(|&b| b == 0xFF));
        assert_eq!(
            &flash[0x90000 + SECTOR + 0x30..0x90000 + 2 * SECTOR],
            &data[SECTOR + 0x30..]
        );
    }

    #[test]
    fn test_aligned_erase_fast_path() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);
        drv.write_at(0x90000, &[0u8; 2 * SECTOR]).unwrap();
        sim.clear_log();

        drv.erase_at(0x90000, (2 * SECTOR) as u32).unwrap();
        let log = sim.command_log();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(CommandRecord::is_erase));
        assert!(sim.data()[0x90000..0x90000 + 2 * SECTOR].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_same_bank_masks_interrupts() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);

        drv.write_at(0x1000, &[0x55; 8]).unwrap();
        let log = sim.command_log();
        assert!(!log.is_empty());
        assert!(log.iter().all(|c| !c.irqs_enabled));
        // Prior state (enabled) is restored
        assert_eq!(sim.irq_mask(), 0);
    }

    #[test]
    fn test_same_bank_keeps_masked_state() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);

        sim.set_irq_mask(1);
        drv.write_at(0x1000, &[0x55; 8]).unwrap();
        assert_eq!(sim.irq_mask(), 1);
    }

    #[test]
    fn test_other_bank_runs_with_interrupts() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);

        drv.write_at(0x90000, &[0x55; 8]).unwrap();
        let log = sim.command_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].irqs_enabled);
    }

    #[test]
    fn test_other_bank_timeout() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);
        sim.suppress_completion_irq(true);

        let start = Instant::now();
        let ret = drv.write_at(0x90000, &[0x55; 8]);
        let waited = start.elapsed();

        assert_eq!(ret, Err(Error::Timeout));
        assert!(waited >= Duration::from_millis(2000));
        assert!(waited < Duration::from_secs(10));
        assert_eq!(drv.command_state(), CommandState::Faulted);

        // The hardware still finished the command; the next one works
        sim.suppress_completion_irq(false);
        drv.write_at(0x90008, &[0x66; 8]).unwrap();
    }

    #[test]
    fn test_fault_bits_fail_the_command() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);

        sim.inject_fault(FStat::FPVIOL);
        assert_eq!(
            drv.write_at(0x90000, &[0; 8]),
            Err(Error::FlashFault {
                addr: 0x90000,
                status: (FStat::CCIF | FStat::FPVIOL).bits()
            })
        );
        assert_eq!(drv.command_state(), CommandState::Faulted);

        drv.write_at(0x90000, &[0x11; 8]).unwrap();
        sim.inject_fault(FStat::MGSTAT0);
        assert_eq!(
            drv.erase_at(0x90000, SECTOR as u32),
            Err(Error::EraseError(EraseFailure::CommandFailed { addr: 0x90000 }))
        );
    }

    #[test]
    fn test_out_of_bounds() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);
        let mut buf = [0u8; 2];
        assert_eq!(drv.read_at(0xFFFFF, &mut buf), Err(Error::AddressOutOfBounds));
        assert_eq!(drv.write_at(0xFFFFF, &buf), Err(Error::AddressOutOfBounds));
        assert_eq!(drv.erase_at(0xFF000, 0x2000), Err(Error::AddressOutOfBounds));
    }

    #[test]
    fn test_partition_offsets() {
        let sim = SimFlash::new_default();
        let drv = Arc::new(driver(&sim));
        let part = other_bank_partition(&drv);

        part.chain().write(&part, b"hello", 0x10).unwrap();
        assert_eq!(&sim.data()[0x80010..0x80015], b"hello");

        let mut buf = [0u8; 5];
        drv.read(&part, &mut buf, 0x10, DriverChain::empty()).unwrap();
        assert_eq!(&buf, b"hello");

        part.chain().erase(&part, 0x10, 5).unwrap();
        assert!(sim.data()[0x80010..0x80015].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_swap_sequence() {
        let sim = SimFlash::new_default();
        let drv = Arc::new(driver(&sim));
        let part = other_bank_partition(&drv);
        let swap = |cmd| part.chain().ioctl(&part, &IoctlCmd::FlashSwap(cmd));

        let status = match swap(SwapCommand::GetStatus).unwrap() {
            IoctlResponse::SwapStatus(s) => s,
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(status.mode, SwapMode::Uninitialized);
        assert_eq!(status.current_block, SwapBlock::Block0_1);

        // Update needs Ready
        assert_eq!(
            swap(SwapCommand::Update),
            Err(Error::InvalidSwapState {
                expected: SwapMode::Ready,
                found: SwapMode::Uninitialized
            })
        );

        swap(SwapCommand::Init).unwrap();
        assert_eq!(sim.swap_mode(), SwapMode::UpdateErased);

        match swap(SwapCommand::Complete).unwrap() {
            IoctlResponse::SwapStatus(s) => {
                assert_eq!(s.mode, SwapMode::Complete);
                assert_eq!(s.next_block, SwapBlock::Block2_3);
            }
            other => panic!("unexpected response {:?}", other),
        }

        sim.reset();
        assert!(sim.upper_bank_active());
        assert_eq!(sim.swap_mode(), SwapMode::Ready);

        // Second cycle: Ready -> Update -> (erase inactive indicator) -> UpdateErased
        swap(SwapCommand::Update).unwrap();
        assert_eq!(sim.swap_mode(), SwapMode::Update);
        assert_eq!(
            swap(SwapCommand::Complete),
            Err(Error::InvalidSwapState {
                expected: SwapMode::UpdateErased,
                found: SwapMode::Update
            })
        );

        let indicator = drv.config().swap_indicator as usize;
        let inactive = indicator + sim.data().len() / 2;
        sim.poke(inactive, &[0; 8]);
        drv.erase_at(inactive as u32, SECTOR as u32).unwrap();
        swap(SwapCommand::Complete).unwrap();
        assert_eq!(sim.swap_mode(), SwapMode::Complete);

        // All swap commands ran with interrupts masked
        assert!(sim
            .command_log()
            .iter()
            .filter(|c| c.opcode == CMD_SWAP_CONTROL)
            .all(|c| !c.irqs_enabled));
    }

    #[test]
    fn test_read_once() {
        let sim = SimFlash::new_default();
        let drv = driver(&sim);
        sim.set_once_record(2, *b"MAC:0123");

        assert_eq!(&drv.read_once(2).unwrap(), b"MAC:0123");
        assert_eq!(drv.read_once(0).unwrap(), [0xFF; 8]);
        assert_eq!(drv.read_once(8), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_command_register_layout() {
        let mut sim = SimFlash::new_default();
        sim.load_command(&FlashCommand::program_phrase(0x90000, &[0, 1, 2, 3, 4, 5, 6, 7]));
        sim.launch();
        assert_eq!(&sim.data()[0x90000..0x90008], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(sim.is_idle());
    }
}
