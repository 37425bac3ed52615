//! Pre-erase driver

use std::sync::{Mutex, MutexGuard, PoisonError};

use nvstack_core::{DriverChain, Error, MemDriver, Partition, Result};

/// Erase-ahead layer
///
/// The partition must start on an erase block boundary and span a whole
/// number of erase blocks.
#[derive(Debug, Default)]
pub struct PreEraseDriver {
    lock: Mutex<()>,
}

impl PreEraseDriver {
    /// Create a pre-erase driver
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sector a write of `len` bytes at `offset` has to erase first, if any
///
/// A write starting on a sector boundary erases that sector; one that runs
/// past the end of its sector erases the sector after it.
pub(crate) fn sector_to_erase(offset: u32, len: usize, sector: u32) -> Option<u32> {
    let in_sector = offset % sector;
    if in_sector == 0 {
        Some(offset)
    } else if in_sector as u64 + len as u64 > sector as u64 {
        Some(offset + (sector - in_sector))
    } else {
        None
    }
}

impl MemDriver for PreEraseDriver {
    fn name(&self) -> &'static str {
        "preerase"
    }

    fn init(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        let sector = part.attrs.erase_block_size;
        if sector == 0 || part.size % sector != 0 {
            log::error!(
                "Partition '{}': size {} is not a multiple of the {}-byte erase block",
                part.name,
                part.size,
                sector
            );
            return Err(Error::InvalidParameter);
        }
        next.init(part)
    }

    fn open(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        next.open(part)?;
        if part.phys_start % part.attrs.erase_block_size != 0 {
            log::error!(
                "Partition '{}' starts at 0x{:08X}, not on an erase block",
                part.name,
                part.phys_start
            );
            return Err(Error::InvalidAlignment);
        }
        Ok(())
    }

    fn read(&self, part: &Partition, dst: &mut [u8], offset: u32, next: DriverChain<'_>) -> Result<()> {
        let _guard = self.lock();
        next.read(part, dst, offset)
    }

    fn write(&self, part: &Partition, src: &[u8], offset: u32, next: DriverChain<'_>) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let _guard = self.lock();
        let sector = part.attrs.erase_block_size;
        if let Some(start) = sector_to_erase(offset, src.len(), sector) {
            log::debug!("Partition '{}': pre-erasing sector at 0x{:X}", part.name, start);
            next.erase(part, start, sector)?;
        }
        next.write(part, src, offset)
    }

    fn erase(&self, part: &Partition, offset: u32, len: u32, next: DriverChain<'_>) -> Result<()> {
        next.erase(part, offset, len)?;
        next.flush(part)
    }

    fn time_slice(&self, _part: &Partition, _next: DriverChain<'_>) -> bool {
        false
    }
}
