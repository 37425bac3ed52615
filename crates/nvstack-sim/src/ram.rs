//! RAM-backed terminal driver
//!
//! Serves a partition from a plain byte array. Used where a chain needs a
//! bottom layer other than internal flash, such as a RAM partition or a
//! stand-in for an external device, and by tests that need to observe how
//! often an upper layer reaches down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nvstack_core::{DriverChain, Error, MemDriver, Partition, Result};

/// Terminal driver over an in-memory array
///
/// Partition offsets are translated with the partition's physical start, so
/// several partitions can share one array.
pub struct RamDriver {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    erases: AtomicUsize,
}

impl RamDriver {
    /// Create an erased array of `size` bytes
    pub fn new(size: usize) -> Self {
        Self::with_data(vec![0xFF; size])
    }

    /// Create an array with the given contents
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            erases: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the array
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Number of reads served
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of writes served
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of erases served
    pub fn erases(&self) -> usize {
        self.erases.load(Ordering::Relaxed)
    }

    fn range(&self, part: &Partition, offset: u32, len: usize, size: usize) -> Result<std::ops::Range<usize>> {
        let start = part.phys_addr(offset) as usize;
        let end = start.checked_add(len).ok_or(Error::AddressOutOfBounds)?;
        if end > size {
            return Err(Error::AddressOutOfBounds);
        }
        Ok(start..end)
    }
}

impl MemDriver for RamDriver {
    fn name(&self) -> &'static str {
        "ram"
    }

    fn init(&self, part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        if part.phys_end() > self.lock().len() as u64 {
            log::error!("Partition '{}' does not fit in RAM backing", part.name);
            return Err(Error::AddressOutOfBounds);
        }
        Ok(())
    }

    fn open(&self, _part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }

    fn close(&self, _part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }

    fn read(&self, part: &Partition, dst: &mut [u8], offset: u32, _next: DriverChain<'_>) -> Result<()> {
        let data = self.lock();
        let range = self.range(part, offset, dst.len(), data.len())?;
        dst.copy_from_slice(&data[range]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, part: &Partition, src: &[u8], offset: u32, _next: DriverChain<'_>) -> Result<()> {
        let mut data = self.lock();
        let size = data.len();
        let range = self.range(part, offset, src.len(), size)?;
        data[range].copy_from_slice(src);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn erase(&self, part: &Partition, offset: u32, len: u32, _next: DriverChain<'_>) -> Result<()> {
        let mut data = self.lock();
        let size = data.len();
        let range = self.range(part, offset, len as usize, size)?;
        data[range].fill(0xFF);
        self.erases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self, _part: &Partition, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }

    fn restore(&self, _part: &Partition, _offset: u32, _len: u32, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_offsets_and_counters() {
        let ram = Arc::new(RamDriver::new(0x400));
        let part = Partition::builder("ram", 0x100, 0x100)
            .driver(ram.clone())
            .build();

        part.chain().init(&part).unwrap();
        part.chain().write(&part, &[1, 2, 3], 4).unwrap();
        assert_eq!(&ram.contents()[0x104..0x107], &[1, 2, 3]);

        let mut buf = [0u8; 3];
        part.chain().read(&part, &mut buf, 4).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        part.chain().erase(&part, 0, 0x10).unwrap();
        assert_eq!(&ram.contents()[0x104..0x107], &[0xFF; 3]);
        assert_eq!((ram.reads(), ram.writes(), ram.erases()), (1, 1, 1));
    }

    #[test]
    fn test_bounds() {
        let ram = Arc::new(RamDriver::new(0x100));
        let part = Partition::builder("big", 0x80, 0x100)
            .driver(ram.clone())
            .build();

        assert_eq!(part.chain().init(&part), Err(Error::AddressOutOfBounds));
        let mut buf = [0u8; 0x90];
        assert_eq!(
            part.chain().read(&part, &mut buf, 0),
            Err(Error::AddressOutOfBounds)
        );
        assert_eq!(ram.reads(), 0);
    }
}
