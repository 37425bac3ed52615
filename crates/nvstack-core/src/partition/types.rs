//! Partition descriptor, attributes and per-partition metadata

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

use crate::driver::{DriverChain, MemDriver};

/// Default erase granule for internal flash
pub const DEFAULT_ERASE_BLOCK_SIZE: u32 = 4096;

bitflags! {
    /// Capability flags of a partition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PartitionFlags: u8 {
        /// Partition rotates across several banks
        const BANKED = 1 << 0;
        /// Partition is mirrored in RAM by the cache layer
        const CACHED = 1 << 1;
        /// The next bank is erased automatically on a bank switch
        const AUTO_ERASE_BANK = 1 << 2;
        /// Partition may be modified while a firmware patch is applied
        const DFW_UPDATABLE = 1 << 3;
        /// Partition backs a file system
        const FILE_SYSTEM = 1 << 4;
        /// Partition spans the whole medium; erasing it clears cached partitions
        const WHOLE_DEVICE = 1 << 5;
    }
}

impl PartitionFlags {
    /// Human-readable names of the set flags
    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| flag_label(name)).collect()
    }
}

fn flag_label(name: &str) -> &'static str {
    match name {
        "BANKED" => "banked",
        "CACHED" => "cached",
        "AUTO_ERASE_BANK" => "auto-erase",
        "DFW_UPDATABLE" => "dfw",
        "FILE_SYSTEM" => "filesystem",
        "WHOLE_DEVICE" => "whole-device",
        _ => "unknown",
    }
}

/// Backing medium of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Medium {
    /// On-chip program flash
    #[default]
    Internal,
    /// External SPI flash device
    Spi {
        /// SPI bus number
        bus: u8,
        /// Chip select line on that bus
        chip_select: u8,
    },
    /// Volatile memory, used for scratch partitions and tests
    Ram,
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal flash"),
            Self::Spi { bus, chip_select } => write!(f, "spi{}.{}", bus, chip_select),
            Self::Ram => write!(f, "ram"),
        }
    }
}

/// Bank and cache bookkeeping that changes at runtime
#[derive(Debug, Default)]
pub struct PartitionMeta {
    bank_offset: AtomicU32,
    bank_sequence: AtomicU8,
    cache_restored: AtomicBool,
}

impl PartitionMeta {
    /// Byte offset of the active bank
    pub fn bank_offset(&self) -> u32 {
        self.bank_offset.load(Ordering::Acquire)
    }

    /// Set the byte offset of the active bank
    pub fn set_bank_offset(&self, offset: u32) {
        self.bank_offset.store(offset, Ordering::Release);
    }

    /// Sequence number of the active bank
    pub fn bank_sequence(&self) -> u8 {
        self.bank_sequence.load(Ordering::Acquire)
    }

    /// Set the sequence number of the active bank
    pub fn set_bank_sequence(&self, seq: u8) {
        self.bank_sequence.store(seq, Ordering::Release);
    }

    /// Whether the RAM mirror has been validated or reloaded since open
    pub fn cache_restored(&self) -> bool {
        self.cache_restored.load(Ordering::Acquire)
    }

    /// Mark the RAM mirror as trusted or untrusted
    pub fn set_cache_restored(&self, restored: bool) {
        self.cache_restored.store(restored, Ordering::Release);
    }
}

/// RAM mirror of a cached partition
///
/// The mutex around the buffer is the cache layer's per-partition lock. It is
/// created together with the partition, before any task can reach it.
#[derive(Debug)]
pub struct CacheRam {
    buf: Mutex<Vec<u8>>,
    len: usize,
}

impl CacheRam {
    /// Create a zero-filled mirror of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::with_contents(vec![0; len])
    }

    /// Create a mirror with the given initial contents
    pub fn with_contents(contents: Vec<u8>) -> Self {
        let len = contents.len();
        Self {
            buf: Mutex::new(contents),
            len,
        }
    }

    /// Size of the mirror in bytes (payload plus trailer)
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mirror has no bytes at all
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lock the mirror
    ///
    /// A panic in another holder does not invalidate the bytes, so a
    /// poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mutable attributes owned by a partition
#[derive(Debug)]
pub struct PartitionAttributes {
    /// Bank and cache bookkeeping
    pub meta: PartitionMeta,
    /// Erase granule of the backing medium
    pub erase_block_size: u32,
    /// RAM mirror, present iff the partition is cached
    pub cache: Option<CacheRam>,
    /// Slowest update interval the partition is rated for
    ///
    /// `None` excludes the partition from update-rate searches.
    pub max_update_rate_secs: Option<u32>,
    /// Number of banks; zero for unbanked partitions
    pub num_banks: u8,
}

impl Default for PartitionAttributes {
    fn default() -> Self {
        Self {
            meta: PartitionMeta::default(),
            erase_block_size: DEFAULT_ERASE_BLOCK_SIZE,
            cache: None,
            max_update_rate_secs: None,
            num_banks: 0,
        }
    }
}

/// A named region of non-volatile memory with its own driver chain
///
/// The descriptor fields never change once the partition is built; runtime
/// state lives in [`PartitionAttributes`].
pub struct Partition {
    /// Partition name
    pub name: String,
    /// Byte offset of the partition within its medium
    pub phys_start: u32,
    /// Bytes reserved on the medium
    pub size: u32,
    /// Bytes usable by callers (size minus per-layer metadata)
    pub data_size: u32,
    /// Drivers serving this partition, top first
    pub drivers: Vec<Arc<dyn MemDriver>>,
    /// Backing medium
    pub medium: Medium,
    /// Free-form description
    pub description: String,
    /// Capability flags
    pub flags: PartitionFlags,
    /// Runtime attributes
    pub attrs: PartitionAttributes,
}

impl Partition {
    /// Start building a partition of `size` bytes at `phys_start`
    pub fn builder(name: impl Into<String>, phys_start: u32, size: u32) -> PartitionBuilder {
        PartitionBuilder::new(name.into(), phys_start, size)
    }

    /// Cursor at the head of this partition's driver chain
    pub fn chain(&self) -> DriverChain<'_> {
        DriverChain::new(&self.drivers)
    }

    /// First byte past the partition on its medium
    pub fn phys_end(&self) -> u64 {
        self.phys_start as u64 + self.size as u64
    }

    /// Medium address of a partition offset
    pub fn phys_addr(&self, offset: u32) -> u32 {
        self.phys_start.wrapping_add(offset)
    }

    /// Whether `[offset, offset + len)` lies inside `limit` bytes
    pub fn range_fits(offset: u32, len: usize, limit: u32) -> bool {
        (offset as u64) + (len as u64) <= limit as u64
    }

    /// Whether the partition is mirrored in RAM
    pub fn is_cached(&self) -> bool {
        self.flags.contains(PartitionFlags::CACHED)
    }

    /// Bytes an erase request may cover
    ///
    /// Banked partitions may be erased across all of their banks plus the
    /// spare one.
    pub fn erase_limit(&self) -> u64 {
        if self.flags.contains(PartitionFlags::BANKED) {
            self.size as u64 * (self.attrs.num_banks as u64 + 1)
        } else {
            self.data_size as u64
        }
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("phys_start", &format_args!("0x{:08X}", self.phys_start))
            .field("size", &self.size)
            .field("data_size", &self.data_size)
            .field("chain", &self.chain())
            .field("medium", &self.medium)
            .field("flags", &self.flags)
            .finish()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} 0x{:08X}-0x{:08X} {:>8} bytes  {}",
            self.name,
            self.phys_start,
            self.phys_end().saturating_sub(1),
            self.data_size,
            self.medium
        )?;
        let flags = self.flags.names();
        if !flags.is_empty() {
            write!(f, " [{}]", flags.join(", "))?;
        }
        if !self.description.is_empty() {
            write!(f, " {}", self.description)?;
        }
        Ok(())
    }
}

/// Builder for [`Partition`]
pub struct PartitionBuilder {
    part: Partition,
    data_size: Option<u32>,
}

impl PartitionBuilder {
    fn new(name: String, phys_start: u32, size: u32) -> Self {
        Self {
            part: Partition {
                name,
                phys_start,
                size,
                data_size: size,
                drivers: Vec::new(),
                medium: Medium::default(),
                description: String::new(),
                flags: PartitionFlags::empty(),
                attrs: PartitionAttributes::default(),
            },
            data_size: None,
        }
    }

    /// Usable size, when layers keep metadata in the partition
    pub fn data_size(mut self, data_size: u32) -> Self {
        self.data_size = Some(data_size);
        self
    }

    /// Replace the driver chain
    pub fn drivers(mut self, drivers: Vec<Arc<dyn MemDriver>>) -> Self {
        self.part.drivers = drivers;
        self
    }

    /// Append one driver to the bottom of the chain
    pub fn driver(mut self, driver: Arc<dyn MemDriver>) -> Self {
        self.part.drivers.push(driver);
        self
    }

    /// Backing medium
    pub fn medium(mut self, medium: Medium) -> Self {
        self.part.medium = medium;
        self
    }

    /// Free-form description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.part.description = description.into();
        self
    }

    /// Capability flags
    pub fn flags(mut self, flags: PartitionFlags) -> Self {
        self.part.flags |= flags;
        self
    }

    /// Erase granule of the medium
    pub fn erase_block_size(mut self, size: u32) -> Self {
        self.part.attrs.erase_block_size = size;
        self
    }

    /// Attach a RAM mirror and mark the partition cached
    pub fn cache(mut self, ram: CacheRam) -> Self {
        self.part.attrs.cache = Some(ram);
        self.part.flags |= PartitionFlags::CACHED;
        self
    }

    /// Update rate rating used by [`crate::PartitionTable::open_by_update_rate`]
    pub fn max_update_rate_secs(mut self, secs: u32) -> Self {
        self.part.attrs.max_update_rate_secs = Some(secs);
        self
    }

    /// Number of banks; non-zero marks the partition banked
    pub fn banks(mut self, num_banks: u8) -> Self {
        self.part.attrs.num_banks = num_banks;
        if num_banks > 0 {
            self.part.flags |= PartitionFlags::BANKED;
        }
        self
    }

    /// Finish the partition
    pub fn build(mut self) -> Partition {
        if let Some(data_size) = self.data_size {
            self.part.data_size = data_size;
        }
        self.part
    }
}
