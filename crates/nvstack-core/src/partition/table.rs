//! Partition manager
//!
//! Owns the ordered partition table and is the entry point for callers: it
//! bounds-checks every request against the partition before handing it to
//! the head of the partition's driver chain.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::driver::PowerMode;
use crate::error::{Error, Result};
use crate::ioctl::{IoctlCmd, IoctlResponse};

use super::types::{Medium, Partition, PartitionFlags};

/// Partition table validation failures
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    /// Usable size exceeds the reserved size
    #[error("partition '{name}': data size {data_size} exceeds size {size}")]
    DataSize {
        /// Partition name
        name: String,
        /// Usable size
        data_size: u32,
        /// Reserved size
        size: u32,
    },
    /// Cached flag and cache buffer disagree, or the buffer is too small
    #[error("partition '{name}': cache buffer does not match the cached flag or data size")]
    CacheBuffer {
        /// Partition name
        name: String,
    },
    /// Banked flag and bank count disagree
    #[error("partition '{name}': banked flag does not match bank count")]
    BankAttributes {
        /// Partition name
        name: String,
    },
    /// Two partitions on the same medium share bytes
    #[error("partitions '{first}' and '{second}' overlap")]
    Overlap {
        /// Lower partition
        first: String,
        /// Upper partition
        second: String,
    },
    /// Two partitions share a name
    #[error("duplicate partition name '{0}'")]
    DuplicateName(String),
}

/// The set of partitions served by the stack
pub struct PartitionTable {
    partitions: Vec<Arc<Partition>>,
    flush_pending: AtomicBool,
}

impl PartitionTable {
    /// Create a table from partitions in search order
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self::from_shared(partitions.into_iter().map(Arc::new).collect())
    }

    /// Create a table from partitions that are also referenced elsewhere
    pub fn from_shared(partitions: Vec<Arc<Partition>>) -> Self {
        Self {
            partitions,
            flush_pending: AtomicBool::new(false),
        }
    }

    /// All partitions in table order
    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    /// Check the table for configuration mistakes
    ///
    /// Hard errors are returned; questionable but workable settings are
    /// logged as warnings.
    pub fn validate(&self) -> core::result::Result<(), TableError> {
        for (i, part) in self.partitions.iter().enumerate() {
            if part.data_size > part.size {
                return Err(TableError::DataSize {
                    name: part.name.clone(),
                    data_size: part.data_size,
                    size: part.size,
                });
            }

            let cache_ok = match (&part.attrs.cache, part.is_cached()) {
                (Some(ram), true) => ram.len() >= part.data_size as usize,
                (None, false) => true,
                _ => false,
            };
            if !cache_ok {
                return Err(TableError::CacheBuffer {
                    name: part.name.clone(),
                });
            }

            let banked = part.flags.contains(PartitionFlags::BANKED);
            if banked != (part.attrs.num_banks > 0) {
                return Err(TableError::BankAttributes {
                    name: part.name.clone(),
                });
            }

            if part.attrs.erase_block_size != 0 && part.phys_start % part.attrs.erase_block_size != 0 {
                log::warn!(
                    "Partition '{}' starts at 0x{:08X}, not on a {}-byte erase block",
                    part.name,
                    part.phys_start,
                    part.attrs.erase_block_size
                );
            }
            if part.description.is_empty() {
                log::warn!("Partition '{}' has no description", part.name);
            }

            for other in &self.partitions[i + 1..] {
                if other.name == part.name {
                    return Err(TableError::DuplicateName(part.name.clone()));
                }
                if overlaps(part, other) {
                    return Err(TableError::Overlap {
                        first: part.name.clone(),
                        second: other.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Initialise and open every partition in table order
    ///
    /// Stops at the first partition that fails.
    pub fn init(&self) -> Result<()> {
        for part in &self.partitions {
            log::debug!("Initialising partition '{}' {:?}", part.name, part.chain());
            part.chain().init(part)?;
            part.chain().open(part).inspect_err(|e| {
                log::error!("Opening partition '{}' failed: {}", part.name, e);
            })?;
        }
        log::info!("{} partitions ready", self.partitions.len());
        Ok(())
    }

    /// Look up a partition by name
    pub fn open(&self, name: &str) -> Result<Arc<Partition>> {
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or(Error::PartitionNotFound)
    }

    /// First partition rated for updates every `secs` seconds or slower
    pub fn open_by_update_rate(&self, secs: u32) -> Result<Arc<Partition>> {
        self.partitions
            .iter()
            .find(|p| matches!(p.attrs.max_update_rate_secs, Some(rate) if rate <= secs))
            .cloned()
            .ok_or(Error::PartitionNotFound)
    }

    /// Close a partition
    pub fn close(&self, part: &Partition) -> Result<()> {
        part.chain().close(part)
    }

    /// Send a power mode change to every partition
    ///
    /// All partitions are visited; the first failure is returned.
    pub fn set_power_mode(&self, mode: PowerMode) -> Result<()> {
        let mut result = Ok(());
        for part in &self.partitions {
            let ret = part.chain().set_power_mode(part, mode);
            if result.is_ok() {
                result = ret;
            }
        }
        result
    }

    /// Usable size of a partition
    pub fn size(&self, name: &str) -> Result<u32> {
        self.open(name).map(|p| p.data_size)
    }

    /// Read from a partition
    pub fn read(&self, part: &Partition, dst: &mut [u8], offset: u32) -> Result<()> {
        if !Partition::range_fits(offset, dst.len(), part.data_size) {
            return Err(Error::AddressOutOfBounds);
        }
        part.chain().read(part, dst, offset)
    }

    /// Write to a partition
    pub fn write(&self, part: &Partition, src: &[u8], offset: u32) -> Result<()> {
        if !Partition::range_fits(offset, src.len(), part.data_size) {
            return Err(Error::AddressOutOfBounds);
        }
        part.chain().write(part, src, offset)
    }

    /// Read across the table as if the data regions were contiguous
    pub fn read_span(&self, dst: &mut [u8], offset: u32) -> Result<()> {
        for (part, part_offset, range) in self.spans(offset, dst.len())? {
            part.chain().read(part, &mut dst[range], part_offset)?;
        }
        Ok(())
    }

    /// Write across the table as if the data regions were contiguous
    pub fn write_span(&self, src: &[u8], offset: u32) -> Result<()> {
        for (part, part_offset, range) in self.spans(offset, src.len())? {
            part.chain().write(part, &src[range], part_offset)?;
        }
        Ok(())
    }

    /// Erase part of a partition
    ///
    /// Erasing a whole-device partition also erases the data region of every
    /// cached partition, so the RAM mirrors do not resurrect stale contents.
    pub fn erase(&self, part: &Partition, offset: u32, len: u32) -> Result<()> {
        if offset as u64 + len as u64 > part.erase_limit() {
            return Err(Error::AddressOutOfBounds);
        }
        let mut result = part.chain().erase(part, offset, len);

        if part.flags.contains(PartitionFlags::WHOLE_DEVICE) {
            for cached in self.partitions.iter().filter(|p| p.is_cached()) {
                log::debug!("Erasing cached partition '{}'", cached.name);
                let ret = cached.chain().erase(cached, 0, cached.data_size);
                if result.is_ok() {
                    result = ret;
                }
            }
        }
        result
    }

    /// Flush one partition
    pub fn flush(&self, part: &Partition) -> Result<()> {
        part.chain().flush(part)
    }

    /// Flush every partition
    ///
    /// Keeps going after a failure and reports the first one.
    pub fn flush_all(&self) -> Result<()> {
        let mut result = Ok(());
        for part in &self.partitions {
            if let Err(e) = part.chain().flush(part) {
                log::warn!("Flushing partition '{}' failed: {}", part.name, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Reload a partition's buffered state from its medium
    pub fn restore(&self, part: &Partition, offset: u32, len: u32) -> Result<()> {
        if offset as u64 + len as u64 > part.data_size as u64 {
            return Err(Error::AddressOutOfBounds);
        }
        part.chain().restore(part, offset, len)
    }

    /// Send a control command to a partition
    pub fn ioctl(&self, part: &Partition, cmd: &IoctlCmd) -> Result<IoctlResponse> {
        part.chain().ioctl(part, cmd)
    }

    /// Ask for all partitions to be flushed on the next time slice
    pub fn request_flush(&self) {
        self.flush_pending.store(true, Ordering::Release);
    }

    /// Run background work
    ///
    /// Partitions are visited in order until one reports work. A pending
    /// flush request is then served. Returns `true` if anything was done.
    pub fn time_slice(&self) -> bool {
        let mut worked = self.partitions.iter().any(|p| p.chain().time_slice(p));

        if self.flush_pending.swap(false, Ordering::AcqRel) {
            log::debug!("Serving deferred flush of all partitions");
            // Failures are already logged per partition
            let _ = self.flush_all();
            worked = true;
        }
        worked
    }

    /// Split a table-wide range into per-partition pieces
    fn spans(&self, offset: u32, len: usize) -> Result<Vec<(&Partition, u32, Range<usize>)>> {
        let mut pieces = Vec::new();
        let mut pos = offset as u64;
        let end = pos + len as u64;
        let mut base = 0u64;
        let mut done = 0usize;

        for part in &self.partitions {
            if pos >= end {
                break;
            }
            let part_end = base + part.data_size as u64;
            if pos < part_end {
                let take = (end.min(part_end) - pos) as usize;
                pieces.push((part.as_ref(), (pos - base) as u32, done..done + take));
                done += take;
                pos += take as u64;
            }
            base = part_end;
        }

        if pos < end {
            return Err(Error::AddressOutOfBounds);
        }
        Ok(pieces)
    }
}

fn overlaps(a: &Partition, b: &Partition) -> bool {
    if a.medium != b.medium || a.medium == Medium::Ram {
        return false;
    }
    if a.flags.contains(PartitionFlags::WHOLE_DEVICE) || b.flags.contains(PartitionFlags::WHOLE_DEVICE) {
        return false;
    }
    (a.phys_start as u64) < b.phys_end() && (b.phys_start as u64) < a.phys_end()
}
