//! Cache driver
//!
//! Keeps the whole data region of a partition in RAM. Reads and writes only
//! touch the RAM copy; the child chain sees full-region writes on flush and
//! erase, and a full-region read on restore.

use nvstack_core::{CacheRam, DriverChain, Error, MemDriver, Partition, Result};

use zerocopy::IntoBytes;

use crate::trailer::{CacheTrailer, TRAILER_LEN};

/// Cache driver options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Recompute the CRC trailer in RAM on every write
    ///
    /// Off by default: the trailer is only brought up to date by a restore,
    /// so it may not match the payload between a write and the next restore.
    pub refresh_trailer_on_write: bool,
}

/// RAM mirror layer
#[derive(Debug, Default)]
pub struct CacheDriver {
    config: CacheConfig,
}

impl CacheDriver {
    /// Create a cache driver
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    /// Driver options
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn ram(part: &Partition) -> Result<&CacheRam> {
        part.attrs.cache.as_ref().ok_or(Error::CacheNotPresent)
    }

    /// Whether the RAM image carries a trailer matching its payload
    pub fn is_consistent(part: &Partition) -> Result<bool> {
        let ram = Self::ram(part)?;
        let buf = ram.lock();
        Ok(trailer_matches(&buf, part.data_size as usize))
    }

    fn reload(part: &Partition, buf: &mut [u8], next: DriverChain<'_>) -> Result<()> {
        let len = part.data_size as usize + TRAILER_LEN;
        next.read(part, &mut buf[..len], 0)
    }

    fn write_back(part: &Partition, buf: &[u8], next: DriverChain<'_>) -> Result<()> {
        let len = part.data_size as usize + TRAILER_LEN;
        next.write(part, &buf[..len], 0)
    }

    fn check_range(part: &Partition, offset: u32, len: usize) -> Result<()> {
        if Partition::range_fits(offset, len, part.data_size) {
            Ok(())
        } else {
            Err(Error::AddressOutOfBounds)
        }
    }
}

fn trailer_matches(buf: &[u8], data_size: usize) -> bool {
    let (payload, rest) = buf.split_at(data_size.min(buf.len()));
    CacheTrailer::parse(rest).is_some_and(|t| t.matches(payload))
}

impl MemDriver for CacheDriver {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn init(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        let ram = Self::ram(part)?;
        if ram.len() != part.data_size as usize + TRAILER_LEN {
            log::error!(
                "Partition '{}': cache buffer is {} bytes, expected {}",
                part.name,
                ram.len(),
                part.data_size as usize + TRAILER_LEN
            );
            return Err(Error::InvalidParameter);
        }
        next.init(part)
    }

    fn open(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        let ram = Self::ram(part)?;
        part.attrs.meta.set_cache_restored(false);
        next.open(part)?;

        let mut buf = ram.lock();
        if !trailer_matches(&buf, part.data_size as usize) {
            log::warn!("Partition '{}': cache CRC mismatch, restoring from medium", part.name);
            Self::reload(part, &mut buf, next)?;
        }
        part.attrs.meta.set_cache_restored(true);
        Ok(())
    }

    fn read(&self, part: &Partition, dst: &mut [u8], offset: u32, _next: DriverChain<'_>) -> Result<()> {
        Self::check_range(part, offset, dst.len())?;
        let buf = Self::ram(part)?.lock();
        let start = offset as usize;
        dst.copy_from_slice(&buf[start..start + dst.len()]);
        Ok(())
    }

    fn write(&self, part: &Partition, src: &[u8], offset: u32, _next: DriverChain<'_>) -> Result<()> {
        Self::check_range(part, offset, src.len())?;
        let mut buf = Self::ram(part)?.lock();
        let start = offset as usize;
        buf[start..start + src.len()].copy_from_slice(src);

        if self.config.refresh_trailer_on_write {
            let data_size = part.data_size as usize;
            let (payload, trailer) = buf.split_at_mut(data_size);
            let crc = CacheTrailer::for_payload(payload);
            trailer[..TRAILER_LEN].copy_from_slice(crc.as_bytes());
        }
        Ok(())
    }

    fn erase(&self, part: &Partition, offset: u32, len: u32, next: DriverChain<'_>) -> Result<()> {
        Self::check_range(part, offset, len as usize)?;
        let mut buf = Self::ram(part)?.lock();
        let start = offset as usize;
        buf[start..start + len as usize].fill(0);
        // Pushed down whether or not the mirror was ever restored
        Self::write_back(part, &buf, next)
    }

    fn flush(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        if !part.attrs.meta.cache_restored() {
            log::debug!("Partition '{}': cache not restored, skipping flush", part.name);
            return Ok(());
        }
        let buf = Self::ram(part)?.lock();
        Self::write_back(part, &buf, next)
    }

    /// Reload the whole mirror; the range arguments are ignored
    fn restore(&self, part: &Partition, _offset: u32, _len: u32, next: DriverChain<'_>) -> Result<()> {
        let mut buf = Self::ram(part)?.lock();
        Self::reload(part, &mut buf, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvstack_core::PowerMode;
    use nvstack_sim::RamDriver;
    use std::sync::Arc;

    const DATA_SIZE: usize = 64;

    fn image(payload: &[u8]) -> Vec<u8> {
        let mut nv = payload.to_vec();
        nv.extend_from_slice(CacheTrailer::for_payload(payload).as_bytes());
        nv
    }

    fn cached(ram: Vec<u8>, child: &Arc<RamDriver>, cache: CacheDriver) -> Partition {
        Partition::builder("cached", 0, (DATA_SIZE + TRAILER_LEN) as u32)
            .data_size(DATA_SIZE as u32)
            .cache(CacheRam::with_contents(ram))
            .driver(Arc::new(cache))
            .driver(child.clone())
            .build()
    }

    #[test]
    fn test_cold_start_restores() {
        let payload: Vec<u8> = (0..DATA_SIZE as u8).collect();
        let child = Arc::new(RamDriver::with_data(image(&payload)));
        let part = cached(vec![0xA5; DATA_SIZE + TRAILER_LEN], &child, CacheDriver::default());

        part.chain().init(&part).unwrap();
        part.chain().open(&part).unwrap();
        assert!(part.attrs.meta.cache_restored());
        assert_eq!(child.reads(), 1);
        assert!(CacheDriver::is_consistent(&part).unwrap());

        let mut buf = [0u8; DATA_SIZE];
        part.chain().read(&part, &mut buf, 0).unwrap();
        assert_eq!(&buf[..], payload.as_slice());
    }

    #[test]
    fn test_warm_start_keeps_ram() {
        let ram = image(&[7u8; DATA_SIZE]);
        let child = Arc::new(RamDriver::with_data(image(&[9u8; DATA_SIZE])));
        let part = cached(ram, &child, CacheDriver::default());

        part.chain().open(&part).unwrap();
        assert_eq!(child.reads(), 0);

        let mut buf = [0u8; 4];
        part.chain().read(&part, &mut buf, 10).unwrap();
        assert_eq!(buf, [7; 4]);
    }

    #[test]
    fn test_failed_restore_stays_unrestored() {
        // Child too small to serve the full region
        let child = Arc::new(RamDriver::new(DATA_SIZE));
        let part = cached(vec![0; DATA_SIZE + TRAILER_LEN], &child, CacheDriver::default());
        part.chain().write(&part, &[1, 2, 3], 0).unwrap();

        assert_eq!(part.chain().open(&part), Err(Error::AddressOutOfBounds));
        assert!(!part.attrs.meta.cache_restored());

        // Flush is gated on the restored flag
        part.chain().flush(&part).unwrap();
        assert_eq!(child.writes(), 0);
    }

    #[test]
    fn test_read_write_stay_in_ram() {
        let child = Arc::new(RamDriver::with_data(image(&[0u8; DATA_SIZE])));
        let part = cached(image(&[0u8; DATA_SIZE]), &child, CacheDriver::default());
        part.chain().open(&part).unwrap();

        part.chain().write(&part, b"abcd", 30).unwrap();
        let mut buf = [0u8; 6];
        part.chain().read(&part, &mut buf, 29).unwrap();
        assert_eq!(&buf, b"\0abcd\0");
        assert_eq!((child.reads(), child.writes()), (0, 0));
        assert_eq!(&child.contents()[30..34], &[0; 4]);

        assert_eq!(
            part.chain().write(&part, b"xy", DATA_SIZE as u32 - 1),
            Err(Error::AddressOutOfBounds)
        );
    }

    #[test]
    fn test_write_leaves_trailer_stale() {
        let child = Arc::new(RamDriver::with_data(image(&[0u8; DATA_SIZE])));
        let part = cached(image(&[0u8; DATA_SIZE]), &child, CacheDriver::default());
        part.chain().open(&part).unwrap();

        part.chain().write(&part, &[1], 0).unwrap();
        assert!(!CacheDriver::is_consistent(&part).unwrap());

        // Flushed as is, so the next cold start restores the new payload
        // but with a trailer that does not match it
        part.chain().flush(&part).unwrap();
        let nv = child.contents();
        assert_eq!(nv[0], 1);
        assert_eq!(&nv[DATA_SIZE..], CacheTrailer::for_payload(&[0u8; DATA_SIZE]).as_bytes());
    }

    #[test]
    fn test_refresh_trailer_on_write() {
        let child = Arc::new(RamDriver::with_data(image(&[0u8; DATA_SIZE])));
        let cache = CacheDriver::new(CacheConfig {
            refresh_trailer_on_write: true,
        });
        let part = cached(image(&[0u8; DATA_SIZE]), &child, cache);
        part.chain().open(&part).unwrap();

        part.chain().write(&part, &[1, 2], 5).unwrap();
        assert!(CacheDriver::is_consistent(&part).unwrap());

        part.chain().flush(&part).unwrap();
        let mut payload = [0u8; DATA_SIZE];
        payload[5] = 1;
        payload[6] = 2;
        assert_eq!(child.contents(), image(&payload));
    }

    #[test]
    fn test_erase_bypasses_restored_gate() {
        let child = Arc::new(RamDriver::new(DATA_SIZE + TRAILER_LEN));
        let part = cached(vec![0x11; DATA_SIZE + TRAILER_LEN], &child, CacheDriver::default());
        assert!(!part.attrs.meta.cache_restored());

        part.chain().erase(&part, 8, 8).unwrap();
        assert_eq!(child.writes(), 1);
        let nv = child.contents();
        assert_eq!(&nv[..8], &[0x11; 8]);
        assert_eq!(&nv[8..16], &[0; 8]);
        assert_eq!(&nv[16..], &vec![0x11; DATA_SIZE + TRAILER_LEN - 16][..]);
    }

    #[test]
    fn test_restore_reads_full_region() {
        let payload = [0x42u8; DATA_SIZE];
        let child = Arc::new(RamDriver::with_data(image(&payload)));
        let part = cached(vec![0; DATA_SIZE + TRAILER_LEN], &child, CacheDriver::default());

        part.chain().restore(&part, 10, 1).unwrap();
        assert!(CacheDriver::is_consistent(&part).unwrap());
        let mut buf = [0u8; DATA_SIZE];
        part.chain().read(&part, &mut buf, 0).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn test_init_checks_buffer() {
        let child = Arc::new(RamDriver::new(256));
        let part = Partition::builder("bad", 0, 128)
            .data_size(100)
            .cache(CacheRam::new(100))
            .driver(Arc::new(CacheDriver::default()))
            .driver(child.clone())
            .build();
        assert_eq!(part.chain().init(&part), Err(Error::InvalidParameter));

        let uncached = Partition::builder("plain", 0, 128)
            .driver(Arc::new(CacheDriver::default()))
            .driver(child)
            .build();
        assert_eq!(uncached.chain().init(&uncached), Err(Error::CacheNotPresent));
    }

    #[test]
    fn test_delegated_control() {
        let child = Arc::new(RamDriver::new(DATA_SIZE + TRAILER_LEN));
        let part = cached(vec![0; DATA_SIZE + TRAILER_LEN], &child, CacheDriver::default());
        part.chain().set_power_mode(&part, PowerMode::Low).unwrap();
        part.chain().close(&part).unwrap();
        assert!(!part.chain().time_slice(&part));
    }
}
