//! Driver dispatch contract
//!
//! A partition is served by an ordered chain of drivers. A call enters at the
//! head of the chain; each driver does its own work and, when it needs the
//! layer below, calls the same operation on the [`DriverChain`] it was handed,
//! which is the remainder of the chain after itself.
//!
//! Whether a driver acts before or after delegating is decided per
//! operation by each driver. The default method bodies below simply delegate.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ioctl::{IoctlCmd, IoctlResponse};
use crate::partition::Partition;

/// Power state requested by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    /// Full speed operation
    #[default]
    Normal,
    /// Reduced power; drivers may park hardware
    Low,
}

/// One link of a memory driver chain
///
/// All eleven operations receive the partition being served and the rest of
/// the chain. Data operations (`read`, `write`, `erase`) have no default;
/// every other operation delegates by default.
///
/// Implementations must be usable from several tasks at once; any state a
/// driver keeps lives behind its own lock.
pub trait MemDriver: Send + Sync {
    /// Short name used in logs and diagnostics
    fn name(&self) -> &'static str;

    /// Prepare the driver for a partition
    ///
    /// Runs once per partition during start-up, before any concurrent use.
    fn init(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        next.init(part)
    }

    /// Bring the partition into service
    fn open(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        next.open(part)
    }

    /// Take the partition out of service
    fn close(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        next.close(part)
    }

    /// Propagate a power mode change
    fn set_power_mode(&self, part: &Partition, mode: PowerMode, next: DriverChain<'_>) -> Result<()> {
        next.set_power_mode(part, mode)
    }

    /// Read `dst.len()` bytes starting at `offset` within the partition
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the partition or the medium
    /// fails.
    fn read(&self, part: &Partition, dst: &mut [u8], offset: u32, next: DriverChain<'_>) -> Result<()>;

    /// Write `src` starting at `offset` within the partition
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the partition or the medium
    /// fails. A failure part way through may leave the range partially
    /// updated.
    fn write(&self, part: &Partition, src: &[u8], offset: u32, next: DriverChain<'_>) -> Result<()>;

    /// Erase `len` bytes starting at `offset` within the partition
    fn erase(&self, part: &Partition, offset: u32, len: u32, next: DriverChain<'_>) -> Result<()>;

    /// Push buffered state down to the medium
    fn flush(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
        next.flush(part)
    }

    /// Handle a control command
    fn ioctl(&self, part: &Partition, cmd: &IoctlCmd, next: DriverChain<'_>) -> Result<IoctlResponse> {
        next.ioctl(part, cmd)
    }

    /// Reload buffered state from the medium
    fn restore(&self, part: &Partition, offset: u32, len: u32, next: DriverChain<'_>) -> Result<()> {
        next.restore(part, offset, len)
    }

    /// Give the driver a chance to do background work
    ///
    /// Returns `true` if any work was done.
    fn time_slice(&self, part: &Partition, next: DriverChain<'_>) -> bool {
        next.time_slice(part)
    }
}

/// Cursor into a driver chain
///
/// Dispatching an operation calls the head driver with the tail as its
/// `next` argument. An empty chain is the end of the line: control
/// operations succeed without effect, data operations fail with
/// [`Error::NoNextDriver`].
#[derive(Clone, Copy)]
pub struct DriverChain<'a> {
    drivers: &'a [Arc<dyn MemDriver>],
}

impl<'a> DriverChain<'a> {
    /// Create a cursor positioned at the first driver
    pub fn new(drivers: &'a [Arc<dyn MemDriver>]) -> Self {
        Self { drivers }
    }

    /// An exhausted chain
    pub fn empty() -> Self {
        Self { drivers: &[] }
    }

    /// Number of drivers left in the chain
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Whether the chain is exhausted
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Head driver and the cursor advanced past it
    fn split(&self) -> Option<(&'a dyn MemDriver, DriverChain<'a>)> {
        self.drivers
            .split_first()
            .map(|(head, tail)| (head.as_ref(), DriverChain { drivers: tail }))
    }

    /// Dispatch `init`
    pub fn init(&self, part: &Partition) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.init(part, next),
            None => Ok(()),
        }
    }

    /// Dispatch `open`
    pub fn open(&self, part: &Partition) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.open(part, next),
            None => Ok(()),
        }
    }

    /// Dispatch `close`
    pub fn close(&self, part: &Partition) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.close(part, next),
            None => Ok(()),
        }
    }

    /// Dispatch `set_power_mode`
    pub fn set_power_mode(&self, part: &Partition, mode: PowerMode) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.set_power_mode(part, mode, next),
            None => Ok(()),
        }
    }

    /// Dispatch `read`
    pub fn read(&self, part: &Partition, dst: &mut [u8], offset: u32) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.read(part, dst, offset, next),
            None => Err(Error::NoNextDriver),
        }
    }

    /// Dispatch `write`
    pub fn write(&self, part: &Partition, src: &[u8], offset: u32) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.write(part, src, offset, next),
            None => Err(Error::NoNextDriver),
        }
    }

    /// Dispatch `erase`
    pub fn erase(&self, part: &Partition, offset: u32, len: u32) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.erase(part, offset, len, next),
            None => Err(Error::NoNextDriver),
        }
    }

    /// Dispatch `flush`
    pub fn flush(&self, part: &Partition) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.flush(part, next),
            None => Ok(()),
        }
    }

    /// Dispatch `ioctl`
    pub fn ioctl(&self, part: &Partition, cmd: &IoctlCmd) -> Result<IoctlResponse> {
        match self.split() {
            Some((driver, next)) => driver.ioctl(part, cmd, next),
            None => Err(Error::UnsupportedIoctl),
        }
    }

    /// Dispatch `restore`
    pub fn restore(&self, part: &Partition, offset: u32, len: u32) -> Result<()> {
        match self.split() {
            Some((driver, next)) => driver.restore(part, offset, len, next),
            None => Ok(()),
        }
    }

    /// Dispatch `time_slice`
    pub fn time_slice(&self, part: &Partition) -> bool {
        match self.split() {
            Some((driver, next)) => driver.time_slice(part, next),
            None => false,
        }
    }
}

impl fmt::Debug for DriverChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.drivers.iter().map(|d| d.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;
    use std::sync::Mutex;

    /// Records the order in which operations reach it
    struct Tracer {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        before: bool,
    }

    impl Tracer {
        fn record(&self, op: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, op));
        }
    }

    impl MemDriver for Tracer {
        fn name(&self) -> &'static str {
            self.name
        }

        fn read(&self, part: &Partition, dst: &mut [u8], offset: u32, next: DriverChain<'_>) -> Result<()> {
            if self.before {
                self.record("read");
                next.read(part, dst, offset)
            } else {
                let ret = next.read(part, dst, offset);
                self.record("read");
                ret
            }
        }

        fn write(&self, part: &Partition, src: &[u8], offset: u32, next: DriverChain<'_>) -> Result<()> {
            self.record("write");
            next.write(part, src, offset)
        }

        fn erase(&self, part: &Partition, offset: u32, len: u32, next: DriverChain<'_>) -> Result<()> {
            self.record("erase");
            next.erase(part, offset, len)
        }

        fn open(&self, part: &Partition, next: DriverChain<'_>) -> Result<()> {
            self.record("open");
            next.open(part)
        }
    }

    /// Terminal driver that fills reads with a constant
    struct Fill(u8);

    impl MemDriver for Fill {
        fn name(&self) -> &'static str {
            "fill"
        }

        fn read(&self, _part: &Partition, dst: &mut [u8], _offset: u32, _next: DriverChain<'_>) -> Result<()> {
            dst.fill(self.0);
            Ok(())
        }

        fn write(&self, _part: &Partition, _src: &[u8], _offset: u32, _next: DriverChain<'_>) -> Result<()> {
            Ok(())
        }

        fn erase(&self, _part: &Partition, _offset: u32, _len: u32, _next: DriverChain<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn traced_partition(log: &Arc<Mutex<Vec<String>>>, terminal: bool) -> Partition {
        let mut drivers: Vec<Arc<dyn MemDriver>> = vec![
            Arc::new(Tracer { name: "top", log: log.clone(), before: false }),
            Arc::new(Tracer { name: "mid", log: log.clone(), before: true }),
        ];
        if terminal {
            drivers.push(Arc::new(Fill(0x5A)));
        }
        Partition::builder("traced", 0, 64).drivers(drivers).build()
    }

    #[test]
    fn test_dispatch_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let part = traced_partition(&log, true);

        let mut buf = [0u8; 4];
        part.chain().read(&part, &mut buf, 0).unwrap();
        assert_eq!(buf, [0x5A; 4]);

        // "top" acts after delegating, "mid" before
        assert_eq!(*log.lock().unwrap(), vec!["mid:read", "top:read"]);
    }

    #[test]
    fn test_exhausted_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let part = traced_partition(&log, false);

        let mut buf = [0u8; 4];
        assert_eq!(part.chain().read(&part, &mut buf, 0), Err(Error::NoNextDriver));
        assert_eq!(part.chain().write(&part, &buf, 0), Err(Error::NoNextDriver));

        // Control operations fall off the end successfully
        assert!(part.chain().open(&part).is_ok());
        assert!(part.chain().flush(&part).is_ok());
        assert!(part.chain().restore(&part, 0, 4).is_ok());
        assert!(!part.chain().time_slice(&part));
        assert_eq!(
            part.chain().ioctl(&part, &IoctlCmd::ReadOnce(0)),
            Err(Error::UnsupportedIoctl)
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["mid:read", "top:read", "top:write", "mid:write", "top:open", "mid:open"]
        );
    }

    #[test]
    fn test_chain_debug() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let part = traced_partition(&log, true);
        assert_eq!(format!("{:?}", part.chain()), r#"["top", "mid", "fill"]"#);
        assert_eq!(part.chain().len(), 3);
        assert!(DriverChain::empty().is_empty());
    }
}
