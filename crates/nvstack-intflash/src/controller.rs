//! Flash controller abstraction
//!
//! [`FlashController`] is the register-level view of the flash memory module
//! plus the few core registers the command sequences touch (the global
//! interrupt mask). The driver only ever talks to hardware through it, so a
//! simulator can stand in for the real module.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::command::FlashCommand;
use crate::regs::FStat;

/// Register access to a flash memory module
pub trait FlashController: Send {
    /// Copy memory-mapped flash contents starting at `addr`
    ///
    /// The caller guarantees the range lies inside the flash array.
    fn read_mem(&self, addr: u32, buf: &mut [u8]);

    /// Read FSTAT
    fn status(&self) -> FStat;

    /// Write FSTAT (write-1-to-clear; writing CCIF launches the loaded command)
    fn write_status(&mut self, bits: FStat);

    /// Write one FCCOB register
    fn write_fccob(&mut self, index: usize, value: u8);

    /// Read one FCCOB register
    fn read_fccob(&self, index: usize) -> u8;

    /// Set CCIE so that command completion raises an interrupt
    ///
    /// The interrupt handler clears CCIE again before signalling.
    fn enable_completion_interrupt(&mut self);

    /// Whether interrupts are globally enabled
    fn interrupts_enabled(&self) -> bool;

    /// Current PRIMASK value
    fn primask(&self) -> u32;

    /// Globally disable interrupts
    fn disable_interrupts(&mut self);

    /// Restore a previously saved PRIMASK value
    fn set_primask(&mut self, primask: u32);

    /// Register the handler the completion interrupt must call
    fn set_completion_handler(&mut self, _handler: IrqHandle) {}

    /// Load every FCCOB register of a command
    fn load_command(&mut self, cmd: &FlashCommand) {
        for (index, value) in cmd.fccob_writes() {
            self.write_fccob(index, value);
        }
    }

    /// Clear the sticky error flags
    fn clear_errors(&mut self) {
        self.write_status(FStat::CLEARABLE);
    }

    /// Start the loaded command
    fn launch(&mut self) {
        self.write_status(FStat::CCIF);
    }

    /// Whether no command is in flight
    fn is_idle(&self) -> bool {
        self.status().contains(FStat::CCIF)
    }
}

/// Binary semaphore posted from the completion interrupt
#[derive(Debug, Default)]
pub struct Completion {
    posted: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    /// Create an unposted completion
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal completion and wake the waiter
    pub fn post(&self) {
        let mut posted = self.posted.lock().unwrap_or_else(PoisonError::into_inner);
        *posted = true;
        self.cond.notify_one();
    }

    /// Drop a stale signal left by an earlier command
    pub fn reset(&self) {
        *self.posted.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Block until posted or until `timeout` elapses
    ///
    /// Consumes the signal and returns `true` if it arrived in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut posted = self.posted.lock().unwrap_or_else(PoisonError::into_inner);
        while !*posted {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            posted = match self.cond.wait_timeout(posted, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *posted = false;
        true
    }
}

/// Handle given to the interrupt path to signal command completion
#[derive(Debug, Clone)]
pub struct IrqHandle(Arc<Completion>);

impl IrqHandle {
    /// Wrap a completion
    pub fn new(completion: Arc<Completion>) -> Self {
        Self(completion)
    }

    /// Completion interrupt entry point
    pub fn on_command_complete(&self) {
        self.0.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completion_times_out() {
        let c = Completion::new();
        let start = Instant::now();
        assert!(!c.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_completion_posted_from_other_thread() {
        let c = Arc::new(Completion::new());
        let irq = IrqHandle::new(c.clone());
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            irq.on_command_complete();
        });
        assert!(c.wait_timeout(Duration::from_secs(5)));
        t.join().unwrap();
        // Signal is consumed
        assert!(!c.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_reset_drops_stale_signal() {
        let c = Completion::new();
        c.post();
        c.reset();
        assert!(!c.wait_timeout(Duration::from_millis(1)));
    }
}
