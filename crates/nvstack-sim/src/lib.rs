//! nvstack-sim - Simulated hardware for the storage stack
//!
//! [`SimFlash`] emulates the internal flash controller in memory so the
//! internal flash driver can be exercised without a device, and
//! [`RamDriver`] is a terminal driver over a plain byte array.

pub mod ftfe;
pub mod ram;

pub use ftfe::{CommandRecord, SimFlash, SimFlashConfig};
pub use ram::RamDriver;
