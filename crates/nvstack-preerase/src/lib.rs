//! nvstack-preerase - Erase-ahead layer
//!
//! For partitions that are written front to back, such as logs and firmware
//! images. A write that starts a sector erases that sector first, and a write
//! that runs into the next sector erases the next one, so the medium below
//! never has to read, merge and erase on its own.

#![warn(missing_docs)]

mod driver;

pub use driver::PreEraseDriver;
