//! nvstack-core - Dispatch contract and partition model for a layered NV
//! memory driver stack
//!
//! Storage is split into partitions. Each partition is served by a chain of
//! drivers (for example a RAM cache over raw internal flash) that all speak
//! the same eleven-operation [`MemDriver`] contract. A call enters at the top
//! of the chain and each driver delegates to the rest of the chain as needed.
//!
//! # Example
//!
//! ```ignore
//! use nvstack_core::{PartitionTable, StackConfig};
//!
//! fn dump(table: &PartitionTable) -> nvstack_core::Result<()> {
//!     let part = table.open("config")?;
//!     let mut buf = vec![0u8; part.data_size as usize];
//!     table.read(&part, &mut buf, 0)?;
//!     println!("{}: {} bytes", part.name, buf.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod driver;
pub mod error;
pub mod ioctl;
pub mod partition;

pub use driver::{DriverChain, MemDriver, PowerMode};
pub use error::{EraseFailure, Error, Result};
pub use ioctl::{IoctlCmd, IoctlResponse, SwapBlock, SwapCommand, SwapMode, SwapStatus};
pub use partition::{
    CacheRam, Medium, Partition, PartitionFlags, PartitionTable, StackConfig, TableError,
};
