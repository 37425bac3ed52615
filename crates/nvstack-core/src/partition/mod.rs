//! Partitions and the partition manager
//!
//! A partition pairs an immutable descriptor with mutable attributes and the
//! driver chain that serves it. [`PartitionTable`] is the caller-facing
//! manager; [`config`] loads a table description from TOML.

pub mod config;
mod table;
mod types;

pub use config::{ConfigError, DriverKind, StackConfig};
pub use table::{PartitionTable, TableError};
pub use types::{
    CacheRam, Medium, Partition, PartitionAttributes, PartitionBuilder, PartitionFlags,
    PartitionMeta, DEFAULT_ERASE_BLOCK_SIZE,
};
