//! nvstack-cache - RAM mirror layer
//!
//! Serves reads and writes of a partition from a RAM copy of its data
//! region. The copy is checked against a CRC-16 trailer when the partition
//! is opened and reloaded from the layer below on mismatch. Flush writes the
//! whole copy, trailer included, back down.

#![warn(missing_docs)]

mod driver;
pub mod trailer;

pub use driver::{CacheConfig, CacheDriver};
pub use trailer::{CacheTrailer, TRAILER_LEN};
