//! nvstack-encrypt - Transparent encryption layer
//!
//! Encrypts a partition with AES-128 in fixed-size windows. The key is a
//! 16-byte record kept in another partition; it is generated from a random
//! source on the first write that finds none.

#![warn(missing_docs)]

pub mod cipher;
mod driver;
pub mod key;

pub use cipher::{WindowCipher, BLOCK_SIZE, DEFAULT_WINDOW};
pub use driver::EncryptionDriver;
pub use key::{AesKey, KeyStore, PartitionKeyStore, KEY_LEN};
