//! Error types for nvstack-core
//!
//! Every driver in a chain reports failure through this one type so that a
//! status can travel up the chain unchanged.

use core::fmt;

use crate::ioctl::SwapMode;

/// Details about an erase failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseFailure {
    /// Erase command failed or timed out
    CommandFailed {
        /// Address where erase was attempted
        addr: u32,
    },
    /// Re-programming the preserved part of a partially erased sector failed
    MergeFailed {
        /// Sector base address
        addr: u32,
    },
}

/// Core error type, Copy so it can be passed up a driver chain cheaply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Request errors
    /// A parameter was rejected before any medium access
    InvalidParameter,
    /// Offset plus length falls outside the partition or medium
    AddressOutOfBounds,
    /// Operation requires aligned address or size
    InvalidAlignment,

    // Chain errors
    /// A data operation reached the end of its driver chain
    NoNextDriver,
    /// The ioctl command is not handled by any driver in the chain
    UnsupportedIoctl,

    // Medium errors
    /// Flash controller reported a fault after a command completed
    FlashFault {
        /// Address the faulting command targeted
        addr: u32,
        /// Raw status register bits that were set
        status: u8,
    },
    /// Erase operation failed
    EraseError(EraseFailure),
    /// Write/program operation failed
    WriteError,
    /// Read operation failed
    ReadError,
    /// Command completion was not signalled in time
    Timeout,

    // Layer errors
    /// No valid key is stored, so the data cannot be decrypted
    KeyUnavailable,
    /// The bank-swap state machine is not in the state the command requires
    InvalidSwapState {
        /// State the command requires
        expected: SwapMode,
        /// State reported by the controller
        found: SwapMode,
    },
    /// The partition is flagged as cached but carries no RAM mirror
    CacheNotPresent,

    // Table errors
    /// No partition matches the requested name or update rate
    PartitionNotFound,
}

impl fmt::Display for EraseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandFailed { addr } => {
                write!(f, "erase command failed at address 0x{:08X}", addr)
            }
            Self::MergeFailed { addr } => {
                write!(f, "restoring preserved data failed in sector 0x{:08X}", addr)
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::AddressOutOfBounds => write!(f, "address out of bounds"),
            Self::InvalidAlignment => write!(f, "invalid alignment"),
            Self::NoNextDriver => write!(f, "driver chain ended before the request was served"),
            Self::UnsupportedIoctl => write!(f, "ioctl not supported by this driver chain"),
            Self::FlashFault { addr, status } => write!(
                f,
                "flash fault at 0x{:08X} (FSTAT=0x{:02X})",
                addr, status
            ),
            Self::EraseError(failure) => write!(f, "{}", failure),
            Self::WriteError => write!(f, "write operation failed"),
            Self::ReadError => write!(f, "read operation failed"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::KeyUnavailable => write!(f, "no valid encryption key stored"),
            Self::InvalidSwapState { expected, found } => write!(
                f,
                "bank swap requires state {:?}, controller reports {:?}",
                expected, found
            ),
            Self::CacheNotPresent => write!(f, "partition has no cache buffer"),
            Self::PartitionNotFound => write!(f, "partition not found"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
