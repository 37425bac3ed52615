//! Integrity trailer stored after the cached payload
//!
//! On the medium a cached partition is laid out as
//! `[payload: data_size bytes][crc16: u16 little-endian]`.

use crc::{Crc, CRC_16_XMODEM};
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Size of the trailer in bytes
pub const TRAILER_LEN: usize = core::mem::size_of::<CacheTrailer>();

/// CRC-16 trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CacheTrailer {
    crc16: U16,
}

impl CacheTrailer {
    /// Trailer matching `payload`
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            crc16: U16::new(crc16(payload)),
        }
    }

    /// Decode the trailer from the bytes following the payload
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(trailer, _)| trailer)
    }

    /// Stored checksum
    pub fn crc16(&self) -> u16 {
        self.crc16.get()
    }

    /// Whether the trailer matches `payload`
    pub fn matches(&self, payload: &[u8]) -> bool {
        self.crc16() == crc16(payload)
    }
}

/// CRC-16/XMODEM of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
