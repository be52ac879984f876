#![forbid(unsafe_code)]
//! Shared newtypes and byte-parsing helpers for CowFS.
//!
//! Every on-disk quantity gets a unit-carrying wrapper so that block
//! addresses, generations, and byte offsets cannot be mixed up silently.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Superblock slot A lives at block address 0.
pub const SUPERBLOCK_SLOT_A: u64 = 0;
/// Superblock slot B lives at block address 1.
pub const SUPERBLOCK_SLOT_B: u64 = 1;
/// First block address available to the allocator.
pub const FIRST_ALLOCATABLE: u64 = 2;

/// Address of a fixed-size block on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddress(pub u64);

/// Commit generation counter. Strictly increasing across commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

/// Identifier of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Identifier of a held snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

/// Identifier of a file managed by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of a block address, `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, addr: BlockAddress) -> Option<u64> {
        addr.0.checked_mul(u64::from(self.0))
    }
}

impl BlockAddress {
    /// Sentinel meaning "no block" in on-disk pointer fields. Address 0 is
    /// a superblock slot and can never name a tree or data block.
    pub const NONE: Self = Self(0);

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Decode an on-disk pointer field where 0 means "absent".
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    /// Encode an optional address into the on-disk 0-means-absent form.
    #[must_use]
    pub fn to_raw(addr: Option<Self>) -> u64 {
        addr.map_or(0, |a| a.0)
    }
}

impl Generation {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Low 32 bits, used as the codec key epoch.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // deliberate truncation
    pub fn epoch(self) -> u32 {
        self.0 as u32
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
    }

    #[test]
    fn ensure_slice_bounds() {
        let data = [0_u8; 8];
        assert!(ensure_slice(&data, 0, 8).is_ok());
        assert!(ensure_slice(&data, 4, 4).is_ok());
        assert_eq!(
            ensure_slice(&data, 4, 8).unwrap_err(),
            ParseError::InsufficientData {
                needed: 8,
                offset: 4,
                actual: 4,
            }
        );
        assert!(ensure_slice(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().get(), 4096);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn block_to_byte_overflow() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.block_to_byte(BlockAddress(2)), Some(8192));
        assert_eq!(bs.block_to_byte(BlockAddress(u64::MAX)), None);
    }

    #[test]
    fn address_raw_round_trip() {
        assert_eq!(BlockAddress::from_raw(0), None);
        assert_eq!(BlockAddress::from_raw(7), Some(BlockAddress(7)));
        assert_eq!(BlockAddress::to_raw(None), 0);
        assert_eq!(BlockAddress::to_raw(Some(BlockAddress(7))), 7);
    }

    #[test]
    fn generation_next_and_epoch() {
        assert_eq!(Generation(1).next(), Generation(2));
        assert_eq!(Generation(u64::MAX).next(), Generation(u64::MAX));
        assert_eq!(Generation(0x1_0000_0003).epoch(), 3);
    }

    #[test]
    fn display_impls() {
        assert_eq!(BlockAddress(5).to_string(), "5");
        assert_eq!(Generation(9).to_string(), "9");
        assert_eq!(FileId(2).to_string(), "2");
    }
}
