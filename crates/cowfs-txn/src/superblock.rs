//! Doubly-buffered superblock.
//!
//! Two fixed slots (block addresses 0 and 1) hold superblocks; a commit at
//! generation G writes slot `G % 2`, so the previous superblock is never
//! overwritten in place. Recovery reads both slots and adopts the highest
//! valid generation.
//!
//! ```text
//! magic u32 | format_version u16 | reserved u16 | generation u64 |
//! root u64 | alloc_root u64 | block_size u32 | flags u32 | crc32 u32
//! ```
//!
//! All integers little-endian. The crc covers everything before it and is
//! checked in addition to the block codec's trailer, so a superblock parsed
//! out of any payload is self-validating.

use cowfs_types::{
    BlockAddress, FIRST_ALLOCATABLE, Generation, ParseError, ensure_slice, read_le_u16,
    read_le_u32, read_le_u64,
};

/// Superblock magic ("COWS" little-endian).
pub const SUPERBLOCK_MAGIC: u32 = 0x5357_4F43;

const FORMAT_VERSION: u16 = 1;
const FLAG_SEALED: u32 = 1;
const KNOWN_FLAGS: u32 = FLAG_SEALED;

/// One committed filesystem state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub generation: Generation,
    /// Tree root, `None` for an empty filesystem.
    pub root: Option<BlockAddress>,
    /// First block of the allocator bitmap run.
    pub alloc_root: BlockAddress,
    pub block_size: u32,
    /// Whether blocks are AES-GCM sealed.
    pub sealed: bool,
}

impl Superblock {
    pub const ENCODED_LEN: usize = 44;

    /// Slot this superblock belongs in.
    #[must_use]
    pub fn slot(&self) -> u64 {
        self.generation.0 % 2
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&0_u16.to_le_bytes());
        out.extend_from_slice(&self.generation.0.to_le_bytes());
        out.extend_from_slice(&BlockAddress::to_raw(self.root).to_le_bytes());
        out.extend_from_slice(&self.alloc_root.0.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        let flags = if self.sealed { FLAG_SEALED } else { 0 };
        out.extend_from_slice(&flags.to_le_bytes());
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse a superblock from a block payload (trailing padding ignored).
    pub fn decode(payload: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(payload, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPERBLOCK_MAGIC),
                actual: u64::from(magic),
            });
        }

        let stored_crc = read_le_u32(payload, 40)?;
        let computed_crc = crc32fast::hash(ensure_slice(payload, 0, 40)?);
        if stored_crc != computed_crc {
            return Err(ParseError::InvalidField {
                field: "crc32",
                reason: "checksum mismatch",
            });
        }

        let version = read_le_u16(payload, 4)?;
        if version != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "format_version",
                reason: "unsupported version",
            });
        }

        let generation = Generation(read_le_u64(payload, 8)?);
        let root = BlockAddress::from_raw(read_le_u64(payload, 16)?);
        let alloc_root_raw = read_le_u64(payload, 24)?;
        if alloc_root_raw < FIRST_ALLOCATABLE {
            return Err(ParseError::InvalidField {
                field: "alloc_root",
                reason: "must point past the superblock slots",
            });
        }
        let block_size = read_le_u32(payload, 32)?;
        let flags = read_le_u32(payload, 36)?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "unknown flag bits",
            });
        }

        Ok(Self {
            generation,
            root,
            alloc_root: BlockAddress(alloc_root_raw),
            block_size,
            sealed: flags & FLAG_SEALED != 0,
        })
    }
}
