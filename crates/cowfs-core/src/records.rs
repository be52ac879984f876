//! On-disk value records stored in the tree.

use cowfs_types::{BlockAddress, FileId, ParseError, read_le_u32, read_le_u64};

/// Per-file metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    /// Logical file size in bytes. Chunks absent below this size read as
    /// zeros (sparse regions).
    pub size: u64,
}

impl Inode {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.size.to_le_bytes().to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            size: read_le_u64(raw, 0)?,
        })
    }
}

/// One fixed-size chunk of file data, stored out of line in a raw block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Block holding the chunk payload.
    pub addr: BlockAddress,
    /// Valid bytes at the start of the chunk.
    pub len: u32,
}

impl ChunkRecord {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.addr.0.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ParseError> {
        let addr = BlockAddress::from_raw(read_le_u64(raw, 0)?).ok_or(ParseError::InvalidField {
            field: "addr",
            reason: "chunk block address must be non-zero",
        })?;
        Ok(Self {
            addr,
            len: read_le_u32(raw, 8)?,
        })
    }
}

#[must_use]
pub fn encode_file_id(id: FileId) -> Vec<u8> {
    id.0.to_le_bytes().to_vec()
}

pub fn decode_file_id(raw: &[u8]) -> Result<FileId, ParseError> {
    Ok(FileId(read_le_u64(raw, 0)?))
}
