//! Key schema for the filesystem tree.
//!
//! All records live in one ordered key space; the first byte tags the
//! record family so families occupy disjoint, contiguous ranges:
//!
//! ```text
//! 0x01                                  next file id (u64 LE value)
//! 0x02 | name bytes                     name -> file id (u64 LE value)
//! 0x03 | file id (u64 BE)               inode record
//! 0x04 | file id (u64 BE) | index (BE)  chunk record
//! ```
//!
//! Ids and chunk indices are big-endian so that a range scan over one
//! file's prefix yields its chunks in offset order.

use cowfs_types::FileId;

pub const TAG_META: u8 = 0x01;
pub const TAG_NAME: u8 = 0x02;
pub const TAG_INODE: u8 = 0x03;
pub const TAG_CHUNK: u8 = 0x04;

#[must_use]
pub fn next_file_id_key() -> Vec<u8> {
    vec![TAG_META]
}

#[must_use]
pub fn name_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(TAG_NAME);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Bounds of the name family, for directory listings.
#[must_use]
pub fn name_range() -> (Vec<u8>, Vec<u8>) {
    (vec![TAG_NAME], vec![TAG_NAME + 1])
}

#[must_use]
pub fn name_from_key(key: &[u8]) -> Option<&[u8]> {
    key.strip_prefix(&[TAG_NAME])
}

#[must_use]
pub fn inode_key(id: FileId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(TAG_INODE);
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

#[must_use]
pub fn chunk_key(id: FileId, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(TAG_CHUNK);
    key.extend_from_slice(&id.0.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Bounds of one file's chunk family.
#[must_use]
pub fn chunk_range(id: FileId) -> (Vec<u8>, Vec<u8>) {
    let mut lo = Vec::with_capacity(9);
    lo.push(TAG_CHUNK);
    lo.extend_from_slice(&id.0.to_be_bytes());
    let hi = match id.0.checked_add(1) {
        Some(next) => {
            let mut hi = Vec::with_capacity(9);
            hi.push(TAG_CHUNK);
            hi.extend_from_slice(&next.to_be_bytes());
            hi
        }
        None => vec![TAG_CHUNK + 1],
    };
    (lo, hi)
}

#[must_use]
pub fn chunk_index_from_key(key: &[u8]) -> Option<u64> {
    if key.len() != 17 || key[0] != TAG_CHUNK {
        return None;
    }
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&key[9..]);
    Some(u64::from_be_bytes(bytes))
}
