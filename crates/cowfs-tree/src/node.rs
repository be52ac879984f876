//! On-disk tree node format.
//!
//! A node is either internal (sorted `(separator key, child address)` pairs)
//! or a leaf (sorted `(key, value)` pairs). The variant is an explicit tag
//! so the format is exhaustively matchable.
//!
//! ```text
//! header:          magic u32 | kind u8 | reserved u8 | count u16
//! internal entry:  key_len u16 | child u64 | key bytes
//! leaf entry:      key_len u16 | val_len u16 | key bytes | val bytes
//! ```
//!
//! All integers little-endian. Keys within a node are strictly increasing;
//! decode enforces this so a corrupted-but-checksum-valid node (e.g. from a
//! buggy writer) cannot poison descent logic.

use cowfs_types::{
    BlockAddress, ParseError, ensure_slice, read_le_u16, read_le_u32, read_le_u64, usize_to_u32,
};

/// Node format magic ("COWT" little-endian).
pub const NODE_MAGIC: u32 = 0x5457_4F43;

const HEADER_LEN: usize = 8;
const KIND_INTERNAL: u8 = 0;
const KIND_LEAF: u8 = 1;

/// Decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// `(separator key, child)`: the separator is the minimal key reachable
    /// through the child subtree.
    Internal {
        entries: Vec<(Vec<u8>, BlockAddress)>,
    },
    Leaf {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    },
}

impl Node {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Internal { entries } => entries.len(),
            Self::Leaf { entries } => entries.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }

    /// Minimal key in this node. `None` for an empty node.
    #[must_use]
    pub fn min_key(&self) -> Option<&[u8]> {
        match self {
            Self::Internal { entries } => entries.first().map(|(k, _)| k.as_slice()),
            Self::Leaf { entries } => entries.first().map(|(k, _)| k.as_slice()),
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Self::Internal { entries } => entries
                    .iter()
                    .map(|(k, _)| 2 + 8 + k.len())
                    .sum::<usize>(),
                Self::Leaf { entries } => entries
                    .iter()
                    .map(|(k, v)| 2 + 2 + k.len() + v.len())
                    .sum::<usize>(),
            }
    }

    /// Serialize to bytes. The caller is responsible for fitting the result
    /// into a block payload (see [`Node::encoded_len`]).
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&NODE_MAGIC.to_le_bytes());
        let kind = if self.is_leaf() { KIND_LEAF } else { KIND_INTERNAL };
        out.push(kind);
        out.push(0);
        let count =
            u16::try_from(self.len()).map_err(|_| ParseError::IntegerConversion { field: "count" })?;
        out.extend_from_slice(&count.to_le_bytes());

        match self {
            Self::Internal { entries } => {
                for (key, child) in entries {
                    let key_len = u16::try_from(key.len())
                        .map_err(|_| ParseError::IntegerConversion { field: "key_len" })?;
                    out.extend_from_slice(&key_len.to_le_bytes());
                    out.extend_from_slice(&child.0.to_le_bytes());
                    out.extend_from_slice(key);
                }
            }
            Self::Leaf { entries } => {
                for (key, value) in entries {
                    let key_len = u16::try_from(key.len())
                        .map_err(|_| ParseError::IntegerConversion { field: "key_len" })?;
                    let val_len = u16::try_from(value.len())
                        .map_err(|_| ParseError::IntegerConversion { field: "val_len" })?;
                    out.extend_from_slice(&key_len.to_le_bytes());
                    out.extend_from_slice(&val_len.to_le_bytes());
                    out.extend_from_slice(key);
                    out.extend_from_slice(value);
                }
            }
        }
        Ok(out)
    }

    /// Parse a node from a block payload (trailing padding is ignored).
    pub fn decode(payload: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(payload, 0)?;
        if magic != NODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(NODE_MAGIC),
                actual: u64::from(magic),
            });
        }
        let kind = ensure_slice(payload, 4, 1)?[0];
        let count = usize::from(read_le_u16(payload, 6)?);

        let mut offset = HEADER_LEN;
        let node = match kind {
            KIND_INTERNAL => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = usize::from(read_le_u16(payload, offset)?);
                    if key_len == 0 {
                        return Err(ParseError::InvalidField {
                            field: "key_len",
                            reason: "internal entry key must be non-empty",
                        });
                    }
                    let child = read_le_u64(payload, offset + 2)?;
                    let Some(child) = BlockAddress::from_raw(child) else {
                        return Err(ParseError::InvalidField {
                            field: "child",
                            reason: "internal entry child must be non-zero",
                        });
                    };
                    let key = ensure_slice(payload, offset + 10, key_len)?.to_vec();
                    offset += 10 + key_len;
                    entries.push((key, child));
                }
                Self::Internal { entries }
            }
            KIND_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = usize::from(read_le_u16(payload, offset)?);
                    let val_len = usize::from(read_le_u16(payload, offset + 2)?);
                    if key_len == 0 {
                        return Err(ParseError::InvalidField {
                            field: "key_len",
                            reason: "leaf entry key must be non-empty",
                        });
                    }
                    let key = ensure_slice(payload, offset + 4, key_len)?.to_vec();
                    let value = ensure_slice(payload, offset + 4 + key_len, val_len)?.to_vec();
                    offset += 4 + key_len + val_len;
                    entries.push((key, value));
                }
                Self::Leaf { entries }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "kind",
                    reason: "unknown node kind",
                });
            }
        };

        // Strictly increasing keys; a violation means the block decoded but
        // its contents are not a valid node.
        let sorted = match &node {
            Self::Internal { entries } => entries.windows(2).all(|w| w[0].0 < w[1].0),
            Self::Leaf { entries } => entries.windows(2).all(|w| w[0].0 < w[1].0),
        };
        if !sorted {
            return Err(ParseError::InvalidField {
                field: "keys",
                reason: "not strictly increasing",
            });
        }

        let _ = usize_to_u32(offset, "node_len")?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trip() {
        let node = Node::Leaf {
            entries: vec![
                (b"alpha".to_vec(), b"1".to_vec()),
                (b"beta".to_vec(), vec![]),
                (b"gamma".to_vec(), vec![0xFF; 64]),
            ],
        };
        let bytes = node.encode().expect("encode");
        assert_eq!(bytes.len(), node.encoded_len());
        assert_eq!(Node::decode(&bytes).expect("decode"), node);
    }

    #[test]
    fn internal_round_trip() {
        let node = Node::Internal {
            entries: vec![
                (b"a".to_vec(), BlockAddress(10)),
                (b"m".to_vec(), BlockAddress(20)),
            ],
        };
        let bytes = node.encode().expect("encode");
        assert_eq!(Node::decode(&bytes).expect("decode"), node);
    }

    #[test]
    fn decode_ignores_trailing_padding() {
        let node = Node::Leaf {
            entries: vec![(b"k".to_vec(), b"v".to_vec())],
        };
        let mut bytes = node.encode().expect("encode");
        bytes.resize(bytes.len() + 100, 0);
        assert_eq!(Node::decode(&bytes).expect("decode"), node);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let node = Node::Leaf { entries: vec![] };
        let mut bytes = node.encode().expect("encode");
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Node::decode(&bytes).unwrap_err(),
            ParseError::InvalidMagic { .. }
        ));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let node = Node::Leaf { entries: vec![] };
        let mut bytes = node.encode().expect("encode");
        bytes[4] = 9;
        assert!(Node::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_unsorted_keys() {
        // Hand-build a leaf with descending keys.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&NODE_MAGIC.to_le_bytes());
        bytes.push(KIND_LEAF);
        bytes.push(0);
        bytes.extend_from_slice(&2_u16.to_le_bytes());
        for key in [b"b", b"a"] {
            bytes.extend_from_slice(&1_u16.to_le_bytes());
            bytes.extend_from_slice(&0_u16.to_le_bytes());
            bytes.extend_from_slice(key.as_slice());
        }
        assert!(matches!(
            Node::decode(&bytes).unwrap_err(),
            ParseError::InvalidField { field: "keys", .. }
        ));
    }

    #[test]
    fn decode_rejects_zero_child_address() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&NODE_MAGIC.to_le_bytes());
        bytes.push(KIND_INTERNAL);
        bytes.push(0);
        bytes.extend_from_slice(&1_u16.to_le_bytes());
        bytes.extend_from_slice(&1_u16.to_le_bytes());
        bytes.extend_from_slice(&0_u64.to_le_bytes());
        bytes.push(b'a');
        assert!(Node::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_truncated_entry() {
        let node = Node::Leaf {
            entries: vec![(b"key".to_vec(), b"value".to_vec())],
        };
        let bytes = node.encode().expect("encode");
        assert!(Node::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn min_key_and_len() {
        let node = Node::Leaf {
            entries: vec![(b"k1".to_vec(), vec![]), (b"k2".to_vec(), vec![])],
        };
        assert_eq!(node.min_key(), Some(b"k1".as_slice()));
        assert_eq!(node.len(), 2);
        assert!(!node.is_empty());
        assert!(Node::Leaf { entries: vec![] }.is_empty());
    }
}
