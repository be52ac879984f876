#![forbid(unsafe_code)]
//! Per-block integrity and optional transparent encryption.
//!
//! Every block carries a trailer outside its payload:
//!
//! ```text
//! plain:   payload (N) | reserved (4, zero)      | crc32(payload) (4)
//! sealed:  ciphertext (N) | key epoch (4)        | GCM tag (16) | crc32(ct‖epoch‖tag) (4)
//! ```
//!
//! The crc is verified first on every read; a mismatch is `CorruptBlock`.
//! In sealed mode the GCM tag is then verified during decryption; a tag
//! failure is `AuthenticationFailed`. Neither is ever silently ignored.
//!
//! The GCM nonce is derived from the block address (8 bytes LE) and the key
//! epoch (4 bytes LE). The epoch is the low 32 bits of the committing
//! generation, so an address reused after free/reallocate never repeats a
//! nonce under the same key within an epoch window.
//!
//! Layers above this one (allocator, tree, transaction manager) operate on
//! logical payloads only; this crate is the sole owner of the trailer
//! layout.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use cowfs_block::{BlockBuf, BlockDevice};
use cowfs_error::{EngineError, Result};
use cowfs_types::BlockAddress;
use std::fmt;

/// Trailer size in plain mode: 4 reserved bytes + crc32.
pub const PLAIN_TRAILER: usize = 8;
/// Trailer size in sealed mode: epoch + tag + crc32.
pub const SEALED_TRAILER: usize = 4 + 16 + 4;

/// 256-bit key material for sealed mode.
///
/// `Debug` is redacted so key bytes never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; 32]);

impl KeyMaterial {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Codec operating mode.
#[derive(Debug, Clone)]
pub enum CodecMode {
    /// Checksum only.
    Plain,
    /// AES-256-GCM sealing plus checksum.
    Sealed(KeyMaterial),
}

impl CodecMode {
    #[must_use]
    pub fn trailer_len(&self) -> usize {
        match self {
            Self::Plain => PLAIN_TRAILER,
            Self::Sealed(_) => SEALED_TRAILER,
        }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed(_))
    }
}

/// Stateless block encoder/decoder for one engine instance.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    mode: CodecMode,
    block_len: usize,
}

fn nonce_for(addr: BlockAddress, epoch: u32) -> [u8; 12] {
    let mut nonce = [0_u8; 12];
    nonce[..8].copy_from_slice(&addr.0.to_le_bytes());
    nonce[8..].copy_from_slice(&epoch.to_le_bytes());
    nonce
}

impl BlockCodec {
    pub fn new(mode: CodecMode, block_len: usize) -> Result<Self> {
        // The payload must leave room for at least one trailer plus some data.
        if block_len <= mode.trailer_len() * 2 {
            return Err(EngineError::Format(format!(
                "block length {block_len} too small for codec trailer"
            )));
        }
        Ok(Self { mode, block_len })
    }

    /// Usable payload bytes per block.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.block_len - self.mode.trailer_len()
    }

    #[must_use]
    pub fn mode(&self) -> &CodecMode {
        &self.mode
    }

    /// Encode a logical payload into a full on-disk block.
    ///
    /// `payload` may be shorter than [`payload_len`](Self::payload_len);
    /// it is zero-padded. Longer payloads are rejected.
    pub fn encode(&self, addr: BlockAddress, epoch: u32, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.payload_len() {
            return Err(EngineError::Format(format!(
                "payload of {} bytes exceeds capacity {}",
                payload.len(),
                self.payload_len()
            )));
        }

        let mut block = vec![0_u8; self.block_len];
        block[..payload.len()].copy_from_slice(payload);

        match &self.mode {
            CodecMode::Plain => {
                let crc = crc32fast::hash(&block[..self.payload_len()]);
                let crc_at = self.block_len - 4;
                block[crc_at..].copy_from_slice(&crc.to_le_bytes());
            }
            CodecMode::Sealed(key) => {
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
                let nonce = nonce_for(addr, epoch);
                let payload_len = self.payload_len();
                let tag = cipher
                    .encrypt_in_place_detached(
                        Nonce::from_slice(&nonce),
                        &[],
                        &mut block[..payload_len],
                    )
                    .map_err(|_| {
                        EngineError::Format("AES-GCM encryption failed".to_owned())
                    })?;

                block[payload_len..payload_len + 4].copy_from_slice(&epoch.to_le_bytes());
                block[payload_len + 4..payload_len + 20].copy_from_slice(tag.as_slice());
                let crc = crc32fast::hash(&block[..payload_len + 20]);
                block[payload_len + 20..].copy_from_slice(&crc.to_le_bytes());
            }
        }

        Ok(block)
    }

    /// Decode a full on-disk block back into its logical payload.
    pub fn decode(&self, addr: BlockAddress, block: &[u8]) -> Result<Vec<u8>> {
        if block.len() != self.block_len {
            return Err(EngineError::Format(format!(
                "block length mismatch: got={} expected={}",
                block.len(),
                self.block_len
            )));
        }

        let payload_len = self.payload_len();
        let crc_at = self.block_len - 4;
        let stored_crc = u32::from_le_bytes([
            block[crc_at],
            block[crc_at + 1],
            block[crc_at + 2],
            block[crc_at + 3],
        ]);
        let computed_crc = crc32fast::hash(&block[..crc_at - reserved_gap(&self.mode)]);
        if stored_crc != computed_crc {
            return Err(EngineError::CorruptBlock {
                address: addr.0,
                detail: format!(
                    "checksum mismatch: stored={stored_crc:#010x} computed={computed_crc:#010x}"
                ),
            });
        }

        match &self.mode {
            CodecMode::Plain => Ok(block[..payload_len].to_vec()),
            CodecMode::Sealed(key) => {
                let epoch = u32::from_le_bytes([
                    block[payload_len],
                    block[payload_len + 1],
                    block[payload_len + 2],
                    block[payload_len + 3],
                ]);
                let tag_bytes = &block[payload_len + 4..payload_len + 20];

                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
                let nonce = nonce_for(addr, epoch);
                let mut buf = block[..payload_len].to_vec();
                cipher
                    .decrypt_in_place_detached(
                        Nonce::from_slice(&nonce),
                        &[],
                        &mut buf,
                        Tag::from_slice(tag_bytes),
                    )
                    .map_err(|_| EngineError::AuthenticationFailed { address: addr.0 })?;
                Ok(buf)
            }
        }
    }
}

/// Bytes between the crc-covered region and the crc itself.
///
/// Plain mode keeps 4 reserved bytes out of the crc; sealed mode covers
/// everything up to the crc.
fn reserved_gap(mode: &CodecMode) -> usize {
    match mode {
        CodecMode::Plain => 4,
        CodecMode::Sealed(_) => 0,
    }
}

/// A [`BlockDevice`] seen through the codec: callers read and write logical
/// payloads; checksums and sealing are applied transparently.
#[derive(Debug)]
pub struct CodecDevice<D: BlockDevice> {
    dev: D,
    codec: BlockCodec,
}

impl<D: BlockDevice> CodecDevice<D> {
    pub fn new(dev: D, mode: CodecMode) -> Result<Self> {
        let block_len = usize::try_from(dev.block_size())
            .map_err(|_| EngineError::Format("block_size does not fit usize".to_owned()))?;
        let codec = BlockCodec::new(mode, block_len)?;
        Ok(Self { dev, codec })
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.codec.payload_len()
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    #[must_use]
    pub fn codec(&self) -> &BlockCodec {
        &self.codec
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Read and verify the payload at `addr`.
    pub fn read_payload(&self, addr: BlockAddress) -> Result<Vec<u8>> {
        let buf: BlockBuf = self.dev.read_block(addr)?;
        self.codec.decode(addr, buf.as_slice())
    }

    /// Seal and write a payload to `addr`.
    pub fn write_payload(&self, addr: BlockAddress, epoch: u32, payload: &[u8]) -> Result<()> {
        let block = self.codec.encode(addr, epoch, payload)?;
        self.dev.write_block(addr, &block)
    }

    /// Flush the underlying device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}
