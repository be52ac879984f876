#![forbid(unsafe_code)]
//! Block device layer.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed device
//! using pread/pwrite, an in-memory device with a volatile/durable split for
//! crash-injection tests, and an LRU read cache.
//!
//! The engine above this layer assumes writes are not durable until `sync()`
//! returns; `sync()` is the only durability boundary.

mod crash;

pub use crash::{CrashDevice, FailurePlan};

use cowfs_error::{EngineError, Result};
use cowfs_types::{BlockAddress, BlockSize};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by address.
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf>;

    /// Write a block by address. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf> {
        (**self).read_block(addr)
    }

    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()> {
        (**self).write_block(addr, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) a file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }
}

fn check_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let len_u64 =
        u64::try_from(len).map_err(|_| EngineError::Format(format!("{op} length overflows u64")))?;
    let end = offset
        .checked_add(len_u64)
        .ok_or_else(|| EngineError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(EngineError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(EngineError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Public (not test-only) because the crash-injection harness and the
/// e2e suites of higher crates build engines on top of it.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Snapshot of the raw image, e.g. for corrupting bytes in tests.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Replace the raw image.
    pub fn set_contents(&self, image: Vec<u8>) {
        *self.bytes.lock() = image;
    }

    /// Flip one bit at `offset`, for corruption tests.
    pub fn flip_bit(&self, offset: usize, bit: u8) {
        let mut bytes = self.bytes.lock();
        if offset < bytes.len() {
            bytes[offset] ^= 1 << (bit % 8);
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let offset =
            usize::try_from(offset).map_err(|_| EngineError::Format("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let offset =
            usize::try_from(offset).map_err(|_| EngineError::Format("offset overflow".into()))?;
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapter exposing a [`ByteDevice`] as a [`BlockDevice`] with a fixed,
/// validated block size.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size.get());
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(EngineError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf> {
        if addr.0 >= self.block_count {
            return Err(EngineError::Format(format!(
                "block out of range: addr={} block_count={}",
                addr.0, self.block_count
            )));
        }

        let offset = self
            .block_size
            .block_to_byte(addr)
            .ok_or_else(|| EngineError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size.as_usize() {
            return Err(EngineError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if addr.0 >= self.block_count {
            return Err(EngineError::Format(format!(
                "block out of range: addr={} block_count={}",
                addr.0, self.block_count
            )));
        }

        let offset = self
            .block_size
            .block_to_byte(addr)
            .ok_or_else(|| EngineError::Format("block offset overflow".to_owned()))?;
        self.inner.write_all_at(offset, data)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// LRU read cache wrapping a [`BlockDevice`].
///
/// Write-through: writes update the cache and the underlying device
/// immediately, so `sync()` ordering guarantees are unchanged.
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    inner: D,
    state: Mutex<LruState>,
}

#[derive(Debug)]
struct LruState {
    capacity: usize,
    order: VecDeque<BlockAddress>,
    resident: HashMap<BlockAddress, Vec<u8>>,
}

impl LruState {
    fn touch(&mut self, addr: BlockAddress) {
        if let Some(pos) = self.order.iter().position(|a| *a == addr) {
            let _ = self.order.remove(pos);
        }
        self.order.push_back(addr);
    }

    fn insert(&mut self, addr: BlockAddress, bytes: Vec<u8>) {
        self.touch(addr);
        self.resident.insert(addr, bytes);
        while self.resident.len() > self.capacity {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            let _ = self.resident.remove(&victim);
        }
    }
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(EngineError::Format(
                "BlockCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(LruState {
                capacity: capacity_blocks,
                order: VecDeque::new(),
                resident: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Drop all cached blocks. Used after out-of-band image mutation
    /// (corruption tests) so reads observe the device, not the cache.
    pub fn invalidate(&self) {
        let mut guard = self.state.lock();
        guard.order.clear();
        guard.resident.clear();
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.resident.get(&addr).cloned() {
                guard.touch(addr);
                drop(guard);
                return Ok(BlockBuf::new(bytes));
            }
        }

        let buf = self.inner.read_block(addr)?;
        self.state.lock().insert(addr, buf.as_slice().to_vec());
        Ok(buf)
    }

    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()> {
        self.inner.write_block(addr, data)?;
        self.state.lock().insert(addr, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(v: u32) -> BlockSize {
        BlockSize::new(v).expect("block size")
    }

    #[test]
    fn byte_block_device_round_trips() {
        let mem = MemByteDevice::new(4096 * 4);
        let dev = ByteBlockDevice::new(mem, bs(4096)).expect("device");

        dev.write_block(BlockAddress(2), &[7_u8; 4096]).expect("write");
        let read = dev.read_block(BlockAddress(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 4096]);
    }

    #[test]
    fn byte_block_device_rejects_misaligned_image() {
        let mem = MemByteDevice::new(4096 + 100);
        assert!(ByteBlockDevice::new(mem, bs(4096)).is_err());
    }

    #[test]
    fn byte_block_device_rejects_out_of_range() {
        let mem = MemByteDevice::new(4096 * 2);
        let dev = ByteBlockDevice::new(mem, bs(4096)).expect("device");
        assert!(dev.read_block(BlockAddress(2)).is_err());
        assert!(dev.write_block(BlockAddress(2), &[0_u8; 4096]).is_err());
        assert!(dev.write_block(BlockAddress(0), &[0_u8; 100]).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.bin");
        let dev = FileByteDevice::create(&path, 4096 * 4).expect("create");
        let blk = ByteBlockDevice::new(dev, bs(4096)).expect("device");

        blk.write_block(BlockAddress(3), &[0xAA_u8; 4096]).expect("write");
        blk.sync().expect("sync");

        let reopened = FileByteDevice::open(&path).expect("open");
        let blk2 = ByteBlockDevice::new(reopened, bs(4096)).expect("device");
        let read = blk2.read_block(BlockAddress(3)).expect("read");
        assert_eq!(read.as_slice(), &[0xAA_u8; 4096]);
    }

    #[test]
    fn cache_hits_after_first_read() {
        let mem = MemByteDevice::new(4096 * 4);
        let dev = ByteBlockDevice::new(mem, bs(4096)).expect("device");
        let cache = BlockCache::new(dev, 2).expect("cache");

        cache.write_block(BlockAddress(1), &[3_u8; 4096]).expect("write");
        let r1 = cache.read_block(BlockAddress(1)).expect("read1");
        let r2 = cache.read_block(BlockAddress(1)).expect("read2");
        assert_eq!(r1.as_slice(), &[3_u8; 4096]);
        assert_eq!(r2.as_slice(), &[3_u8; 4096]);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mem = MemByteDevice::new(4096 * 4);
        let dev = ByteBlockDevice::new(mem, bs(4096)).expect("device");
        let cache = BlockCache::new(dev, 2).expect("cache");

        for i in 0..4 {
            cache
                .write_block(BlockAddress(i), &[u8::try_from(i).unwrap(); 4096])
                .expect("write");
        }
        // Only the last two stay resident; reads still succeed via device.
        for i in 0..4 {
            let read = cache.read_block(BlockAddress(i)).expect("read");
            assert_eq!(read.as_slice()[0], u8::try_from(i).unwrap());
        }
    }

    #[test]
    fn cache_invalidate_reloads_from_device() {
        let mem = MemByteDevice::new(4096 * 2);
        let dev = ByteBlockDevice::new(mem, bs(4096)).expect("device");
        let cache = BlockCache::new(dev, 2).expect("cache");

        cache.write_block(BlockAddress(0), &[1_u8; 4096]).expect("write");
        cache.inner().inner().flip_bit(0, 0);

        // Cached copy still has the original byte.
        assert_eq!(cache.read_block(BlockAddress(0)).expect("read").as_slice()[0], 1);
        cache.invalidate();
        assert_ne!(cache.read_block(BlockAddress(0)).expect("read").as_slice()[0], 1);
    }
}
