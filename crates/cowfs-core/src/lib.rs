#![forbid(unsafe_code)]
//! Filesystem facade over the transactional CoW store.
//!
//! Files are flat (no directories): a name maps to a [`FileId`], the id to
//! an inode record, and file contents to fixed-size chunks stored out of
//! line in raw data blocks. All records live in one CoW tree, so every
//! mutation here is a single transaction and commits atomically.
//!
//! Regions never written read as zeros; sparse files cost nothing.
//!
//! The device stack, bottom up: caller-supplied [`BlockDevice`], LRU
//! [`BlockCache`], then the checksum/sealing codec. The facade only ever
//! sees verified logical payloads.

mod keys;
mod records;

pub use cowfs_codec::KeyMaterial;
pub use cowfs_tree::TreeConfig;
pub use cowfs_txn::{ManagerStats, RecoveryReport, TxnCounters, WriterPolicy};
pub use cowfs_types::{FileId, Generation, SnapshotId};
pub use records::{ChunkRecord, Inode};

use cowfs_block::{BlockCache, BlockDevice};
use cowfs_codec::{CodecDevice, CodecMode};
use cowfs_error::{EngineError, Result};
use cowfs_tree::{Node, NodeSource, RangeCursor, TreeContext, insert, lookup, max_key_len, remove, walk};
use cowfs_txn::{TxnManager, TxnOptions};
use cowfs_types::{BlockAddress, ParseError};
use tracing::{debug, info};

/// Hard cap on file name length; the tree key limit may lower it further
/// for small block sizes.
pub const MAX_NAME_LEN: usize = 255;

const CURSOR_BATCH: usize = 128;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// LRU cache capacity in blocks.
    pub cache_blocks: usize,
    /// Seal blocks with AES-256-GCM when set.
    pub key: Option<KeyMaterial>,
    pub writer_policy: WriterPolicy,
    pub tree: TreeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_blocks: 256,
            key: None,
            writer_policy: WriterPolicy::default(),
            tree: TreeConfig::default(),
        }
    }
}

impl EngineConfig {
    fn mode(&self) -> CodecMode {
        self.key.clone().map_or(CodecMode::Plain, CodecMode::Sealed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub id: FileId,
    pub size: u64,
}

/// Outcome of a full-tree verification pass.
#[derive(Debug, Clone, Default)]
pub struct ScrubReport {
    pub tree_nodes: u64,
    pub data_chunks: u64,
    /// One entry per unreadable or malformed chunk.
    pub errors: Vec<String>,
}

impl ScrubReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub files: u64,
    pub manager: ManagerStats,
}

fn corrupt_record(what: &str, err: &ParseError) -> EngineError {
    EngineError::Format(format!("corrupt {what} record: {err}"))
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| EngineError::Format("value does not fit usize".to_owned()))
}

fn to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

pub struct Engine<D: BlockDevice> {
    mgr: TxnManager<BlockCache<D>>,
    tree_cfg: TreeConfig,
}

impl<D: BlockDevice> Engine<D> {
    fn layer(dev: D, config: &EngineConfig) -> Result<CodecDevice<BlockCache<D>>> {
        CodecDevice::new(BlockCache::new(dev, config.cache_blocks)?, config.mode())
    }

    /// Initialize an empty filesystem on `dev`.
    pub fn format(dev: D, config: &EngineConfig) -> Result<()> {
        config.tree.validate()?;
        TxnManager::format(&Self::layer(dev, config)?)
    }

    /// Open a formatted filesystem.
    pub fn open(dev: D, config: &EngineConfig) -> Result<(Self, RecoveryReport)> {
        config.tree.validate()?;
        let (mgr, report) = TxnManager::open(
            Self::layer(dev, config)?,
            TxnOptions {
                writer_policy: config.writer_policy,
            },
        )?;
        Ok((
            Self {
                mgr,
                tree_cfg: config.tree,
            },
            report,
        ))
    }

    /// Underlying transaction manager, for snapshots and statistics.
    #[must_use]
    pub fn manager(&self) -> &TxnManager<BlockCache<D>> {
        &self.mgr
    }

    fn chunk_size(&self) -> u64 {
        to_u64(self.mgr.payload_len())
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        let limit = MAX_NAME_LEN.min(max_key_len(self.mgr.payload_len()).saturating_sub(1));
        if name.is_empty() || name.len() > limit || name.contains('\0') {
            return Err(EngineError::Format(format!(
                "invalid file name (must be 1..={limit} bytes, no NUL): {name:?}"
            )));
        }
        Ok(())
    }

    fn resolve<S: NodeSource>(src: &S, root: Option<BlockAddress>, name: &str) -> Result<FileId> {
        let raw = lookup(src, root, &keys::name_key(name))?
            .ok_or_else(|| EngineError::NotFound(name.to_owned()))?;
        records::decode_file_id(&raw).map_err(|e| corrupt_record("file id", &e))
    }

    fn load_inode<S: NodeSource>(
        src: &S,
        root: Option<BlockAddress>,
        id: FileId,
    ) -> Result<Inode> {
        let raw = lookup(src, root, &keys::inode_key(id))?
            .ok_or_else(|| EngineError::NotFound(format!("file id {id}")))?;
        Inode::decode(&raw).map_err(|e| corrupt_record("inode", &e))
    }

    fn load_chunk<S: NodeSource>(
        src: &S,
        root: Option<BlockAddress>,
        id: FileId,
        index: u64,
    ) -> Result<Option<ChunkRecord>> {
        lookup(src, root, &keys::chunk_key(id, index))?
            .map(|raw| ChunkRecord::decode(&raw).map_err(|e| corrupt_record("chunk", &e)))
            .transpose()
    }

    /// Create an empty file. Fails if the name is taken.
    pub fn create(&self, name: &str) -> Result<FileId> {
        self.validate_name(name)?;
        let mut txn = self.mgr.begin()?;
        let mut root = txn.root();

        if lookup(&txn, root, &keys::name_key(name))?.is_some() {
            return Err(EngineError::AlreadyExists(name.to_owned()));
        }

        let next = match lookup(&txn, root, &keys::next_file_id_key())? {
            Some(raw) => records::decode_file_id(&raw)
                .map_err(|e| corrupt_record("next file id", &e))?
                .0,
            None => 1,
        };
        let id = FileId(next);

        root = Some(insert(
            &mut txn,
            &self.tree_cfg,
            root,
            &keys::next_file_id_key(),
            &records::encode_file_id(FileId(next + 1)),
        )?);
        root = Some(insert(
            &mut txn,
            &self.tree_cfg,
            root,
            &keys::name_key(name),
            &records::encode_file_id(id),
        )?);
        root = Some(insert(
            &mut txn,
            &self.tree_cfg,
            root,
            &keys::inode_key(id),
            &Inode { size: 0 }.encode(),
        )?);

        txn.set_root(root);
        txn.commit()?;
        info!(target: "cowfs::core", name, id = id.0, "file created");
        Ok(id)
    }

    /// Look up a file by name against the committed state.
    pub fn open_by_name(&self, name: &str) -> Result<FileId> {
        let (root, _) = self.mgr.current();
        Self::resolve(self.mgr.device(), root, name)
    }

    pub fn stat(&self, id: FileId) -> Result<FileStat> {
        let (root, _) = self.mgr.current();
        let inode = Self::load_inode(self.mgr.device(), root, id)?;
        Ok(FileStat {
            id,
            size: inode.size,
        })
    }

    /// All files, in name order.
    pub fn list(&self) -> Result<Vec<(String, FileId)>> {
        let (root, _) = self.mgr.current();
        let (lo, hi) = keys::name_range();
        let mut cursor = RangeCursor::new(root, &lo, Some(&hi), CURSOR_BATCH);
        let mut out = Vec::new();
        loop {
            let batch = cursor.next_batch(self.mgr.device())?;
            if batch.is_empty() {
                break;
            }
            for (key, value) in batch {
                let name_bytes = keys::name_from_key(&key)
                    .ok_or_else(|| EngineError::Format("name key outside name range".to_owned()))?;
                let name = String::from_utf8(name_bytes.to_vec())
                    .map_err(|_| EngineError::Format("file name is not UTF-8".to_owned()))?;
                let id = records::decode_file_id(&value)
                    .map_err(|e| corrupt_record("file id", &e))?;
                out.push((name, id));
            }
        }
        Ok(out)
    }

    /// Write `data` at `offset`, extending the file as needed. One atomic
    /// transaction regardless of how many chunks are touched.
    pub fn write(&self, id: FileId, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let chunk_size = self.chunk_size();
        let mut txn = self.mgr.begin()?;
        let mut root = txn.root();
        let mut inode = Self::load_inode(&txn, root, id)?;

        let end = offset
            .checked_add(to_u64(data.len()))
            .ok_or_else(|| EngineError::Format("write range overflows".to_owned()))?;
        let mut cursor = offset;
        let mut data_off = 0_usize;
        while cursor < end {
            let index = cursor / chunk_size;
            let in_chunk = to_usize(cursor % chunk_size)?;
            let take = to_usize((chunk_size - to_u64(in_chunk)).min(end - cursor))?;

            let old = Self::load_chunk(&txn, root, id, index)?;
            let mut payload = match &old {
                Some(rec) => txn.read_payload(rec.addr)?,
                None => vec![0_u8; to_usize(chunk_size)?],
            };
            payload.resize(to_usize(chunk_size)?, 0);
            payload[in_chunk..in_chunk + take]
                .copy_from_slice(&data[data_off..data_off + take]);

            if let Some(rec) = &old {
                txn.free_block(rec.addr)?;
            }
            let addr = txn.allocate_block()?;
            txn.stage_payload(addr, payload)?;

            let valid = to_u64(in_chunk + take).max(old.map_or(0, |r| u64::from(r.len)));
            let record = ChunkRecord {
                addr,
                len: u32::try_from(valid.min(chunk_size))
                    .map_err(|_| EngineError::Format("chunk length overflows u32".to_owned()))?,
            };
            root = Some(insert(
                &mut txn,
                &self.tree_cfg,
                root,
                &keys::chunk_key(id, index),
                &record.encode(),
            )?);

            cursor += to_u64(take);
            data_off += take;
        }

        if end > inode.size {
            inode.size = end;
        }
        root = Some(insert(
            &mut txn,
            &self.tree_cfg,
            root,
            &keys::inode_key(id),
            &inode.encode(),
        )?);
        txn.set_root(root);
        let generation = txn.commit()?;
        debug!(
            target: "cowfs::core",
            id = id.0,
            offset,
            len = data.len(),
            generation = generation.0,
            "write"
        );
        Ok(())
    }

    /// Read up to `len` bytes at `offset` from the committed state. Returns
    /// fewer bytes at end of file, and an empty vector past it.
    pub fn read(&self, id: FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (root, _) = self.mgr.current();
        self.read_from(self.mgr.device(), root, id, offset, len)
    }

    /// Read from a pinned snapshot instead of the live state.
    pub fn read_at_snapshot(
        &self,
        snapshot: SnapshotId,
        name: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let (root, _) = self.mgr.snapshot_root(snapshot)?;
        let id = Self::resolve(self.mgr.device(), root, name)?;
        self.read_from(self.mgr.device(), root, id, offset, len)
    }

    fn read_from<S: NodeSource>(
        &self,
        src: &S,
        root: Option<BlockAddress>,
        id: FileId,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let inode = Self::load_inode(src, root, id)?;
        if offset >= inode.size || len == 0 {
            return Ok(Vec::new());
        }
        let chunk_size = self.chunk_size();
        let end = inode.size.min(
            offset
                .checked_add(to_u64(len))
                .ok_or_else(|| EngineError::Format("read range overflows".to_owned()))?,
        );
        let mut out = vec![0_u8; to_usize(end - offset)?];

        let mut cursor = offset;
        while cursor < end {
            let index = cursor / chunk_size;
            let in_chunk = to_usize(cursor % chunk_size)?;
            let take = to_usize((chunk_size - to_u64(in_chunk)).min(end - cursor))?;

            // Absent chunks are sparse holes and stay zero.
            if let Some(rec) = Self::load_chunk(src, root, id, index)? {
                let payload = src.read_payload(rec.addr)?;
                let out_at = to_usize(cursor - offset)?;
                out[out_at..out_at + take].copy_from_slice(&payload[in_chunk..in_chunk + take]);
            }
            cursor += to_u64(take);
        }
        Ok(out)
    }

    /// Set the file size. Shrinking frees whole chunks beyond the cut and
    /// zeroes the tail of the boundary chunk so the truncated bytes can
    /// never resurface; growing just extends the sparse region.
    pub fn truncate(&self, id: FileId, new_size: u64) -> Result<()> {
        let chunk_size = self.chunk_size();
        let mut txn = self.mgr.begin()?;
        let mut root = txn.root();
        let mut inode = Self::load_inode(&txn, root, id)?;

        if new_size < inode.size {
            let first_dead = new_size.div_ceil(chunk_size);
            let lo = keys::chunk_key(id, first_dead);
            let (_, hi) = keys::chunk_range(id);
            let dead = collect_range(&txn, root, &lo, &hi)?;
            for (key, value) in dead {
                let rec =
                    ChunkRecord::decode(&value).map_err(|e| corrupt_record("chunk", &e))?;
                let (new_root, _) = remove(&mut txn, &self.tree_cfg, root, &key)?;
                root = new_root;
                txn.free_block(rec.addr)?;
            }

            let keep = to_usize(new_size % chunk_size)?;
            if keep > 0 {
                let tail_index = new_size / chunk_size;
                if let Some(rec) = Self::load_chunk(&txn, root, id, tail_index)? {
                    let mut payload = txn.read_payload(rec.addr)?;
                    payload.resize(to_usize(chunk_size)?, 0);
                    payload[keep..].fill(0);
                    txn.free_block(rec.addr)?;
                    let addr = txn.allocate_block()?;
                    txn.stage_payload(addr, payload)?;
                    let record = ChunkRecord {
                        addr,
                        len: u32::try_from(keep).map_err(|_| {
                            EngineError::Format("chunk length overflows u32".to_owned())
                        })?,
                    };
                    root = Some(insert(
                        &mut txn,
                        &self.tree_cfg,
                        root,
                        &keys::chunk_key(id, tail_index),
                        &record.encode(),
                    )?);
                }
            }
        }

        inode.size = new_size;
        root = Some(insert(
            &mut txn,
            &self.tree_cfg,
            root,
            &keys::inode_key(id),
            &inode.encode(),
        )?);
        txn.set_root(root);
        txn.commit()?;
        debug!(target: "cowfs::core", id = id.0, new_size, "truncate");
        Ok(())
    }

    /// Rename a file. Fails if the target name exists.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.validate_name(new)?;
        let mut txn = self.mgr.begin()?;
        let mut root = txn.root();

        let id = Self::resolve(&txn, root, old)?;
        if lookup(&txn, root, &keys::name_key(new))?.is_some() {
            return Err(EngineError::AlreadyExists(new.to_owned()));
        }

        let (new_root, _) = remove(&mut txn, &self.tree_cfg, root, &keys::name_key(old))?;
        root = new_root;
        root = Some(insert(
            &mut txn,
            &self.tree_cfg,
            root,
            &keys::name_key(new),
            &records::encode_file_id(id),
        )?);
        txn.set_root(root);
        txn.commit()?;
        info!(target: "cowfs::core", old, new, id = id.0, "file renamed");
        Ok(())
    }

    /// Delete a file, freeing its chunks, inode, and name binding.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut txn = self.mgr.begin()?;
        let mut root = txn.root();
        let id = Self::resolve(&txn, root, name)?;

        let (lo, hi) = keys::chunk_range(id);
        let chunks = collect_range(&txn, root, &lo, &hi)?;
        let freed = chunks.len();
        for (key, value) in chunks {
            let rec = ChunkRecord::decode(&value).map_err(|e| corrupt_record("chunk", &e))?;
            let (new_root, _) = remove(&mut txn, &self.tree_cfg, root, &key)?;
            root = new_root;
            txn.free_block(rec.addr)?;
        }
        let (new_root, _) = remove(&mut txn, &self.tree_cfg, root, &keys::inode_key(id))?;
        root = new_root;
        let (new_root, _) = remove(&mut txn, &self.tree_cfg, root, &keys::name_key(name))?;
        root = new_root;

        txn.set_root(root);
        txn.commit()?;
        info!(target: "cowfs::core", name, id = id.0, chunks = freed, "file removed");
        Ok(())
    }

    /// Pin the current committed state for later reads.
    pub fn snapshot(&self) -> SnapshotId {
        self.mgr.snapshot()
    }

    /// Drop a snapshot, reclaiming blocks it alone was pinning.
    pub fn release_snapshot(&self, snapshot: SnapshotId) -> Result<u64> {
        self.mgr.release_snapshot(snapshot)
    }

    /// Flush the device.
    pub fn sync(&self) -> Result<()> {
        self.mgr.device().sync()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            files: to_u64(self.list()?.len()),
            manager: self.mgr.stats(),
        })
    }

    /// Verify every reachable block: walk the whole tree (node reads go
    /// through the codec) and read back every data chunk.
    ///
    /// A corrupt tree node aborts the walk with an error since descent
    /// cannot continue past it; unreadable chunks are collected in the
    /// report instead.
    pub fn scrub(&self) -> Result<ScrubReport> {
        let (root, _) = self.mgr.current();
        let dev = self.mgr.device();
        let mut data_chunks = 0_u64;
        let mut errors = Vec::new();

        let tree_nodes = walk(dev, root, &mut |_, node| {
            if let Node::Leaf { entries } = node {
                for (key, value) in entries {
                    if key.first() != Some(&keys::TAG_CHUNK) {
                        continue;
                    }
                    data_chunks += 1;
                    match ChunkRecord::decode(value) {
                        Ok(rec) => {
                            if let Err(e) = dev.read_payload(rec.addr) {
                                errors.push(format!("chunk at block {}: {e}", rec.addr));
                            }
                        }
                        Err(e) => errors.push(format!("chunk record under {key:02x?}: {e}")),
                    }
                }
            }
            Ok(())
        })?;

        let report = ScrubReport {
            tree_nodes,
            data_chunks,
            errors,
        };
        info!(
            target: "cowfs::core",
            nodes = report.tree_nodes,
            chunks = report.data_chunks,
            errors = report.errors.len(),
            "scrub complete"
        );
        Ok(report)
    }
}

/// Drain a key range into memory. Used before structural mutations, since
/// a cursor cannot outlive a changing root.
fn collect_range<S: NodeSource>(
    src: &S,
    root: Option<BlockAddress>,
    lo: &[u8],
    hi: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = RangeCursor::new(root, lo, Some(hi), CURSOR_BATCH);
    let mut out = Vec::new();
    loop {
        let batch = cursor.next_batch(src)?;
        if batch.is_empty() {
            return Ok(out);
        }
        out.extend(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowfs_block::{ByteBlockDevice, MemByteDevice};
    use cowfs_types::BlockSize;
    use std::sync::Arc;

    type MemEngine = Engine<ByteBlockDevice<Arc<MemByteDevice>>>;

    fn mem_engine(blocks: usize) -> (Arc<MemByteDevice>, MemEngine) {
        let mem = Arc::new(MemByteDevice::new(4096 * blocks));
        let dev = ByteBlockDevice::new(Arc::clone(&mem), BlockSize::new(4096).unwrap())
            .expect("device");
        let config = EngineConfig::default();
        Engine::format(dev, &config).expect("format");

        let dev = ByteBlockDevice::new(Arc::clone(&mem), BlockSize::new(4096).unwrap())
            .expect("device");
        let (engine, report) = Engine::open(dev, &config).expect("open");
        assert!(report.slot_errors.is_empty());
        (mem, engine)
    }

    #[test]
    fn create_open_stat() {
        let (_, engine) = mem_engine(128);
        let id = engine.create("a.txt").expect("create");
        assert_eq!(engine.open_by_name("a.txt").expect("open"), id);
        assert_eq!(
            engine.stat(id).expect("stat"),
            FileStat { id, size: 0 }
        );
        assert!(matches!(
            engine.open_by_name("missing").unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn duplicate_create_rejected_and_ids_advance() {
        let (_, engine) = mem_engine(128);
        let a = engine.create("a").expect("create");
        assert!(matches!(
            engine.create("a").unwrap_err(),
            EngineError::AlreadyExists(_)
        ));
        let b = engine.create("b").expect("create");
        assert!(b.0 > a.0);
    }

    #[test]
    fn list_is_name_ordered() {
        let (_, engine) = mem_engine(128);
        for name in ["zeta", "alpha", "mid"] {
            engine.create(name).expect("create");
        }
        let names: Vec<String> = engine.list().expect("list").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn name_validation() {
        let (_, engine) = mem_engine(128);
        assert!(engine.create("").is_err());
        assert!(engine.create("has\0nul").is_err());
        assert!(engine.create(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(engine.create(&"x".repeat(200)).is_ok());
    }

    #[test]
    fn small_write_read_round_trip() {
        let (_, engine) = mem_engine(128);
        let id = engine.create("f").expect("create");
        engine.write(id, 0, b"hello world").expect("write");
        assert_eq!(engine.read(id, 0, 64).expect("read"), b"hello world");
        assert_eq!(engine.read(id, 6, 5).expect("read"), b"world");
        assert_eq!(engine.read(id, 100, 10).expect("read"), Vec::<u8>::new());
        assert_eq!(engine.stat(id).expect("stat").size, 11);
    }

    #[test]
    fn sparse_regions_read_as_zeros() {
        let (_, engine) = mem_engine(128);
        let id = engine.create("sparse").expect("create");
        engine.write(id, 10_000, b"tail").expect("write");

        assert_eq!(engine.stat(id).expect("stat").size, 10_004);
        let gap = engine.read(id, 0, 10_000).expect("read");
        assert_eq!(gap.len(), 10_000);
        assert!(gap.iter().all(|b| *b == 0));
        assert_eq!(engine.read(id, 10_000, 10).expect("read"), b"tail");
    }

    #[test]
    fn overwrite_within_chunk() {
        let (_, engine) = mem_engine(128);
        let id = engine.create("f").expect("create");
        engine.write(id, 0, &[0xAA; 100]).expect("write");
        engine.write(id, 50, &[0xBB; 10]).expect("overwrite");

        let data = engine.read(id, 0, 100).expect("read");
        assert_eq!(&data[..50], &[0xAA; 100][..50]);
        assert_eq!(&data[50..60], &[0xBB; 10]);
        assert_eq!(&data[60..], &[0xAA; 100][60..]);
    }

    #[test]
    fn truncate_then_extend_does_not_resurrect_data() {
        let (_, engine) = mem_engine(128);
        let id = engine.create("f").expect("create");
        engine.write(id, 0, &[0xFF; 3000]).expect("write");
        engine.truncate(id, 1000).expect("truncate");
        assert_eq!(engine.stat(id).expect("stat").size, 1000);

        engine.truncate(id, 3000).expect("extend");
        let data = engine.read(id, 0, 3000).expect("read");
        assert_eq!(&data[..1000], &[0xFF; 1000]);
        assert!(data[1000..].iter().all(|b| *b == 0), "truncated bytes stay gone");
    }

    #[test]
    fn truncate_frees_chunks() {
        let (_, engine) = mem_engine(256);
        let id = engine.create("big").expect("create");
        engine.write(id, 0, &vec![7_u8; 4088 * 10]).expect("write");
        let free_before = engine.manager().stats().alloc.free;

        engine.truncate(id, 0).expect("truncate");
        assert!(engine.manager().stats().alloc.free > free_before);
        assert_eq!(engine.read(id, 0, 10).expect("read"), Vec::<u8>::new());
    }

    #[test]
    fn rename_and_remove() {
        let (_, engine) = mem_engine(128);
        let id = engine.create("old").expect("create");
        engine.write(id, 0, b"data").expect("write");
        engine.create("taken").expect("create");

        assert!(matches!(
            engine.rename("old", "taken").unwrap_err(),
            EngineError::AlreadyExists(_)
        ));
        engine.rename("old", "new").expect("rename");
        assert!(engine.open_by_name("old").is_err());
        assert_eq!(engine.open_by_name("new").expect("open"), id);
        assert_eq!(engine.read(id, 0, 10).expect("read"), b"data");

        engine.remove("new").expect("remove");
        assert!(engine.open_by_name("new").is_err());
        assert!(engine.stat(id).is_err());
        assert!(matches!(
            engine.remove("new").unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn stats_count_files() {
        let (_, engine) = mem_engine(128);
        engine.create("a").expect("create");
        engine.create("b").expect("create");
        let stats = engine.stats().expect("stats");
        assert_eq!(stats.files, 2);
        assert!(stats.manager.counters.commits >= 2);
    }

    #[test]
    fn scrub_clean_tree() {
        let (_, engine) = mem_engine(128);
        let id = engine.create("f").expect("create");
        engine.write(id, 0, &[1_u8; 9000]).expect("write");

        let report = engine.scrub().expect("scrub");
        assert!(report.is_clean());
        assert_eq!(report.data_chunks, 3);
        assert!(report.tree_nodes >= 1);
    }
}
