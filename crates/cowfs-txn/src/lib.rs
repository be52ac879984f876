#![forbid(unsafe_code)]
//! Transaction manager: single-writer CoW transactions with a
//! crash-consistent commit protocol.
//!
//! ## Commit protocol
//!
//! A commit at generation G durably writes, in order, with a sync barrier
//! after each phase:
//!
//! 1. all staged data and tree blocks (at freshly allocated addresses),
//! 2. the allocator bitmap (at a freshly allocated run),
//! 3. the superblock for G into slot `G % 2`.
//!
//! Until phase 3 is durable the previous superblock and everything it
//! references are untouched on disk, so a crash at any point yields either
//! the old state or the new state, never a mixture. A failure before the
//! superblock write aborts cleanly; a failure during or after it leaves
//! durability uncertain, so the manager poisons itself and refuses further
//! writers until reopen (reads stay available).
//!
//! ## Writers and readers
//!
//! One writer at a time. A second `begin` either fails with `Busy` or
//! blocks, per [`WriterPolicy`]. Readers never block: they descend from a
//! committed root, and CoW guarantees every block reachable from it is
//! immutable until reclaimed.
//!
//! ## Snapshots
//!
//! A snapshot pins a committed root. Blocks freed at generation G move to
//! the allocator's deferred list and are reclaimed only once every live
//! snapshot is at generation >= G.

mod superblock;

pub use superblock::{SUPERBLOCK_MAGIC, Superblock};

use cowfs_alloc::{AllocStats, ExtentAllocator};
use cowfs_block::BlockDevice;
use cowfs_codec::CodecDevice;
use cowfs_error::{EngineError, Result};
use cowfs_tree::{NodeSource, TreeContext};
use cowfs_types::{BlockAddress, FIRST_ALLOCATABLE, Generation, SnapshotId, TxnId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

/// What `begin` does when another writer is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterPolicy {
    /// Return [`EngineError::Busy`] immediately.
    #[default]
    Fail,
    /// Block until the active writer commits or aborts.
    Wait,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    pub writer_policy: WriterPolicy,
}

/// Outcome of superblock recovery at open.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Generation the filesystem resumed at.
    pub generation: Generation,
    /// Slot the adopted superblock was read from.
    pub active_slot: u64,
    /// Generation of the other slot, when it was also valid.
    pub stale_generation: Option<Generation>,
    /// Human-readable reasons for each rejected slot.
    pub slot_errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxnCounters {
    pub commits: u64,
    pub aborts: u64,
    pub snapshots_taken: u64,
    pub blocks_reclaimed: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerStats {
    pub generation: Generation,
    pub root: Option<BlockAddress>,
    pub counters: TxnCounters,
    pub alloc: AllocStats,
    pub live_snapshots: usize,
}

#[derive(Debug, Clone, Copy)]
struct CommittedState {
    generation: Generation,
    root: Option<BlockAddress>,
    alloc_root: BlockAddress,
}

#[derive(Debug, Clone, Copy)]
struct SnapshotEntry {
    generation: Generation,
    root: Option<BlockAddress>,
}

#[derive(Debug, Default)]
struct SnapshotRegistry {
    next: u64,
    live: BTreeMap<SnapshotId, SnapshotEntry>,
}

/// Blocks needed to persist the allocator bitmap.
fn bitmap_run_blocks(block_count: u64, payload_len: usize) -> u64 {
    let payload = u64::try_from(payload_len).unwrap_or(u64::MAX);
    block_count.div_ceil(8).div_ceil(payload).max(1)
}

pub struct TxnManager<D: BlockDevice> {
    dev: CodecDevice<D>,
    block_size: u32,
    policy: WriterPolicy,
    allocator: Mutex<ExtentAllocator>,
    state: RwLock<CommittedState>,
    /// True while a write transaction is open.
    gate: Mutex<bool>,
    gate_cond: Condvar,
    snapshots: Mutex<SnapshotRegistry>,
    poisoned: AtomicBool,
    next_txn: AtomicU64,
    counters: Mutex<TxnCounters>,
}

impl<D: BlockDevice> core::fmt::Debug for TxnManager<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TxnManager")
            .field("block_size", &self.block_size)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> TxnManager<D> {
    /// Initialize an empty filesystem on `dev`.
    ///
    /// Writes the allocator bitmap and two valid superblocks (generations 0
    /// and 1, one per slot) so recovery always finds at least one intact
    /// slot, then syncs once.
    pub fn format(dev: &CodecDevice<D>) -> Result<()> {
        let block_count = dev.block_count();
        if block_count < 8 {
            return Err(EngineError::Format(format!(
                "device too small to format: {block_count} blocks"
            )));
        }
        if dev.payload_len() < Superblock::ENCODED_LEN {
            return Err(EngineError::Format(
                "block payload too small for a superblock".to_owned(),
            ));
        }

        let mut alloc = ExtentAllocator::new(block_count, FIRST_ALLOCATABLE)?;
        let run = bitmap_run_blocks(block_count, dev.payload_len());
        let alloc_root = alloc.allocate(run)?;
        write_bitmap(dev, &alloc.to_bitmap(), alloc_root, run, 1)?;

        let block_size = dev.device().block_size();
        let sealed = dev.codec().mode().is_sealed();
        for gen in [0_u64, 1] {
            let sb = Superblock {
                generation: Generation(gen),
                root: None,
                alloc_root,
                block_size,
                sealed,
            };
            dev.write_payload(BlockAddress(sb.slot()), sb.generation.epoch(), &sb.encode())?;
        }
        dev.sync()?;
        info!(target: "cowfs::txn", block_count, block_size, sealed, "formatted filesystem");
        Ok(())
    }

    /// Open a formatted filesystem, recovering from the superblock slots.
    ///
    /// Both slots are read; the highest valid generation wins. A slot that
    /// fails its checksum, authentication, or parse is reported in the
    /// [`RecoveryReport`] and ignored. Both slots invalid is fatal.
    pub fn open(dev: CodecDevice<D>, options: TxnOptions) -> Result<(Self, RecoveryReport)> {
        let block_count = dev.block_count();
        let mut slot_errors = Vec::new();
        let mut candidates: Vec<(u64, Superblock)> = Vec::new();

        for slot in [cowfs_types::SUPERBLOCK_SLOT_A, cowfs_types::SUPERBLOCK_SLOT_B] {
            let parsed = dev
                .read_payload(BlockAddress(slot))
                .and_then(|payload| {
                    Superblock::decode(&payload).map_err(|e| EngineError::CorruptBlock {
                        address: slot,
                        detail: e.to_string(),
                    })
                });
            match parsed {
                Ok(sb) if sb.slot() != slot => {
                    slot_errors.push(format!(
                        "slot {slot}: generation {} belongs in slot {}",
                        sb.generation,
                        sb.slot()
                    ));
                }
                Ok(sb) => candidates.push((slot, sb)),
                Err(e) => slot_errors.push(format!("slot {slot}: {e}")),
            }
        }

        candidates.sort_by_key(|(_, sb)| sb.generation);
        let Some((active_slot, sb)) = candidates.last().copied() else {
            return Err(EngineError::UnrecoverableFilesystem(format!(
                "no valid superblock: {}",
                slot_errors.join("; ")
            )));
        };
        let stale_generation = (candidates.len() == 2).then(|| candidates[0].1.generation);

        if sb.block_size != dev.device().block_size() {
            return Err(EngineError::Format(format!(
                "block size mismatch: superblock={} device={}",
                sb.block_size,
                dev.device().block_size()
            )));
        }
        if sb.sealed != dev.codec().mode().is_sealed() {
            return Err(EngineError::Format(format!(
                "sealing mismatch: superblock sealed={} codec sealed={}",
                sb.sealed,
                dev.codec().mode().is_sealed()
            )));
        }

        let run = bitmap_run_blocks(block_count, dev.payload_len());
        let mut bitmap = Vec::with_capacity(ExtentAllocator::bitmap_len_bytes(block_count));
        for i in 0..run {
            let addr = sb
                .alloc_root
                .checked_add(i)
                .ok_or_else(|| EngineError::Format("bitmap run overflows".to_owned()))?;
            bitmap.extend_from_slice(&dev.read_payload(addr)?);
        }
        let allocator = ExtentAllocator::from_bitmap(block_count, FIRST_ALLOCATABLE, &bitmap)?;

        let report = RecoveryReport {
            generation: sb.generation,
            active_slot,
            stale_generation,
            slot_errors,
        };
        info!(
            target: "cowfs::txn",
            generation = sb.generation.0,
            slot = active_slot,
            rejected_slots = report.slot_errors.len(),
            "opened filesystem"
        );

        Ok((
            Self {
                dev,
                block_size: sb.block_size,
                policy: options.writer_policy,
                allocator: Mutex::new(allocator),
                state: RwLock::new(CommittedState {
                    generation: sb.generation,
                    root: sb.root,
                    alloc_root: sb.alloc_root,
                }),
                gate: Mutex::new(false),
                gate_cond: Condvar::new(),
                snapshots: Mutex::new(SnapshotRegistry::default()),
                poisoned: AtomicBool::new(false),
                next_txn: AtomicU64::new(1),
                counters: Mutex::new(TxnCounters::default()),
            },
            report,
        ))
    }

    /// The committed root and generation.
    #[must_use]
    pub fn current(&self) -> (Option<BlockAddress>, Generation) {
        let state = self.state.read();
        (state.root, state.generation)
    }

    /// Codec-layer device for committed-state reads.
    #[must_use]
    pub fn device(&self) -> &CodecDevice<D> {
        &self.dev
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.dev.payload_len()
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Start a write transaction.
    ///
    /// Honors the configured [`WriterPolicy`] when a writer is already
    /// active. Fails with `ReadOnly` after an uncertain commit failure.
    pub fn begin(&self) -> Result<Transaction<'_, D>> {
        {
            let mut active = self.gate.lock();
            if *active {
                match self.policy {
                    WriterPolicy::Fail => {
                        debug!(target: "cowfs::txn", "writer busy");
                        return Err(EngineError::Busy);
                    }
                    WriterPolicy::Wait => {
                        while *active {
                            self.gate_cond.wait(&mut active);
                        }
                    }
                }
            }
            *active = true;
        }
        if self.is_poisoned() {
            self.release_writer();
            return Err(EngineError::ReadOnly);
        }

        let state = *self.state.read();
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        debug!(
            target: "cowfs::txn",
            txn = id.0,
            base_generation = state.generation.0,
            "begin"
        );
        Ok(Transaction {
            mgr: self,
            id,
            root: state.root,
            base_generation: state.generation,
            commit_generation: state.generation.next(),
            staged: BTreeMap::new(),
            finished: false,
        })
    }

    /// Pin the current committed state.
    pub fn snapshot(&self) -> SnapshotId {
        let state = *self.state.read();
        let mut registry = self.snapshots.lock();
        let id = SnapshotId(registry.next);
        registry.next += 1;
        registry.live.insert(
            id,
            SnapshotEntry {
                generation: state.generation,
                root: state.root,
            },
        );
        drop(registry);
        self.counters.lock().snapshots_taken += 1;
        info!(
            target: "cowfs::txn",
            snapshot = id.0,
            generation = state.generation.0,
            "snapshot taken"
        );
        id
    }

    /// Root and generation pinned by `id`.
    pub fn snapshot_root(&self, id: SnapshotId) -> Result<(Option<BlockAddress>, Generation)> {
        let registry = self.snapshots.lock();
        let entry = registry
            .live
            .get(&id)
            .ok_or(EngineError::SnapshotNotFound(id.0))?;
        Ok((entry.root, entry.generation))
    }

    /// Drop a snapshot, reclaiming any deferred blocks it was pinning.
    pub fn release_snapshot(&self, id: SnapshotId) -> Result<u64> {
        let min = {
            let mut registry = self.snapshots.lock();
            if registry.live.remove(&id).is_none() {
                return Err(EngineError::SnapshotNotFound(id.0));
            }
            registry.live.values().map(|e| e.generation).min()
        };
        let reclaimed = self.allocator.lock().reclaim(min);
        self.counters.lock().blocks_reclaimed += reclaimed;
        info!(target: "cowfs::txn", snapshot = id.0, reclaimed, "snapshot released");
        Ok(reclaimed)
    }

    fn min_live_snapshot(&self) -> Option<Generation> {
        self.snapshots.lock().live.values().map(|e| e.generation).min()
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let state = *self.state.read();
        ManagerStats {
            generation: state.generation,
            root: state.root,
            counters: *self.counters.lock(),
            alloc: self.allocator.lock().stats(),
            live_snapshots: self.snapshots.lock().live.len(),
        }
    }

    fn release_writer(&self) {
        let mut active = self.gate.lock();
        *active = false;
        self.gate_cond.notify_one();
    }
}

enum CommitFailure {
    /// Nothing durable changed; safe to roll back.
    Clean(EngineError),
    /// Superblock durability unknown; the manager must poison itself.
    Uncertain(EngineError),
}

/// An open write transaction.
///
/// Reads through a transaction see its own staged writes before the
/// committed image. Dropping a transaction without committing aborts it.
pub struct Transaction<'m, D: BlockDevice> {
    mgr: &'m TxnManager<D>,
    id: TxnId,
    root: Option<BlockAddress>,
    base_generation: Generation,
    commit_generation: Generation,
    staged: BTreeMap<BlockAddress, Vec<u8>>,
    finished: bool,
}

impl<D: BlockDevice> core::fmt::Debug for Transaction<'_, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("base_generation", &self.base_generation)
            .field("commit_generation", &self.commit_generation)
            .field("staged_blocks", &self.staged.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> Transaction<'_, D> {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Tree root as this transaction sees it.
    #[must_use]
    pub fn root(&self) -> Option<BlockAddress> {
        self.root
    }

    pub fn set_root(&mut self, root: Option<BlockAddress>) {
        self.root = root;
    }

    /// Generation this transaction will commit as.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.commit_generation
    }

    #[must_use]
    pub fn base_generation(&self) -> Generation {
        self.base_generation
    }

    fn stage(&mut self, addr: BlockAddress, payload: Vec<u8>) -> Result<()> {
        if payload.len() > self.mgr.dev.payload_len() {
            return Err(EngineError::Format(format!(
                "staged payload of {} bytes exceeds capacity {}",
                payload.len(),
                self.mgr.dev.payload_len()
            )));
        }
        self.staged.insert(addr, payload);
        Ok(())
    }

    /// Commit: push all staged state durable and publish the new root.
    pub fn commit(mut self) -> Result<Generation> {
        self.finished = true;
        let gen = self.commit_generation;
        match self.commit_inner(gen) {
            Ok(()) => {
                self.mgr.counters.lock().commits += 1;
                self.mgr.release_writer();
                info!(
                    target: "cowfs::txn",
                    txn = self.id.0,
                    generation = gen.0,
                    staged = self.staged.len(),
                    "commit"
                );
                Ok(gen)
            }
            Err(CommitFailure::Clean(e)) => {
                self.mgr.allocator.lock().abort();
                self.mgr.counters.lock().aborts += 1;
                self.mgr.release_writer();
                debug!(target: "cowfs::txn", txn = self.id.0, error = %e, "commit rolled back");
                Err(e)
            }
            Err(CommitFailure::Uncertain(e)) => {
                self.mgr.poisoned.store(true, Ordering::Release);
                self.mgr.release_writer();
                error!(
                    target: "cowfs::txn",
                    txn = self.id.0,
                    error = %e,
                    "superblock durability uncertain; manager is now read-only"
                );
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self, gen: Generation) -> std::result::Result<(), CommitFailure> {
        let epoch = gen.epoch();
        let dev = &self.mgr.dev;
        let old_alloc_root = self.mgr.state.read().alloc_root;
        let block_count = dev.block_count();
        let run = bitmap_run_blocks(block_count, dev.payload_len());

        // Phase 1: staged data and tree blocks.
        for (addr, payload) in &self.staged {
            dev.write_payload(*addr, epoch, payload)
                .map_err(CommitFailure::Clean)?;
        }
        dev.sync().map_err(CommitFailure::Clean)?;

        // Phase 2: allocator bitmap at a fresh run. The bitmap serializes
        // the as-if-committed view, which includes its own new run and
        // excludes the old one.
        let alloc_root = {
            let mut alloc = self.mgr.allocator.lock();
            alloc
                .deallocate(old_alloc_root, run)
                .map_err(CommitFailure::Clean)?;
            let alloc_root = alloc.allocate(run).map_err(CommitFailure::Clean)?;
            let bitmap = alloc.to_bitmap();
            drop(alloc);
            write_bitmap(dev, &bitmap, alloc_root, run, epoch).map_err(CommitFailure::Clean)?;
            alloc_root
        };
        dev.sync().map_err(CommitFailure::Clean)?;

        // Phase 3: superblock into the alternate slot. From the write on,
        // failure no longer implies the old state survived intact on disk.
        let sb = Superblock {
            generation: gen,
            root: self.root,
            alloc_root,
            block_size: self.mgr.block_size,
            sealed: dev.codec().mode().is_sealed(),
        };
        dev.write_payload(BlockAddress(sb.slot()), epoch, &sb.encode())
            .map_err(CommitFailure::Uncertain)?;
        dev.sync().map_err(CommitFailure::Uncertain)?;

        // Phase 4: publish in memory and reclaim what no snapshot pins.
        let min_live = self.mgr.min_live_snapshot();
        {
            let mut alloc = self.mgr.allocator.lock();
            alloc.commit(gen);
            let reclaimed = alloc.reclaim(min_live);
            self.mgr.counters.lock().blocks_reclaimed += reclaimed;
        }
        {
            let mut state = self.mgr.state.write();
            state.generation = gen;
            state.root = self.root;
            state.alloc_root = alloc_root;
        }
        Ok(())
    }

    /// Abort: discard staged writes and roll back pending allocator state.
    pub fn abort(mut self) {
        self.finished = true;
        self.rollback();
    }

    fn rollback(&mut self) {
        self.mgr.allocator.lock().abort();
        self.mgr.counters.lock().aborts += 1;
        self.mgr.release_writer();
        debug!(target: "cowfs::txn", txn = self.id.0, "abort");
    }
}

impl<D: BlockDevice> Drop for Transaction<'_, D> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.rollback();
        }
    }
}

impl<D: BlockDevice> NodeSource for Transaction<'_, D> {
    fn payload_len(&self) -> usize {
        self.mgr.dev.payload_len()
    }

    fn read_payload(&self, addr: BlockAddress) -> Result<Vec<u8>> {
        if let Some(payload) = self.staged.get(&addr) {
            let mut full = payload.clone();
            full.resize(self.mgr.dev.payload_len(), 0);
            return Ok(full);
        }
        self.mgr.dev.read_payload(addr)
    }
}

impl<D: BlockDevice> TreeContext for Transaction<'_, D> {
    fn allocate_block(&mut self) -> Result<BlockAddress> {
        self.mgr.allocator.lock().allocate(1)
    }

    fn free_block(&mut self, addr: BlockAddress) -> Result<()> {
        self.mgr.allocator.lock().deallocate(addr, 1)?;
        // An alloc-then-free within this transaction leaves no trace.
        self.staged.remove(&addr);
        Ok(())
    }

    fn stage_payload(&mut self, addr: BlockAddress, payload: Vec<u8>) -> Result<()> {
        self.stage(addr, payload)
    }
}

fn write_bitmap<D: BlockDevice>(
    dev: &CodecDevice<D>,
    bitmap: &[u8],
    alloc_root: BlockAddress,
    run: u64,
    epoch: u32,
) -> Result<()> {
    let payload_len = dev.payload_len();
    for i in 0..run {
        let addr = alloc_root
            .checked_add(i)
            .ok_or_else(|| EngineError::Format("bitmap run overflows".to_owned()))?;
        let start = usize::try_from(i)
            .ok()
            .and_then(|i| i.checked_mul(payload_len))
            .ok_or_else(|| EngineError::Format("bitmap offset overflows".to_owned()))?;
        let end = (start + payload_len).min(bitmap.len());
        let chunk = bitmap.get(start..end).unwrap_or(&[]);
        dev.write_payload(addr, epoch, chunk)?;
    }
    Ok(())
}
