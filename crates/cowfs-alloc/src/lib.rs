#![forbid(unsafe_code)]
//! Block allocation.
//!
//! ## Design
//!
//! Each allocatable address is in one of five states:
//!
//! - **Free** — available for allocation.
//! - **Committed** — reachable from the last committed root.
//! - **PendingAlloc** — handed out by the in-flight transaction; becomes
//!   Committed on commit, Free again on abort.
//! - **PendingFree** — deallocated by the in-flight transaction; still
//!   holds data reachable from the committed root, so it cannot be reused
//!   until that transaction commits.
//! - **Deferred** — freed by a committed transaction but pinned by a live
//!   snapshot whose root still reaches it. Reclaimed once no snapshot older
//!   than the freeing generation remains.
//!
//! Allocation is best-fit: the smallest free run that satisfies the request
//! wins, ties broken by lowest address so allocation order is deterministic
//! and reproducible in tests.
//!
//! Persistence is a plain bitmap (1 bit per address, 1 = in use as of the
//! commit being written). Pending and deferred states never hit disk: a
//! crash forgets snapshots, so deferred addresses serialize as free.

use cowfs_error::{EngineError, Result};
use cowfs_types::{BlockAddress, Generation};
use std::collections::BTreeMap;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Committed,
    PendingAlloc,
    PendingFree,
    Deferred,
}

/// Statistics snapshot for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub free: u64,
    pub committed: u64,
    pub pending_alloc: u64,
    pub pending_free: u64,
    pub deferred: u64,
}

/// Extent allocator over `[reserved, block_count)`.
#[derive(Debug, Clone)]
pub struct ExtentAllocator {
    block_count: u64,
    reserved: u64,
    slots: Vec<Slot>,
    /// Addresses freed by commit generation G, pinned until no snapshot
    /// older than G remains.
    deferred: BTreeMap<Generation, Vec<BlockAddress>>,
}

impl ExtentAllocator {
    /// Create a fresh allocator with every non-reserved address free.
    pub fn new(block_count: u64, reserved: u64) -> Result<Self> {
        if reserved >= block_count {
            return Err(EngineError::Format(format!(
                "reserved={reserved} must be below block_count={block_count}"
            )));
        }
        let usable = usize::try_from(block_count - reserved)
            .map_err(|_| EngineError::Format("block_count does not fit usize".to_owned()))?;
        Ok(Self {
            block_count,
            reserved,
            slots: vec![Slot::Free; usable],
            deferred: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn index(&self, addr: BlockAddress) -> Result<usize> {
        if addr.0 < self.reserved || addr.0 >= self.block_count {
            return Err(EngineError::Format(format!(
                "address {addr} outside allocatable range [{}, {})",
                self.reserved, self.block_count
            )));
        }
        usize::try_from(addr.0 - self.reserved)
            .map_err(|_| EngineError::Format("address does not fit usize".to_owned()))
    }

    fn addr_at(&self, index: usize) -> BlockAddress {
        BlockAddress(self.reserved + index as u64)
    }

    /// Allocate a contiguous run of `count` blocks.
    ///
    /// Best-fit: smallest adequate free run, ties by lowest address.
    /// The run is marked pending until the owning transaction commits.
    pub fn allocate(&mut self, count: u64) -> Result<BlockAddress> {
        if count == 0 {
            return Err(EngineError::Format("cannot allocate zero blocks".to_owned()));
        }
        let count_usize = usize::try_from(count)
            .map_err(|_| EngineError::Format("allocation count does not fit usize".to_owned()))?;

        let mut best: Option<(usize, usize)> = None; // (start, run_len)
        let mut run_start = 0_usize;
        let mut run_len = 0_usize;
        for i in 0..=self.slots.len() {
            let free = i < self.slots.len() && self.slots[i] == Slot::Free;
            if free {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
            } else {
                if run_len >= count_usize {
                    let better = match best {
                        None => true,
                        // Strict < keeps the lowest address on equal lengths
                        // because runs are visited in address order.
                        Some((_, best_len)) => run_len < best_len,
                    };
                    if better {
                        best = Some((run_start, run_len));
                    }
                }
                run_len = 0;
            }
        }

        let Some((start, _)) = best else {
            debug!(
                target: "cowfs::alloc",
                count,
                free = self.stats().free,
                "allocation failed: no adequate free extent"
            );
            return Err(EngineError::OutOfSpace);
        };

        for slot in &mut self.slots[start..start + count_usize] {
            *slot = Slot::PendingAlloc;
        }
        let addr = self.addr_at(start);
        trace!(target: "cowfs::alloc", addr = addr.0, count, "allocate");
        Ok(addr)
    }

    /// Mark `count` blocks starting at `addr` as pending-free.
    ///
    /// An address allocated and freed within the same transaction reverts
    /// straight to free; a committed address stays unusable until the
    /// owning transaction commits.
    pub fn deallocate(&mut self, addr: BlockAddress, count: u64) -> Result<()> {
        let start = self.index(addr)?;
        let count_usize = usize::try_from(count)
            .map_err(|_| EngineError::Format("deallocation count does not fit usize".to_owned()))?;
        let end = start
            .checked_add(count_usize)
            .filter(|end| *end <= self.slots.len())
            .ok_or_else(|| EngineError::Format(format!("deallocation of {count} at {addr} out of range")))?;

        // Validate the whole run before mutating anything.
        for (i, slot) in self.slots[start..end].iter().enumerate() {
            match slot {
                Slot::Committed | Slot::PendingAlloc => {}
                Slot::Free | Slot::PendingFree | Slot::Deferred => {
                    return Err(EngineError::Format(format!(
                        "double free at address {}",
                        self.addr_at(start + i)
                    )));
                }
            }
        }
        for slot in &mut self.slots[start..end] {
            *slot = match slot {
                Slot::Committed => Slot::PendingFree,
                Slot::PendingAlloc => Slot::Free,
                _ => unreachable!("validated above"),
            };
        }
        trace!(target: "cowfs::alloc", addr = addr.0, count, "deallocate");
        Ok(())
    }

    /// Promote pending state at commit.
    ///
    /// Pending allocations become committed; pending frees move to the
    /// deferred list tagged with the committing generation.
    pub fn commit(&mut self, generation: Generation) {
        let mut freed = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Slot::PendingAlloc => *slot = Slot::Committed,
                Slot::PendingFree => {
                    *slot = Slot::Deferred;
                    freed.push(BlockAddress(self.reserved + i as u64));
                }
                _ => {}
            }
        }
        let freed_count = freed.len();
        if !freed.is_empty() {
            self.deferred.entry(generation).or_default().extend(freed);
        }
        debug!(
            target: "cowfs::alloc",
            generation = generation.0,
            deferred = freed_count,
            "allocator commit"
        );
    }

    /// Roll back all pending state at abort. No on-disk effect.
    pub fn abort(&mut self) {
        for slot in &mut self.slots {
            match slot {
                Slot::PendingAlloc => *slot = Slot::Free,
                Slot::PendingFree => *slot = Slot::Committed,
                _ => {}
            }
        }
        debug!(target: "cowfs::alloc", "allocator abort");
    }

    /// Reclaim deferred addresses no longer pinned by any snapshot.
    ///
    /// An address freed at generation `G` was reachable from roots older
    /// than `G`; it becomes reusable once every live snapshot generation is
    /// `>= G`. `min_live_snapshot = None` means no snapshots are held.
    pub fn reclaim(&mut self, min_live_snapshot: Option<Generation>) -> u64 {
        let mut reclaimed = 0_u64;
        let reclaimable: Vec<Generation> = self
            .deferred
            .keys()
            .copied()
            .filter(|gen| min_live_snapshot.is_none_or(|min| min >= *gen))
            .collect();

        for gen in reclaimable {
            let Some(addrs) = self.deferred.remove(&gen) else {
                continue;
            };
            for addr in addrs {
                if let Ok(i) = self.index(addr) {
                    if self.slots[i] == Slot::Deferred {
                        self.slots[i] = Slot::Free;
                        reclaimed += 1;
                    }
                }
            }
        }
        if reclaimed > 0 {
            debug!(target: "cowfs::alloc", reclaimed, "deferred blocks reclaimed");
        }
        reclaimed
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        let mut stats = AllocStats::default();
        for slot in &self.slots {
            match slot {
                Slot::Free => stats.free += 1,
                Slot::Committed => stats.committed += 1,
                Slot::PendingAlloc => stats.pending_alloc += 1,
                Slot::PendingFree => stats.pending_free += 1,
                Slot::Deferred => stats.deferred += 1,
            }
        }
        stats
    }

    /// Number of bitmap bytes needed to persist `block_count` addresses.
    #[must_use]
    pub fn bitmap_len_bytes(block_count: u64) -> usize {
        usize::try_from(block_count.div_ceil(8)).unwrap_or(usize::MAX)
    }

    /// Serialize the as-if-committed view: pending allocations count as in
    /// use, pending frees and deferred addresses as free. Reserved
    /// addresses are always marked in use.
    #[must_use]
    pub fn to_bitmap(&self) -> Vec<u8> {
        let mut bitmap = vec![0_u8; Self::bitmap_len_bytes(self.block_count)];
        for addr in 0..self.reserved {
            set_bit(&mut bitmap, addr);
        }
        for (i, slot) in self.slots.iter().enumerate() {
            let in_use = matches!(slot, Slot::Committed | Slot::PendingAlloc);
            if in_use {
                set_bit(&mut bitmap, self.reserved + i as u64);
            }
        }
        bitmap
    }

    /// Rebuild allocator state from a persisted bitmap: set bits become
    /// committed, clear bits free. Pending and deferred states do not
    /// survive a reopen by design.
    pub fn from_bitmap(block_count: u64, reserved: u64, bitmap: &[u8]) -> Result<Self> {
        if bitmap.len() < Self::bitmap_len_bytes(block_count) {
            return Err(EngineError::Format(format!(
                "bitmap too short: got {} bytes for {} blocks",
                bitmap.len(),
                block_count
            )));
        }
        let mut alloc = Self::new(block_count, reserved)?;
        for i in 0..alloc.slots.len() {
            if get_bit(bitmap, reserved + i as u64) {
                alloc.slots[i] = Slot::Committed;
            }
        }
        Ok(alloc)
    }
}

fn set_bit(bitmap: &mut [u8], idx: u64) {
    let byte = (idx / 8) as usize;
    let bit = (idx % 8) as u8;
    if byte < bitmap.len() {
        bitmap[byte] |= 1 << bit;
    }
}

fn get_bit(bitmap: &[u8], idx: u64) -> bool {
    let byte = (idx / 8) as usize;
    let bit = (idx % 8) as u8;
    byte < bitmap.len() && (bitmap[byte] >> bit) & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(blocks: u64) -> ExtentAllocator {
        ExtentAllocator::new(blocks, 2).expect("allocator")
    }

    #[test]
    fn allocates_lowest_address_first() {
        let mut a = alloc(32);
        assert_eq!(a.allocate(1).expect("alloc"), BlockAddress(2));
        assert_eq!(a.allocate(1).expect("alloc"), BlockAddress(3));
    }

    #[test]
    fn best_fit_prefers_smallest_adequate_run() {
        let mut a = alloc(32);
        // Carve the free space into a 3-run and a larger tail:
        // allocate [2..12), free [4..7) and [9..12).
        let base = a.allocate(10).expect("alloc");
        assert_eq!(base, BlockAddress(2));
        a.commit(Generation(1));
        a.deallocate(BlockAddress(4), 3).expect("dealloc");
        a.deallocate(BlockAddress(9), 3).expect("dealloc");
        a.commit(Generation(2));
        assert_eq!(a.reclaim(None), 6);

        // A 2-block request fits both 3-runs and the tail; the smallest
        // run wins, lowest address breaking the tie.
        assert_eq!(a.allocate(2).expect("alloc"), BlockAddress(4));
        assert_eq!(a.allocate(2).expect("alloc"), BlockAddress(9));
        // Now only the tail [12..32) remains for a 4-block request.
        assert_eq!(a.allocate(4).expect("alloc"), BlockAddress(12));
    }

    #[test]
    fn out_of_space_when_no_run_fits() {
        let mut a = alloc(8);
        let _ = a.allocate(6).expect("alloc all");
        assert!(matches!(a.allocate(1).unwrap_err(), EngineError::OutOfSpace));
    }

    #[test]
    fn abort_restores_pending_allocations_and_frees() {
        let mut a = alloc(16);
        let committed = a.allocate(2).expect("alloc");
        a.commit(Generation(1));

        let pending = a.allocate(2).expect("alloc");
        a.deallocate(committed, 2).expect("dealloc");
        a.abort();

        // The aborted allocation is free again and reused first.
        assert_eq!(a.allocate(2).expect("alloc"), pending);
        // The aborted free is still committed: freeing again succeeds.
        a.deallocate(committed, 2).expect("dealloc after abort");
    }

    #[test]
    fn pending_free_is_not_reusable_before_commit() {
        let mut a = alloc(8);
        let addr = a.allocate(6).expect("alloc");
        a.commit(Generation(1));
        a.deallocate(addr, 6).expect("dealloc");

        // Still unusable: the data is reachable from the committed root.
        assert!(matches!(a.allocate(1).unwrap_err(), EngineError::OutOfSpace));

        a.commit(Generation(2));
        assert!(matches!(a.allocate(1).unwrap_err(), EngineError::OutOfSpace));
        assert_eq!(a.reclaim(None), 6);
        assert_eq!(a.allocate(1).expect("alloc"), addr);
    }

    #[test]
    fn snapshot_pins_deferred_blocks() {
        let mut a = alloc(8);
        let addr = a.allocate(2).expect("alloc");
        a.commit(Generation(1));
        a.deallocate(addr, 2).expect("dealloc");
        a.commit(Generation(2));

        // A snapshot at generation 1 still reaches the freed blocks.
        assert_eq!(a.reclaim(Some(Generation(1))), 0);
        // A snapshot at generation 2 does not.
        assert_eq!(a.reclaim(Some(Generation(2))), 2);
    }

    #[test]
    fn same_transaction_alloc_then_free_reverts() {
        let mut a = alloc(8);
        let addr = a.allocate(1).expect("alloc");
        a.deallocate(addr, 1).expect("dealloc");
        assert_eq!(a.stats().free, 6);
        assert_eq!(a.stats().pending_free, 0);
    }

    #[test]
    fn double_free_rejected() {
        let mut a = alloc(8);
        let addr = a.allocate(1).expect("alloc");
        a.commit(Generation(1));
        a.deallocate(addr, 1).expect("dealloc");
        assert!(a.deallocate(addr, 1).is_err());
    }

    #[test]
    fn reserved_range_is_never_allocated() {
        let mut a = alloc(8);
        for _ in 0..6 {
            let addr = a.allocate(1).expect("alloc");
            assert!(addr.0 >= 2);
        }
        assert!(a.deallocate(BlockAddress(0), 1).is_err());
        assert!(a.deallocate(BlockAddress(1), 1).is_err());
    }

    #[test]
    fn bitmap_round_trip() {
        let mut a = alloc(32);
        let kept = a.allocate(3).expect("alloc");
        a.commit(Generation(1));
        let dropped = a.allocate(2).expect("alloc");
        a.deallocate(dropped, 2).expect("dealloc");
        let pending = a.allocate(2).expect("alloc");

        let bitmap = a.to_bitmap();
        let restored = ExtentAllocator::from_bitmap(32, 2, &bitmap).expect("restore");

        // Kept and pending-alloc serialize as in use.
        let stats = restored.stats();
        assert_eq!(stats.committed, 5);
        assert_eq!(stats.free, 25);
        assert_eq!(stats.pending_alloc, 0);

        let mut restored = restored;
        restored.deallocate(kept, 3).expect("kept is committed");
        restored.deallocate(pending, 2).expect("pending persisted as committed");
    }

    #[test]
    fn bitmap_marks_reserved_in_use() {
        let a = alloc(16);
        let bitmap = a.to_bitmap();
        assert!(get_bit(&bitmap, 0));
        assert!(get_bit(&bitmap, 1));
        assert!(!get_bit(&bitmap, 2));
    }

    #[test]
    fn from_short_bitmap_rejected() {
        assert!(ExtentAllocator::from_bitmap(64, 2, &[0_u8; 4]).is_err());
    }
}
