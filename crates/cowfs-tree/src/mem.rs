//! In-memory [`TreeContext`](crate::TreeContext) for unit tests and benches.
//!
//! Models one open transaction's view of storage: allocations hand out fresh
//! addresses, staged payloads are immediately readable, and frees are only
//! recorded, never applied, so older roots stay reachable the same way
//! pending-free blocks do before a commit reclaims them.

use std::collections::HashMap;

use cowfs_error::{EngineError, Result};
use cowfs_types::{BlockAddress, FIRST_ALLOCATABLE};

use crate::{NodeSource, TreeContext};

#[derive(Debug)]
pub struct MemTreeStore {
    payload_len: usize,
    next: u64,
    blocks: HashMap<BlockAddress, Vec<u8>>,
    freed: Vec<BlockAddress>,
    staged_writes: u64,
}

impl MemTreeStore {
    #[must_use]
    pub fn new(payload_len: usize) -> Self {
        Self {
            payload_len,
            next: FIRST_ALLOCATABLE,
            blocks: HashMap::new(),
            freed: Vec::new(),
            staged_writes: 0,
        }
    }

    /// Addresses passed to `free_block`, in call order.
    #[must_use]
    pub fn freed(&self) -> &[BlockAddress] {
        &self.freed
    }

    /// Total `stage_payload` calls observed.
    #[must_use]
    pub fn staged_writes(&self) -> u64 {
        self.staged_writes
    }

    /// Count of blocks currently holding a payload.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Overwrite the payload at `addr` with garbage, simulating a block
    /// whose integrity check passed but whose contents do not parse.
    pub fn clobber(&mut self, addr: BlockAddress) {
        self.blocks.insert(addr, vec![0xA5; self.payload_len]);
    }
}

impl NodeSource for MemTreeStore {
    fn payload_len(&self) -> usize {
        self.payload_len
    }

    fn read_payload(&self, addr: BlockAddress) -> Result<Vec<u8>> {
        self.blocks.get(&addr).cloned().ok_or_else(|| {
            EngineError::CorruptBlock {
                address: addr.0,
                detail: "no payload at address".to_owned(),
            }
        })
    }
}

impl TreeContext for MemTreeStore {
    fn allocate_block(&mut self) -> Result<BlockAddress> {
        let addr = BlockAddress(self.next);
        self.next += 1;
        Ok(addr)
    }

    fn free_block(&mut self, addr: BlockAddress) -> Result<()> {
        self.freed.push(addr);
        Ok(())
    }

    fn stage_payload(&mut self, addr: BlockAddress, payload: Vec<u8>) -> Result<()> {
        if payload.len() > self.payload_len {
            return Err(EngineError::Format(format!(
                "staged payload of {} bytes exceeds capacity {}",
                payload.len(),
                self.payload_len
            )));
        }
        self.blocks.insert(addr, payload);
        self.staged_writes += 1;
        Ok(())
    }
}
