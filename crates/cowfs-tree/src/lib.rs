#![forbid(unsafe_code)]
//! Copy-on-write B-tree.
//!
//! A versioned, ordered index from byte-string keys to small values. No
//! node is ever mutated in place: every update clones the affected leaf and
//! every ancestor up to a fresh root, so any previously committed or
//! snapshotted root stays readable forever (until its blocks are reclaimed).
//!
//! Mutations run against a [`TreeContext`] — the in-flight transaction's
//! view, which allocates new addresses, stages payload writes, and records
//! frees. Reads only need a [`NodeSource`] and a root address; descent is
//! lock-free because reachable nodes are immutable.
//!
//! Split policy: a node splits when it exceeds `max_entries` or its encoded
//! form outgrows the block payload; the split point is the median entry
//! index, so shapes are deterministic for any given insertion order. A node
//! that falls below `min_entries` after a remove is rebalanced by borrowing
//! from or merging with an adjacent sibling.

pub mod mem;
mod node;

pub use node::{NODE_MAGIC, Node};

use cowfs_block::BlockDevice;
use cowfs_codec::CodecDevice;
use cowfs_error::{EngineError, Result};
use cowfs_types::BlockAddress;
use tracing::trace;

/// Fanout bounds for tree nodes.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// A node splits above this entry count.
    pub max_entries: usize,
    /// A node rebalances below this entry count.
    pub min_entries: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            min_entries: 8,
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries < 4 || self.min_entries < 2 || self.min_entries * 2 > self.max_entries {
            return Err(EngineError::Format(format!(
                "invalid tree config: max_entries={} min_entries={}",
                self.max_entries, self.min_entries
            )));
        }
        Ok(())
    }
}

/// Longest key accepted for a given block payload size.
#[must_use]
pub fn max_key_len(payload_len: usize) -> usize {
    payload_len / 16
}

/// Longest inline value accepted for a given block payload size.
///
/// Bulk data belongs in raw data blocks referenced by small tree entries;
/// this bound keeps any two entries comfortably within one node.
#[must_use]
pub fn max_value_len(payload_len: usize) -> usize {
    payload_len / 4
}

/// Read access to verified block payloads.
pub trait NodeSource {
    /// Usable payload bytes per block.
    fn payload_len(&self) -> usize;

    /// Read and integrity-check the payload at `addr`.
    fn read_payload(&self, addr: BlockAddress) -> Result<Vec<u8>>;
}

impl<D: BlockDevice> NodeSource for CodecDevice<D> {
    fn payload_len(&self) -> usize {
        CodecDevice::payload_len(self)
    }

    fn read_payload(&self, addr: BlockAddress) -> Result<Vec<u8>> {
        CodecDevice::read_payload(self, addr)
    }
}

/// Write access for CoW mutations: allocation, staging, and frees, all
/// scoped to the in-flight transaction.
pub trait TreeContext: NodeSource {
    /// Allocate one block for a new node or data chunk.
    fn allocate_block(&mut self) -> Result<BlockAddress>;

    /// Release a block (pending-free until the transaction commits).
    fn free_block(&mut self, addr: BlockAddress) -> Result<()>;

    /// Stage a payload write at `addr`. Visible to subsequent reads through
    /// the same context before the transaction commits.
    fn stage_payload(&mut self, addr: BlockAddress, payload: Vec<u8>) -> Result<()>;
}

fn corrupt(addr: BlockAddress, detail: impl Into<String>) -> EngineError {
    EngineError::CorruptBlock {
        address: addr.0,
        detail: detail.into(),
    }
}

/// Read and decode the node at `addr`.
pub fn read_node(src: &impl NodeSource, addr: BlockAddress) -> Result<Node> {
    let payload = src.read_payload(addr)?;
    Node::decode(&payload).map_err(|e| corrupt(addr, e.to_string()))
}

fn write_node(cx: &mut impl TreeContext, node: &Node) -> Result<BlockAddress> {
    let payload = node
        .encode()
        .map_err(|e| EngineError::Format(format!("node encode failed: {e}")))?;
    if payload.len() > cx.payload_len() {
        return Err(EngineError::Format(format!(
            "encoded node of {} bytes exceeds payload capacity {}",
            payload.len(),
            cx.payload_len()
        )));
    }
    let addr = cx.allocate_block()?;
    cx.stage_payload(addr, payload)?;
    Ok(addr)
}

fn child_index(entries: &[(Vec<u8>, BlockAddress)], key: &[u8]) -> usize {
    let pos = entries.partition_point(|(k, _)| k.as_slice() <= key);
    pos.saturating_sub(1)
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Find the value stored under `key`, descending from `root`.
///
/// A checksum or format failure on any visited node aborts the read with
/// `CorruptBlock`; it is never silently ignored.
pub fn lookup(
    src: &impl NodeSource,
    root: Option<BlockAddress>,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let Some(mut addr) = root else {
        return Ok(None);
    };
    loop {
        match read_node(src, addr)? {
            Node::Internal { entries } => {
                if entries.is_empty() {
                    return Err(corrupt(addr, "internal node has no entries"));
                }
                addr = entries[child_index(&entries, key)].1;
            }
            Node::Leaf { mut entries } => {
                return Ok(
                    match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                        Ok(i) => Some(entries.swap_remove(i).1),
                        Err(_) => None,
                    },
                );
            }
        }
    }
}

// ── Insert ──────────────────────────────────────────────────────────────────

enum Placed {
    One(Vec<u8>, BlockAddress),
    Split((Vec<u8>, BlockAddress), (Vec<u8>, BlockAddress)),
}

fn validate_entry(cx: &impl NodeSource, key: &[u8], value: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(EngineError::Format("key must be non-empty".to_owned()));
    }
    if key.len() > max_key_len(cx.payload_len()) {
        return Err(EngineError::Format(format!(
            "key of {} bytes exceeds limit {}",
            key.len(),
            max_key_len(cx.payload_len())
        )));
    }
    if value.len() > max_value_len(cx.payload_len()) {
        return Err(EngineError::Format(format!(
            "value of {} bytes exceeds inline limit {}",
            value.len(),
            max_value_len(cx.payload_len())
        )));
    }
    Ok(())
}

/// Insert (or replace) `key` → `value`, returning the new root address.
///
/// The old root and every node on the descent path become pending-free in
/// the transaction; nothing on disk is overwritten.
pub fn insert(
    cx: &mut impl TreeContext,
    cfg: &TreeConfig,
    root: Option<BlockAddress>,
    key: &[u8],
    value: &[u8],
) -> Result<BlockAddress> {
    validate_entry(cx, key, value)?;
    match root {
        None => write_node(
            cx,
            &Node::Leaf {
                entries: vec![(key.to_vec(), value.to_vec())],
            },
        ),
        Some(addr) => match insert_rec(cx, cfg, addr, key, value)? {
            Placed::One(_, new_root) => Ok(new_root),
            Placed::Split(left, right) => {
                trace!(target: "cowfs::tree", "root split");
                write_node(
                    cx,
                    &Node::Internal {
                        entries: vec![left, right],
                    },
                )
            }
        },
    }
}

fn insert_rec(
    cx: &mut impl TreeContext,
    cfg: &TreeConfig,
    addr: BlockAddress,
    key: &[u8],
    value: &[u8],
) -> Result<Placed> {
    match read_node(cx, addr)? {
        Node::Leaf { mut entries } => {
            match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                Ok(i) => entries[i].1 = value.to_vec(),
                Err(i) => entries.insert(i, (key.to_vec(), value.to_vec())),
            }
            cx.free_block(addr)?;
            place(cx, cfg, Node::Leaf { entries })
        }
        Node::Internal { mut entries } => {
            if entries.is_empty() {
                return Err(corrupt(addr, "internal node has no entries"));
            }
            let idx = child_index(&entries, key);
            let child = entries[idx].1;
            match insert_rec(cx, cfg, child, key, value)? {
                Placed::One(min_key, new_child) => {
                    entries[idx] = (min_key, new_child);
                }
                Placed::Split(left, right) => {
                    entries[idx] = left;
                    entries.insert(idx + 1, right);
                }
            }
            cx.free_block(addr)?;
            place(cx, cfg, Node::Internal { entries })
        }
    }
}

/// Write a (possibly oversized) node, splitting at the median if needed.
fn place(cx: &mut impl TreeContext, cfg: &TreeConfig, node: Node) -> Result<Placed> {
    let overflow = node.len() > cfg.max_entries || node.encoded_len() > cx.payload_len();
    if !overflow {
        let min_key = node
            .min_key()
            .ok_or_else(|| EngineError::Format("placing empty node".to_owned()))?
            .to_vec();
        let addr = write_node(cx, &node)?;
        return Ok(Placed::One(min_key, addr));
    }

    if node.len() < 2 {
        return Err(EngineError::Format(
            "single entry exceeds node capacity".to_owned(),
        ));
    }
    let (left, right) = split_median(node);
    trace!(
        target: "cowfs::tree",
        left = left.len(),
        right = right.len(),
        "node split"
    );
    let left_key = left
        .min_key()
        .ok_or_else(|| EngineError::Format("empty split half".to_owned()))?
        .to_vec();
    let right_key = right
        .min_key()
        .ok_or_else(|| EngineError::Format("empty split half".to_owned()))?
        .to_vec();
    let left_addr = write_node(cx, &left)?;
    let right_addr = write_node(cx, &right)?;
    Ok(Placed::Split(
        (left_key, left_addr),
        (right_key, right_addr),
    ))
}

fn split_median(node: Node) -> (Node, Node) {
    match node {
        Node::Leaf { mut entries } => {
            let right = entries.split_off(entries.len() / 2);
            (Node::Leaf { entries }, Node::Leaf { entries: right })
        }
        Node::Internal { mut entries } => {
            let right = entries.split_off(entries.len() / 2);
            (Node::Internal { entries }, Node::Internal { entries: right })
        }
    }
}

// ── Remove ──────────────────────────────────────────────────────────────────

enum Removed {
    NotFound,
    Updated {
        addr: BlockAddress,
        min_key: Option<Vec<u8>>,
        len: usize,
    },
}

/// Remove `key`, returning the new root and the removed value.
///
/// A miss leaves the tree untouched: no allocations, no frees.
pub fn remove(
    cx: &mut impl TreeContext,
    cfg: &TreeConfig,
    root: Option<BlockAddress>,
    key: &[u8],
) -> Result<(Option<BlockAddress>, Option<Vec<u8>>)> {
    let Some(addr) = root else {
        return Ok((None, None));
    };
    let (outcome, old) = remove_rec(cx, cfg, addr, key)?;
    match outcome {
        Removed::NotFound => Ok((Some(addr), None)),
        Removed::Updated { addr: new_root, len, .. } => {
            if len == 0 {
                cx.free_block(new_root)?;
                return Ok((None, old));
            }
            // Collapse a single-child internal root.
            if let Node::Internal { entries } = read_node(cx, new_root)? {
                if entries.len() == 1 {
                    cx.free_block(new_root)?;
                    return Ok((Some(entries[0].1), old));
                }
            }
            Ok((Some(new_root), old))
        }
    }
}

fn remove_rec(
    cx: &mut impl TreeContext,
    cfg: &TreeConfig,
    addr: BlockAddress,
    key: &[u8],
) -> Result<(Removed, Option<Vec<u8>>)> {
    match read_node(cx, addr)? {
        Node::Leaf { mut entries } => {
            let Ok(i) = entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) else {
                return Ok((Removed::NotFound, None));
            };
            let (_, old) = entries.remove(i);
            cx.free_block(addr)?;
            let min_key = entries.first().map(|(k, _)| k.clone());
            let len = entries.len();
            let new_addr = write_node(cx, &Node::Leaf { entries })?;
            Ok((
                Removed::Updated {
                    addr: new_addr,
                    min_key,
                    len,
                },
                Some(old),
            ))
        }
        Node::Internal { mut entries } => {
            if entries.is_empty() {
                return Err(corrupt(addr, "internal node has no entries"));
            }
            let idx = child_index(&entries, key);
            let child = entries[idx].1;
            let (outcome, old) = remove_rec(cx, cfg, child, key)?;
            let Removed::Updated {
                addr: new_child,
                min_key,
                len,
            } = outcome
            else {
                return Ok((Removed::NotFound, None));
            };

            if len == 0 {
                cx.free_block(new_child)?;
                entries.remove(idx);
            } else {
                let sep = min_key
                    .ok_or_else(|| corrupt(new_child, "non-empty node without min key"))?;
                entries[idx] = (sep, new_child);
                if len < cfg.min_entries && entries.len() >= 2 {
                    rebalance(cx, cfg, &mut entries, idx)?;
                }
            }

            cx.free_block(addr)?;
            let min_key = entries.first().map(|(k, _)| k.clone());
            let len = entries.len();
            let new_addr = write_node(cx, &Node::Internal { entries })?;
            Ok((
                Removed::Updated {
                    addr: new_addr,
                    min_key,
                    len,
                },
                old,
            ))
        }
    }
}

fn merge_nodes(addr: BlockAddress, left: Node, right: Node) -> Result<Node> {
    match (left, right) {
        (Node::Leaf { mut entries }, Node::Leaf { entries: r }) => {
            entries.extend(r);
            Ok(Node::Leaf { entries })
        }
        (Node::Internal { mut entries }, Node::Internal { entries: r }) => {
            entries.extend(r);
            Ok(Node::Internal { entries })
        }
        _ => Err(corrupt(addr, "sibling nodes disagree on kind")),
    }
}

/// Fix up an underfull child at `idx` by merging with or borrowing from an
/// adjacent sibling. If neither fits in a block payload the child is left
/// underfull; the tree stays correct, only less dense.
fn rebalance(
    cx: &mut impl TreeContext,
    cfg: &TreeConfig,
    entries: &mut Vec<(Vec<u8>, BlockAddress)>,
    idx: usize,
) -> Result<()> {
    let (li, ri) = if idx + 1 < entries.len() {
        (idx, idx + 1)
    } else {
        (idx - 1, idx)
    };
    let left_addr = entries[li].1;
    let right_addr = entries[ri].1;
    let left = read_node(cx, left_addr)?;
    let right = read_node(cx, right_addr)?;

    let combined_len = left.len() + right.len();
    let merged = merge_nodes(left_addr, left.clone(), right.clone())?;
    if combined_len <= cfg.max_entries && merged.encoded_len() <= cx.payload_len() {
        cx.free_block(left_addr)?;
        cx.free_block(right_addr)?;
        let min_key = merged
            .min_key()
            .ok_or_else(|| corrupt(left_addr, "merged node is empty"))?
            .to_vec();
        let new_addr = write_node(cx, &merged)?;
        entries[li] = (min_key, new_addr);
        entries.remove(ri);
        trace!(target: "cowfs::tree", "nodes merged");
        return Ok(());
    }

    // Borrow one entry into the underfull side.
    let (mut lnode, mut rnode) = (left, right);
    let donor_is_left = ri == idx;
    let moved = if donor_is_left {
        shift_last_to_front(&mut lnode, &mut rnode)
    } else {
        shift_first_to_back(&mut lnode, &mut rnode)
    };
    if !moved
        || lnode.is_empty()
        || rnode.is_empty()
        || lnode.encoded_len() > cx.payload_len()
        || rnode.encoded_len() > cx.payload_len()
    {
        // Leave underfull rather than produce an oversized sibling.
        return Ok(());
    }

    cx.free_block(left_addr)?;
    cx.free_block(right_addr)?;
    let lkey = lnode
        .min_key()
        .ok_or_else(|| corrupt(left_addr, "empty node after borrow"))?
        .to_vec();
    let rkey = rnode
        .min_key()
        .ok_or_else(|| corrupt(right_addr, "empty node after borrow"))?
        .to_vec();
    let new_left = write_node(cx, &lnode)?;
    let new_right = write_node(cx, &rnode)?;
    entries[li] = (lkey, new_left);
    entries[ri] = (rkey, new_right);
    trace!(target: "cowfs::tree", "entry borrowed between siblings");
    Ok(())
}

fn shift_last_to_front(left: &mut Node, right: &mut Node) -> bool {
    match (left, right) {
        (Node::Leaf { entries: l }, Node::Leaf { entries: r }) => {
            if l.len() <= 1 {
                return false;
            }
            let moved = l.pop().expect("checked non-empty");
            r.insert(0, moved);
            true
        }
        (Node::Internal { entries: l }, Node::Internal { entries: r }) => {
            if l.len() <= 1 {
                return false;
            }
            let moved = l.pop().expect("checked non-empty");
            r.insert(0, moved);
            true
        }
        _ => false,
    }
}

fn shift_first_to_back(left: &mut Node, right: &mut Node) -> bool {
    match (left, right) {
        (Node::Leaf { entries: l }, Node::Leaf { entries: r }) => {
            if r.len() <= 1 {
                return false;
            }
            l.push(r.remove(0));
            true
        }
        (Node::Internal { entries: l }, Node::Internal { entries: r }) => {
            if r.len() <= 1 {
                return false;
            }
            l.push(r.remove(0));
            true
        }
        _ => false,
    }
}

// ── Range scans ─────────────────────────────────────────────────────────────

/// Restartable ordered scan over `[lo, hi)`.
///
/// Each call to [`next_batch`](Self::next_batch) re-descends from the root
/// with the advanced lower bound, so a cursor survives arbitrarily long
/// pauses and can be re-issued against the same root at any time.
#[derive(Debug, Clone)]
pub struct RangeCursor {
    root: Option<BlockAddress>,
    next_lo: Vec<u8>,
    hi: Option<Vec<u8>>,
    batch: usize,
    done: bool,
}

impl RangeCursor {
    #[must_use]
    pub fn new(root: Option<BlockAddress>, lo: &[u8], hi: Option<&[u8]>, batch: usize) -> Self {
        Self {
            root,
            next_lo: lo.to_vec(),
            hi: hi.map(<[u8]>::to_vec),
            batch: batch.max(1),
            done: root.is_none(),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch up to `batch` entries at and above the current lower bound.
    /// Returns an empty vector once the range is exhausted.
    pub fn next_batch(&mut self, src: &impl NodeSource) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if let Some(root) = self.root {
            collect_range(
                src,
                root,
                &self.next_lo,
                self.hi.as_deref(),
                self.batch,
                &mut out,
            )?;
        }
        if out.len() < self.batch {
            self.done = true;
        }
        if let Some((last_key, _)) = out.last() {
            // Smallest key strictly greater than last_key.
            let mut next = last_key.clone();
            next.push(0);
            self.next_lo = next;
        }
        Ok(out)
    }
}

fn collect_range(
    src: &impl NodeSource,
    addr: BlockAddress,
    lo: &[u8],
    hi: Option<&[u8]>,
    limit: usize,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<bool> {
    match read_node(src, addr)? {
        Node::Leaf { entries } => {
            for (key, value) in entries {
                if key.as_slice() < lo {
                    continue;
                }
                if hi.is_some_and(|h| key.as_slice() >= h) {
                    return Ok(false);
                }
                out.push((key, value));
                if out.len() >= limit {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Node::Internal { entries } => {
            if entries.is_empty() {
                return Err(corrupt(addr, "internal node has no entries"));
            }
            let start = child_index(&entries, lo);
            for (sep, child) in entries.iter().skip(start) {
                if hi.is_some_and(|h| sep.as_slice() >= h) {
                    return Ok(false);
                }
                if !collect_range(src, *child, lo, hi, limit, out)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

// ── Walk ────────────────────────────────────────────────────────────────────

/// Visit every node reachable from `root` in key order, verifying each
/// block on the way (reads go through the codec). Returns the node count.
pub fn walk<F>(src: &impl NodeSource, root: Option<BlockAddress>, visit: &mut F) -> Result<u64>
where
    F: FnMut(BlockAddress, &Node) -> Result<()>,
{
    let Some(addr) = root else {
        return Ok(0);
    };
    let node = read_node(src, addr)?;
    visit(addr, &node)?;
    let mut count = 1_u64;
    if let Node::Internal { entries } = &node {
        for (_, child) in entries {
            count += walk(src, Some(*child), visit)?;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemTreeStore;

    fn cfg() -> TreeConfig {
        TreeConfig {
            max_entries: 8,
            min_entries: 2,
        }
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{i:06}").into_bytes()
    }

    fn val(i: u32) -> Vec<u8> {
        format!("value-{i}").into_bytes()
    }

    fn build(store: &mut MemTreeStore, n: u32) -> BlockAddress {
        let mut root = None;
        for i in 0..n {
            root = Some(insert(store, &cfg(), root, &key(i), &val(i)).expect("insert"));
        }
        root.expect("non-empty tree")
    }

    #[test]
    fn insert_then_lookup() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 200);
        for i in 0..200 {
            let got = lookup(&store, Some(root), &key(i)).expect("lookup");
            assert_eq!(got, Some(val(i)), "key {i}");
        }
        assert_eq!(lookup(&store, Some(root), b"missing").expect("lookup"), None);
    }

    #[test]
    fn lookup_on_empty_tree() {
        let store = MemTreeStore::new(4088);
        assert_eq!(lookup(&store, None, b"k").expect("lookup"), None);
    }

    #[test]
    fn insert_replaces_existing_value() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 10);
        let root = insert(&mut store, &cfg(), Some(root), &key(3), b"replaced").expect("insert");
        assert_eq!(
            lookup(&store, Some(root), &key(3)).expect("lookup"),
            Some(b"replaced".to_vec())
        );
        // Others untouched.
        assert_eq!(lookup(&store, Some(root), &key(4)).expect("lookup"), Some(val(4)));
    }

    #[test]
    fn old_root_unaffected_by_later_inserts() {
        let mut store = MemTreeStore::new(4088);
        let old_root = build(&mut store, 50);
        let new_root =
            insert(&mut store, &cfg(), Some(old_root), &key(999), b"new").expect("insert");

        assert_eq!(lookup(&store, Some(old_root), &key(999)).expect("lookup"), None);
        assert_eq!(
            lookup(&store, Some(new_root), &key(999)).expect("lookup"),
            Some(b"new".to_vec())
        );
        // Old data visible through both roots.
        assert_eq!(lookup(&store, Some(old_root), &key(7)).expect("lookup"), Some(val(7)));
        assert_eq!(lookup(&store, Some(new_root), &key(7)).expect("lookup"), Some(val(7)));
    }

    #[test]
    fn remove_round_trip() {
        let mut store = MemTreeStore::new(4088);
        let mut root = Some(build(&mut store, 100));
        for i in (0..100).rev() {
            let (new_root, old) = remove(&mut store, &cfg(), root, &key(i)).expect("remove");
            assert_eq!(old, Some(val(i)), "removed value {i}");
            root = new_root;
            assert_eq!(lookup(&store, root, &key(i)).expect("lookup"), None);
        }
        assert_eq!(root, None, "tree empties out");
    }

    #[test]
    fn remove_missing_key_is_a_noop() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 20);
        let staged_before = store.staged_writes();
        let freed_before = store.freed().len();

        let (new_root, old) = remove(&mut store, &cfg(), Some(root), b"missing").expect("remove");
        assert_eq!(new_root, Some(root));
        assert_eq!(old, None);
        assert_eq!(store.staged_writes(), staged_before, "no CoW on a miss");
        assert_eq!(store.freed().len(), freed_before);
    }

    #[test]
    fn remove_interleaved_keeps_remaining_keys() {
        let mut store = MemTreeStore::new(4088);
        let mut root = Some(build(&mut store, 120));
        for i in (0..120).filter(|i| i % 3 == 0) {
            let (new_root, old) = remove(&mut store, &cfg(), root, &key(i)).expect("remove");
            assert!(old.is_some());
            root = new_root;
        }
        for i in 0..120 {
            let expect = if i % 3 == 0 { None } else { Some(val(i)) };
            assert_eq!(lookup(&store, root, &key(i)).expect("lookup"), expect, "key {i}");
        }
    }

    #[test]
    fn range_scan_in_order() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 64);
        let mut cursor = RangeCursor::new(Some(root), &key(10), Some(&key(20)), 100);
        let batch = cursor.next_batch(&store).expect("batch");
        let keys: Vec<Vec<u8>> = batch.iter().map(|(k, _)| k.clone()).collect();
        let expect: Vec<Vec<u8>> = (10..20).map(key).collect();
        assert_eq!(keys, expect);
        assert!(cursor.next_batch(&store).expect("batch").is_empty());
    }

    #[test]
    fn range_cursor_restarts_across_batches() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 64);
        let mut cursor = RangeCursor::new(Some(root), b"", None, 7);
        let mut seen = Vec::new();
        loop {
            let batch = cursor.next_batch(&store).expect("batch");
            if batch.is_empty() {
                break;
            }
            seen.extend(batch.into_iter().map(|(k, _)| k));
        }
        let expect: Vec<Vec<u8>> = (0..64).map(key).collect();
        assert_eq!(seen, expect);
    }

    #[test]
    fn range_on_empty_tree() {
        let store = MemTreeStore::new(4088);
        let mut cursor = RangeCursor::new(None, b"", None, 10);
        assert!(cursor.next_batch(&store).expect("batch").is_empty());
        assert!(cursor.is_done());
    }

    #[test]
    fn insert_key_below_current_minimum() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 40);
        let root = insert(&mut store, &cfg(), Some(root), b"aaa", b"first").expect("insert");
        assert_eq!(
            lookup(&store, Some(root), b"aaa").expect("lookup"),
            Some(b"first".to_vec())
        );
        let mut cursor = RangeCursor::new(Some(root), b"", None, 1);
        let first = cursor.next_batch(&store).expect("batch");
        assert_eq!(first[0].0, b"aaa".to_vec());
    }

    #[test]
    fn walk_visits_all_nodes_and_counts() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 200);
        let mut leaves = 0_u64;
        let mut internals = 0_u64;
        let visited = walk(&store, Some(root), &mut |_, node| {
            if node.is_leaf() {
                leaves += 1;
            } else {
                internals += 1;
            }
            Ok(())
        })
        .expect("walk");
        assert_eq!(visited, leaves + internals);
        assert!(leaves > 1, "200 keys with max fanout 8 must span leaves");
        assert!(internals >= 1);
    }

    #[test]
    fn corrupt_node_surfaces_address() {
        let mut store = MemTreeStore::new(4088);
        let root = build(&mut store, 30);
        // Corrupt a node the descent must visit: the root itself.
        store.clobber(root);
        let err = lookup(&store, Some(root), &key(0)).unwrap_err();
        match err {
            EngineError::CorruptBlock { address, .. } => assert_eq!(address, root.0),
            other => panic!("expected CorruptBlock, got {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_key_and_value() {
        let mut store = MemTreeStore::new(4088);
        let big_key = vec![b'k'; max_key_len(4088) + 1];
        assert!(insert(&mut store, &cfg(), None, &big_key, b"v").is_err());
        let big_val = vec![0_u8; max_value_len(4088) + 1];
        assert!(insert(&mut store, &cfg(), None, b"k", &big_val).is_err());
        assert!(insert(&mut store, &cfg(), None, b"", b"v").is_err());
    }

    #[test]
    fn deterministic_shapes_for_same_insertion_order() {
        let mut a = MemTreeStore::new(4088);
        let mut b = MemTreeStore::new(4088);
        let root_a = build(&mut a, 150);
        let root_b = build(&mut b, 150);

        let mut shape_a = Vec::new();
        walk(&a, Some(root_a), &mut |_, node| {
            shape_a.push((node.is_leaf(), node.len()));
            Ok(())
        })
        .expect("walk");
        let mut shape_b = Vec::new();
        walk(&b, Some(root_b), &mut |_, node| {
            shape_b.push((node.is_leaf(), node.len()));
            Ok(())
        })
        .expect("walk");
        assert_eq!(shape_a, shape_b);
    }
}
