//! Modify-operation driver and the outward single-key API.
//!
//! Every mutation runs the same protocol: open a write transaction,
//! descend from the superblock root splitting full internal nodes
//! proactively and repairing underfull ones reactively, locate the leaf,
//! invoke the pluggable operation, perform leaf-first structural
//! maintenance on the way back up, and commit. Reads descend under a
//! snapshot transaction and never block the writer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::pager::{AccessMode, PageStore, ReadTxn, WriteTxn};
use crate::storage::blob::{BlobTree, SliceMode};
use crate::storage::node::{InternalEntry, InternalNode, LeafNode, Node};
use crate::storage::ops::{
    ConcatOp, CounterOp, DeleteOp, Existing, ModifyOperation, OpContext, SetOp, SetPolicy, Verdict,
};
use crate::storage::record::{Payload, Record, RECORD_MAX_HEADER};
use crate::storage::stats::{BlobStats, BlobStatsSnapshot, TreeStats, TreeStatsSnapshot};
use crate::storage::{Clock, Outcome, SystemClock, ValueSupplier};
use crate::types::{CachetError, PageId, Result, MAX_KEY_LEN};

const SUPERBLOCK_PAGE: PageId = PageId(0);
const SUPERBLOCK_MAGIC: [u8; 4] = *b"CHT1";
const SUPERBLOCK_VERSION: u16 = 1;
const SB_ROOT_OFFSET: usize = 8;

type Path = SmallVec<[PageId; 8]>;

/// Configuration knobs for the tree.
#[derive(Clone)]
pub struct TreeOptions {
    /// Values up to this many bytes stay inline in the leaf entry; longer
    /// values are promoted to the large-value tree.
    pub inline_max: usize,
    /// Hard maximum value length; stores and concatenations past it are
    /// rejected with `TooLarge`.
    pub hard_max_value: usize,
    /// Minimum fill percentage before a non-root node is considered
    /// underfull (0-50).
    pub min_fill_percent: u8,
    /// Time source for expiry checks.
    pub clock: Arc<dyn Clock>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            inline_max: 1024,
            hard_max_value: 1 << 20,
            min_fill_percent: 25,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for TreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeOptions")
            .field("inline_max", &self.inline_max)
            .field("hard_max_value", &self.hard_max_value)
            .field("min_fill_percent", &self.min_fill_percent)
            .finish()
    }
}

/// One key's value as returned by [`Tree::get`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Value {
    /// The value bytes.
    pub bytes: Vec<u8>,
    /// Client flags stored with the value.
    pub flags: u32,
    /// CAS version of the stored record.
    pub cas: u64,
}

enum Rebalance {
    Merged(PageId),
    Leveled,
    Declined,
}

/// Ordered key-value tree over a transactional page store.
pub struct Tree {
    store: Arc<dyn PageStore>,
    options: TreeOptions,
    blob: BlobTree,
    stats: Arc<TreeStats>,
    cas_seq: AtomicU64,
}

impl Tree {
    /// Opens the tree stored in `store`, initializing the superblock on
    /// first use.
    pub fn open_or_create(store: &Arc<dyn PageStore>, options: TreeOptions) -> Result<Tree> {
        let capacity = store.page_size();
        validate_options(&options, capacity)?;
        let blob = BlobTree::new(capacity, Arc::new(BlobStats::default()));
        let tree = Tree {
            store: Arc::clone(store),
            options,
            blob,
            stats: Arc::new(TreeStats::default()),
            cas_seq: AtomicU64::new(1),
        };
        let mut tx = tree.store.begin_write()?;
        let page = tx.acquire(SUPERBLOCK_PAGE)?;
        if page.iter().all(|&b| b == 0) {
            let buf = tx.acquire_mut(SUPERBLOCK_PAGE)?;
            buf[..4].copy_from_slice(&SUPERBLOCK_MAGIC);
            buf[4..6].copy_from_slice(&SUPERBLOCK_VERSION.to_be_bytes());
            tx.commit()?;
        } else {
            superblock_root(page)?;
            drop(tx);
        }
        tree.stats.set_depth(tree.measure_depth()?);
        Ok(tree)
    }

    /// Metrics handle for the driver.
    pub fn stats(&self) -> Arc<TreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the driver counters.
    pub fn stats_snapshot(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot of the large-value store counters.
    pub fn blob_stats_snapshot(&self) -> BlobStatsSnapshot {
        self.blob.stats().snapshot()
    }

    /// Emits all counters to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    // Outward API ----------------------------------------------------------

    /// Point lookup under a snapshot read.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.get_with_mode(key, AccessMode::SnapshotRead)
    }

    /// Point lookup with an explicit read mode.
    pub fn get_with_mode(&self, key: &[u8], mode: AccessMode) -> Result<Option<Value>> {
        validate_key(key)?;
        self.stats.inc_lookups();
        let tx = self.store.begin_read(mode)?;
        let superblock = tx.acquire(SUPERBLOCK_PAGE)?;
        let Some(root) = superblock_root(superblock.data())? else {
            return Ok(None);
        };
        let mut current = root;
        loop {
            let page = tx.acquire(current)?;
            match Node::decode(page.data())? {
                Node::Internal(inner) => {
                    if inner.entries.is_empty() {
                        return Err(CachetError::Corruption("internal node without entries"));
                    }
                    current = inner.entries[inner.child_index(key)].child;
                }
                Node::Leaf(leaf) => {
                    let Ok(idx) = leaf.search(key) else {
                        return Ok(None);
                    };
                    let record = Record::decode(&leaf.entries[idx].record)?;
                    if record.is_expired(self.options.clock.now_unix()) {
                        return Ok(None);
                    }
                    let cas = record.cas.unwrap_or(0);
                    let flags = record.flags;
                    let bytes = match record.payload {
                        Payload::Inline(bytes) => bytes,
                        Payload::Blob(blob_ref) => {
                            let mut dst = Vec::new();
                            self.blob
                                .read_range(&tx, &blob_ref, 0, blob_ref.len, &mut dst)?;
                            dst
                        }
                    };
                    return Ok(Some(Value { bytes, flags, cas }));
                }
            }
        }
    }

    /// Unconditional store.
    pub fn set(
        &self,
        key: &[u8],
        supplier: &mut dyn ValueSupplier,
        flags: u32,
        expiry: u32,
    ) -> Result<Outcome> {
        self.store_with_policy(key, supplier, flags, expiry, SetPolicy::Set)
    }

    /// Store only if the key is absent.
    pub fn add(
        &self,
        key: &[u8],
        supplier: &mut dyn ValueSupplier,
        flags: u32,
        expiry: u32,
    ) -> Result<Outcome> {
        self.store_with_policy(key, supplier, flags, expiry, SetPolicy::Add)
    }

    /// Store only if the key is present.
    pub fn replace(
        &self,
        key: &[u8],
        supplier: &mut dyn ValueSupplier,
        flags: u32,
        expiry: u32,
    ) -> Result<Outcome> {
        self.store_with_policy(key, supplier, flags, expiry, SetPolicy::Replace)
    }

    /// Store only if the present record still carries `version`.
    pub fn cas(
        &self,
        key: &[u8],
        supplier: &mut dyn ValueSupplier,
        flags: u32,
        expiry: u32,
        version: u64,
    ) -> Result<Outcome> {
        self.store_with_policy(key, supplier, flags, expiry, SetPolicy::Cas(version))
    }

    fn store_with_policy(
        &self,
        key: &[u8],
        supplier: &mut dyn ValueSupplier,
        flags: u32,
        expiry: u32,
        policy: SetPolicy,
    ) -> Result<Outcome> {
        let mut op = SetOp {
            policy,
            flags,
            expiry,
            supplier,
        };
        self.modify(key, &mut op)
    }

    /// Removes the key.
    pub fn delete(&self, key: &[u8]) -> Result<Outcome> {
        self.modify(key, &mut DeleteOp)
    }

    /// Atomically increments a decimal value, saturating to zero on
    /// overflow.
    pub fn incr(&self, key: &[u8], delta: u64) -> Result<Outcome> {
        self.modify(
            key,
            &mut CounterOp {
                delta,
                decrement: false,
            },
        )
    }

    /// Atomically decrements a decimal value, saturating to zero.
    pub fn decr(&self, key: &[u8], delta: u64) -> Result<Outcome> {
        self.modify(
            key,
            &mut CounterOp {
                delta,
                decrement: true,
            },
        )
    }

    /// Splices bytes at the tail of an existing value.
    pub fn append(&self, key: &[u8], supplier: &mut dyn ValueSupplier) -> Result<Outcome> {
        self.modify(
            key,
            &mut ConcatOp {
                at_tail: true,
                supplier,
            },
        )
    }

    /// Splices bytes at the head of an existing value.
    pub fn prepend(&self, key: &[u8], supplier: &mut dyn ValueSupplier) -> Result<Outcome> {
        self.modify(
            key,
            &mut ConcatOp {
                at_tail: false,
                supplier,
            },
        )
    }

    /// Visits every live record in key order under a snapshot read.
    /// Large values are not materialized; the visitor sees the record.
    pub fn for_each<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &Record) -> Result<()>,
    {
        let tx = self.store.begin_read(AccessMode::SnapshotRead)?;
        let superblock = tx.acquire(SUPERBLOCK_PAGE)?;
        let Some(root) = superblock_root(superblock.data())? else {
            return Ok(());
        };
        self.walk(&tx, root, &mut visit)
    }

    fn walk<F>(&self, tx: &ReadTxn, id: PageId, visit: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], &Record) -> Result<()>,
    {
        let page = tx.acquire(id)?;
        match Node::decode(page.data())? {
            Node::Leaf(leaf) => {
                for entry in &leaf.entries {
                    let record = Record::decode(&entry.record)?;
                    visit(&entry.key, &record)?;
                }
            }
            Node::Internal(inner) => {
                for entry in &inner.entries {
                    self.walk(tx, entry.child, visit)?;
                }
            }
        }
        Ok(())
    }

    // Modify-operation driver ----------------------------------------------

    /// Runs one pluggable operation against `key`: descend, locate the
    /// leaf, invoke, maintain, commit.
    pub fn modify(&self, key: &[u8], op: &mut dyn ModifyOperation) -> Result<Outcome> {
        validate_key(key)?;
        self.stats.inc_modify_ops();
        let capacity = self.store.page_size();
        let min_fill = self.options.min_fill_percent;
        let mut tx = self.store.begin_write()?;

        // Root bootstrap: an empty tree gets a fresh leaf root which is
        // collapsed again on the way out if the operation declines.
        let existing_root = superblock_root(tx.acquire(SUPERBLOCK_PAGE)?)?;
        let created_root = existing_root.is_none();
        let mut current = match existing_root {
            Some(root) => root,
            None => {
                let id = tx.allocate()?;
                Node::empty_leaf().encode(tx.acquire_mut(id)?)?;
                superblock_set_root(tx.acquire_mut(SUPERBLOCK_PAGE)?, Some(id))?;
                self.stats.set_depth(1);
                trace!(target: "cachet_tree::root", page = id.0, "leaf root installed");
                id
            }
        };

        let mut path: Path = SmallVec::new();
        let mut node = self.read_node(&tx, current)?;
        while !node.is_leaf() {
            // (a) proactively split a full internal node so the later
            // ascent can always insert separators without overflowing.
            if node.is_full(capacity, None) {
                let low = internal_low(&node)?;
                let (right, median) = node.split();
                let right_id = tx.allocate()?;
                self.write_node(&mut tx, right_id, &right)?;
                self.write_node(&mut tx, current, &node)?;
                self.stats.inc_internal_splits();
                trace!(
                    target: "cachet_tree::split",
                    left = current.0,
                    right = right_id.0,
                    "split internal node"
                );
                match path.last().copied() {
                    None => {
                        let new_root = tx.allocate()?;
                        let mut root = InternalNode::default();
                        root.entries.push(InternalEntry {
                            separator: low,
                            child: current,
                        });
                        root.entries.push(InternalEntry {
                            separator: median.clone(),
                            child: right_id,
                        });
                        self.write_node(&mut tx, new_root, &Node::Internal(root))?;
                        superblock_set_root(tx.acquire_mut(SUPERBLOCK_PAGE)?, Some(new_root))?;
                        self.stats.set_depth(self.stats.depth() + 1);
                        path.push(new_root);
                    }
                    Some(parent_id) => {
                        let mut parent = self.read_internal(&tx, parent_id)?;
                        parent.insert(median.clone(), right_id);
                        self.write_node(&mut tx, parent_id, &Node::Internal(parent))?;
                    }
                }
                if key >= median.as_slice() {
                    current = right_id;
                    node = right;
                }
            }

            // (b) reactively repair the level below before descending
            // into it, while this node is still at hand as the parent.
            let inner_ref = as_internal(&node)?;
            if inner_ref.entries.is_empty() {
                return Err(CachetError::Corruption("internal node without entries"));
            }
            let idx = inner_ref.child_index(key);
            let mut child_id = inner_ref.entries[idx].child;
            let mut child = self.read_node(&tx, child_id)?;
            if !child.is_leaf() && child.is_underfull(capacity, min_fill) {
                let mut inner = into_internal(node)?;
                let outcome = self.rebalance_under(&mut tx, &mut inner, idx, child_id, child, capacity)?;
                let changed = !matches!(outcome, Rebalance::Declined);
                let rebuilt = Node::Internal(inner);
                self.write_node(&mut tx, current, &rebuilt)?;
                if changed && path.is_empty() && rebuilt.entry_count() == 1 {
                    // Singleton root: promote the lone child and drop a level.
                    let promoted = as_internal(&rebuilt)?.entries[0].child;
                    superblock_set_root(tx.acquire_mut(SUPERBLOCK_PAGE)?, Some(promoted))?;
                    tx.mark_deleted(current)?;
                    self.stats.set_depth(self.stats.depth().saturating_sub(1));
                    trace!(
                        target: "cachet_tree::merge",
                        root = promoted.0,
                        "collapsed singleton root during descent"
                    );
                    current = promoted;
                    node = self.read_node(&tx, current)?;
                    continue;
                }
                // Leveling may have moved the boundary; re-choose.
                let inner_ref = as_internal(&rebuilt)?;
                let idx = inner_ref.child_index(key);
                child_id = inner_ref.entries[idx].child;
                child = self.read_node(&tx, child_id)?;
            }
            path.push(current);
            current = child_id;
            node = child;
        }

        // At the leaf: look up the key, check expiry, acquire the slice of
        // the large value the operation wants, and invoke it.
        let mut leaf = into_leaf(node)?;
        let now = self.options.clock.now_unix();
        let old_record = match leaf.search(key) {
            Ok(idx) => Some(Record::decode(&leaf.entries[idx].record)?),
            Err(_) => None,
        };
        let expired = old_record.as_ref().is_some_and(|r| r.is_expired(now));
        let mut existing = match (&old_record, expired) {
            (Some(record), false) => {
                let blob = match record.blob_ref() {
                    Some(blob_ref) => Some(self.blob.acquire(&tx, blob_ref, op.blob_slice())?),
                    None => None,
                };
                Some(Existing {
                    record: record.clone(),
                    blob,
                })
            }
            _ => None,
        };

        let cas = self.cas_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut ctx = OpContext {
            tx: &mut tx,
            blob: &self.blob,
            inline_max: self.options.inline_max,
            hard_max_value: self.options.hard_max_value,
            cas,
        };
        let verdict = op.apply(&mut ctx, existing.as_mut())?;

        let outcome = match verdict {
            Verdict::Unchanged(outcome) => {
                if expired {
                    // The operation declined an expired record: a silent
                    // delete is owed.
                    self.dispose_record_blob(&mut tx, old_record.as_ref())?;
                    leaf.remove(key);
                    self.stats.inc_silent_expiries();
                    self.finish_leaf(&mut tx, current, leaf, path, capacity)?;
                } else if created_root {
                    self.finish_leaf(&mut tx, current, leaf, path, capacity)?;
                }
                outcome
            }
            Verdict::Deleted(outcome) => {
                if let Some(old) = existing.take() {
                    if let Some(handle) = old.blob {
                        self.blob.mark_deleted(&mut tx, handle)?;
                    }
                }
                leaf.remove(key);
                self.finish_leaf(&mut tx, current, leaf, path, capacity)?;
                outcome
            }
            Verdict::Updated(record, outcome) => {
                // Dispose the replaced value's pages unless the operation
                // reused them (it took the handle out in that case).
                if let Some(old) = existing.take() {
                    if let Some(handle) = old.blob {
                        self.blob.mark_deleted(&mut tx, handle)?;
                    }
                }
                if expired {
                    self.dispose_record_blob(&mut tx, old_record.as_ref())?;
                    self.stats.inc_silent_expiries();
                }
                let mut record_bytes = Vec::new();
                record.encode(&mut record_bytes)?;
                self.write_entry(&mut tx, current, leaf, path, key, record_bytes, capacity)?;
                outcome
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn dispose_record_blob(&self, tx: &mut WriteTxn, record: Option<&Record>) -> Result<()> {
        if let Some(blob_ref) = record.and_then(Record::blob_ref) {
            let handle = self.blob.acquire(tx, blob_ref, SliceMode::ForDelete)?;
            self.blob.mark_deleted(tx, handle)?;
        }
        Ok(())
    }

    /// Writes the entry into the located leaf, splitting beforehand so the
    /// write itself can never overflow the page.
    fn write_entry(
        &self,
        tx: &mut WriteTxn,
        mut leaf_id: PageId,
        mut leaf: LeafNode,
        mut path: Path,
        key: &[u8],
        record_bytes: Vec<u8>,
        capacity: usize,
    ) -> Result<()> {
        while leaf.encoded_len_with(key, record_bytes.len()) > capacity {
            if leaf.entries.len() < 2 {
                return Err(CachetError::Invalid("leaf entry exceeds page capacity"));
            }
            let low = leaf.entries[0].key.clone();
            let mut node = Node::Leaf(leaf);
            let (right, median) = node.split();
            let right_id = tx.allocate()?;
            self.write_node(tx, right_id, &right)?;
            self.write_node(tx, leaf_id, &node)?;
            self.stats.inc_leaf_splits();
            trace!(
                target: "cachet_tree::split",
                left = leaf_id.0,
                right = right_id.0,
                "split leaf"
            );
            match path.last().copied() {
                None => {
                    let new_root = tx.allocate()?;
                    let mut root = InternalNode::default();
                    root.entries.push(InternalEntry {
                        separator: low,
                        child: leaf_id,
                    });
                    root.entries.push(InternalEntry {
                        separator: median.clone(),
                        child: right_id,
                    });
                    self.write_node(tx, new_root, &Node::Internal(root))?;
                    superblock_set_root(tx.acquire_mut(SUPERBLOCK_PAGE)?, Some(new_root))?;
                    self.stats.set_depth(self.stats.depth() + 1);
                    path.push(new_root);
                }
                Some(parent_id) => {
                    let mut parent = self.read_internal(tx, parent_id)?;
                    parent.insert(median.clone(), right_id);
                    self.write_node(tx, parent_id, &Node::Internal(parent))?;
                }
            }
            if key >= median.as_slice() {
                leaf_id = right_id;
                leaf = into_leaf(right)?;
            } else {
                leaf = into_leaf(node)?;
            }
        }
        leaf.upsert(key.to_vec(), record_bytes);
        self.finish_leaf(tx, leaf_id, leaf, path, capacity)
    }

    /// Writes the leaf back and runs the ascending merge/level pass.
    fn finish_leaf(
        &self,
        tx: &mut WriteTxn,
        leaf_id: PageId,
        leaf: LeafNode,
        path: Path,
        capacity: usize,
    ) -> Result<()> {
        let node = Node::Leaf(leaf);
        self.write_node(tx, leaf_id, &node)?;
        self.ascend(tx, leaf_id, node, path, capacity)
    }

    /// Leaf-first ascending maintenance: merge or level each underfull
    /// level, moving up while a structural change occurred; collapse the
    /// root when it ends up empty or with a single child.
    fn ascend(
        &self,
        tx: &mut WriteTxn,
        mut child_id: PageId,
        mut child: Node,
        mut path: Path,
        capacity: usize,
    ) -> Result<()> {
        loop {
            let Some(parent_id) = path.pop() else {
                return self.settle_root(tx, child_id, child);
            };
            if !child.is_underfull(capacity, self.options.min_fill_percent) {
                return Ok(());
            }
            let mut parent = self.read_internal(tx, parent_id)?;
            let idx = parent
                .entries
                .iter()
                .position(|entry| entry.child == child_id)
                .ok_or(CachetError::Corruption("child missing from its parent"))?;
            let outcome = self.rebalance_under(tx, &mut parent, idx, child_id, child, capacity)?;
            let parent_node = Node::Internal(parent);
            self.write_node(tx, parent_id, &parent_node)?;
            match outcome {
                Rebalance::Declined => return Ok(()),
                Rebalance::Merged(_) | Rebalance::Leveled => {
                    child_id = parent_id;
                    child = parent_node;
                }
            }
        }
    }

    /// Root-level aftermath: destroy an empty leaf root, collapse chains
    /// of singleton internal roots.
    fn settle_root(&self, tx: &mut WriteTxn, root_id: PageId, root: Node) -> Result<()> {
        if matches!(&root, Node::Leaf(leaf) if leaf.entries.is_empty()) {
            tx.mark_deleted(root_id)?;
            superblock_set_root(tx.acquire_mut(SUPERBLOCK_PAGE)?, None)?;
            self.stats.set_depth(0);
            trace!(target: "cachet_tree::root", page = root_id.0, "empty root destroyed");
            return Ok(());
        }
        if !matches!(&root, Node::Internal(_)) {
            return Ok(());
        }
        let mut current_id = root_id;
        let mut node = root;
        loop {
            let Node::Internal(inner) = &node else { break };
            if inner.entries.len() != 1 {
                break;
            }
            let only = inner.entries[0].child;
            tx.mark_deleted(current_id)?;
            self.stats.set_depth(self.stats.depth().saturating_sub(1));
            current_id = only;
            node = self.read_node(tx, current_id)?;
        }
        if current_id != root_id {
            trace!(
                target: "cachet_tree::merge",
                root = current_id.0,
                "promoted child to root"
            );
            if matches!(&node, Node::Leaf(leaf) if leaf.entries.is_empty()) {
                tx.mark_deleted(current_id)?;
                superblock_set_root(tx.acquire_mut(SUPERBLOCK_PAGE)?, None)?;
                self.stats.set_depth(0);
                return Ok(());
            }
            superblock_set_root(tx.acquire_mut(SUPERBLOCK_PAGE)?, Some(current_id))?;
        }
        Ok(())
    }

    /// Merges or levels the child at `parent.entries[idx]` with an
    /// adjacent sibling. The parent entry list is updated in place; the
    /// caller writes the parent page and handles root collapse.
    fn rebalance_under(
        &self,
        tx: &mut WriteTxn,
        parent: &mut InternalNode,
        idx: usize,
        child_id: PageId,
        mut child: Node,
        capacity: usize,
    ) -> Result<Rebalance> {
        let child_is_leaf = child.is_leaf();
        if idx > 0 {
            let left_id = parent.entries[idx - 1].child;
            let mut left = self.read_node(tx, left_id)?;
            if left.is_mergeable(&child, capacity) {
                left.merge(child)?;
                self.write_node(tx, left_id, &left)?;
                tx.mark_deleted(child_id)?;
                parent.remove_at(idx);
                self.note_merge(child_is_leaf, left_id, child_id);
                return Ok(Rebalance::Merged(left_id));
            }
        }
        if idx + 1 < parent.entries.len() {
            let right_id = parent.entries[idx + 1].child;
            let right = self.read_node(tx, right_id)?;
            if child.is_mergeable(&right, capacity) {
                child.merge(right)?;
                self.write_node(tx, child_id, &child)?;
                tx.mark_deleted(right_id)?;
                parent.remove_at(idx + 1);
                self.note_merge(child_is_leaf, child_id, right_id);
                return Ok(Rebalance::Merged(child_id));
            }
        }
        if idx > 0 && parent_fits_resized_separator(parent, idx, capacity) {
            let left_id = parent.entries[idx - 1].child;
            let mut left = self.read_node(tx, left_id)?;
            if let Some(separator) = left.level(&mut child, capacity) {
                parent.entries[idx].separator = separator;
                self.write_node(tx, left_id, &left)?;
                self.write_node(tx, child_id, &child)?;
                self.note_level(child_is_leaf, left_id, child_id);
                return Ok(Rebalance::Leveled);
            }
        }
        if idx + 1 < parent.entries.len() && parent_fits_resized_separator(parent, idx + 1, capacity)
        {
            let right_id = parent.entries[idx + 1].child;
            let mut right = self.read_node(tx, right_id)?;
            if let Some(separator) = child.level(&mut right, capacity) {
                parent.entries[idx + 1].separator = separator;
                self.write_node(tx, child_id, &child)?;
                self.write_node(tx, right_id, &right)?;
                self.note_level(child_is_leaf, child_id, right_id);
                return Ok(Rebalance::Leveled);
            }
        }
        self.stats.inc_levels_declined();
        Ok(Rebalance::Declined)
    }

    fn note_merge(&self, leaf: bool, into: PageId, gone: PageId) {
        if leaf {
            self.stats.inc_leaf_merges();
        } else {
            self.stats.inc_internal_merges();
        }
        trace!(
            target: "cachet_tree::merge",
            into = into.0,
            absorbed = gone.0,
            leaf,
            "merged sibling"
        );
    }

    fn note_level(&self, leaf: bool, left: PageId, right: PageId) {
        if leaf {
            self.stats.inc_leaf_levels();
        } else {
            self.stats.inc_internal_levels();
        }
        trace!(
            target: "cachet_tree::merge",
            left = left.0,
            right = right.0,
            leaf,
            "redistributed entries"
        );
    }

    // Page plumbing --------------------------------------------------------

    fn read_node(&self, tx: &WriteTxn, id: PageId) -> Result<Node> {
        Node::decode(tx.acquire(id)?)
    }

    fn read_internal(&self, tx: &WriteTxn, id: PageId) -> Result<InternalNode> {
        match self.read_node(tx, id)? {
            Node::Internal(inner) => Ok(inner),
            Node::Leaf(_) => Err(CachetError::Corruption("expected internal node")),
        }
    }

    fn write_node(&self, tx: &mut WriteTxn, id: PageId, node: &Node) -> Result<()> {
        node.encode(tx.acquire_mut(id)?)
    }

    fn measure_depth(&self) -> Result<u64> {
        let tx = self.store.begin_read(AccessMode::SnapshotRead)?;
        let superblock = tx.acquire(SUPERBLOCK_PAGE)?;
        let Some(root) = superblock_root(superblock.data())? else {
            return Ok(0);
        };
        let mut depth = 1;
        let mut current = root;
        loop {
            let page = tx.acquire(current)?;
            match Node::decode(page.data())? {
                Node::Leaf(_) => return Ok(depth),
                Node::Internal(inner) => {
                    if inner.entries.is_empty() {
                        return Err(CachetError::Corruption("internal node without entries"));
                    }
                    current = inner.entries[0].child;
                    depth += 1;
                }
            }
        }
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(CachetError::Invalid("key length out of range"));
    }
    Ok(())
}

fn validate_options(options: &TreeOptions, page_size: usize) -> Result<()> {
    if options.min_fill_percent == 0 || options.min_fill_percent > 50 {
        return Err(CachetError::Invalid("min fill percent out of range"));
    }
    // Two worst-case entries must fit one page or splits cannot terminate.
    let worst_entry = 4 + MAX_KEY_LEN + RECORD_MAX_HEADER + options.inline_max;
    if 2 * worst_entry + 16 > page_size {
        return Err(CachetError::Invalid("inline threshold too large for page"));
    }
    if options.hard_max_value < options.inline_max {
        return Err(CachetError::Invalid("hard maximum below inline threshold"));
    }
    Ok(())
}

fn internal_low(node: &Node) -> Result<Vec<u8>> {
    match node {
        Node::Internal(inner) => inner
            .entries
            .first()
            .map(|entry| entry.separator.clone())
            .ok_or(CachetError::Corruption("internal node without entries")),
        Node::Leaf(_) => Err(CachetError::Corruption("expected internal node")),
    }
}

fn as_internal(node: &Node) -> Result<&InternalNode> {
    match node {
        Node::Internal(inner) => Ok(inner),
        Node::Leaf(_) => Err(CachetError::Corruption("expected internal node")),
    }
}

fn into_internal(node: Node) -> Result<InternalNode> {
    match node {
        Node::Internal(inner) => Ok(inner),
        Node::Leaf(_) => Err(CachetError::Corruption("expected internal node")),
    }
}

fn into_leaf(node: Node) -> Result<LeafNode> {
    match node {
        Node::Leaf(leaf) => Ok(leaf),
        Node::Internal(_) => Err(CachetError::Corruption("expected leaf node")),
    }
}

/// Conservative check that replacing `parent.entries[idx].separator` with a
/// worst-case key still fits the page.
fn parent_fits_resized_separator(parent: &InternalNode, idx: usize, capacity: usize) -> bool {
    let current = parent.encoded_len();
    let old = parent.entries[idx].separator.len();
    current - old + MAX_KEY_LEN <= capacity
}

fn superblock_root(bytes: &[u8]) -> Result<Option<PageId>> {
    if bytes.len() < SB_ROOT_OFFSET + 8 {
        return Err(CachetError::Corruption("superblock truncated"));
    }
    if bytes[..4] != SUPERBLOCK_MAGIC {
        return Err(CachetError::Corruption("superblock magic mismatch"));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != SUPERBLOCK_VERSION {
        return Err(CachetError::Corruption("superblock version unsupported"));
    }
    let raw = u64::from_be_bytes(
        bytes[SB_ROOT_OFFSET..SB_ROOT_OFFSET + 8]
            .try_into()
            .expect("fixed-width slice"),
    );
    Ok(if raw == 0 { None } else { Some(PageId(raw)) })
}

fn superblock_set_root(bytes: &mut [u8], root: Option<PageId>) -> Result<()> {
    if bytes.len() < SB_ROOT_OFFSET + 8 {
        return Err(CachetError::Corruption("superblock truncated"));
    }
    let raw = root.map(|id| id.0).unwrap_or(0);
    bytes[SB_ROOT_OFFSET..SB_ROOT_OFFSET + 8].copy_from_slice(&raw.to_be_bytes());
    Ok(())
}
