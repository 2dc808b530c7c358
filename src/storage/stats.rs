//! Operation counters for the tree and the large-value store.
//!
//! Counters are plain relaxed atomics shared through `Arc` handles; the
//! driver receives its collector at construction time instead of touching
//! process-wide state.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Clone, Copy, Debug, Default)]
pub struct TreeStatsSnapshot {
    /// Number of modify-operations driven to completion.
    pub modify_ops: u64,
    /// Number of point lookups served.
    pub lookups: u64,
    /// Number of leaf page splits performed.
    pub leaf_splits: u64,
    /// Number of internal page splits performed.
    pub internal_splits: u64,
    /// Number of leaf page merges performed.
    pub leaf_merges: u64,
    /// Number of internal page merges performed.
    pub internal_merges: u64,
    /// Number of leaf redistribution (level) passes that moved entries.
    pub leaf_levels: u64,
    /// Number of internal redistribution (level) passes that moved entries.
    pub internal_levels: u64,
    /// Number of times an underfull node was accepted without redistribution.
    pub levels_declined: u64,
    /// Number of expired records removed as a side effect of another operation.
    pub silent_expiries: u64,
    /// Current tree depth (0 = empty, 1 = single leaf root).
    pub depth: u64,
}

/// Thread-safe statistics for the modify-operation driver.
#[derive(Default)]
pub struct TreeStats {
    modify_ops: AtomicU64,
    lookups: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    leaf_levels: AtomicU64,
    internal_levels: AtomicU64,
    levels_declined: AtomicU64,
    silent_expiries: AtomicU64,
    depth: AtomicU64,
}

impl TreeStats {
    /// Current tree depth (0 = empty tree).
    pub fn depth(&self) -> u64 {
        self.depth.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_modify_ops(&self) {
        self.modify_ops.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_lookups(&self) {
        self.lookups.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_merges(&self) {
        self.leaf_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_merges(&self) {
        self.internal_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_levels(&self) {
        self.leaf_levels.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_levels(&self) {
        self.internal_levels.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_levels_declined(&self) {
        self.levels_declined.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_silent_expiries(&self) {
        self.silent_expiries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn set_depth(&self, depth: u64) {
        self.depth.store(depth, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current counters.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            modify_ops: self.modify_ops.load(AtomicOrdering::Relaxed),
            lookups: self.lookups.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            internal_splits: self.internal_splits.load(AtomicOrdering::Relaxed),
            leaf_merges: self.leaf_merges.load(AtomicOrdering::Relaxed),
            internal_merges: self.internal_merges.load(AtomicOrdering::Relaxed),
            leaf_levels: self.leaf_levels.load(AtomicOrdering::Relaxed),
            internal_levels: self.internal_levels.load(AtomicOrdering::Relaxed),
            levels_declined: self.levels_declined.load(AtomicOrdering::Relaxed),
            silent_expiries: self.silent_expiries.load(AtomicOrdering::Relaxed),
            depth: self.depth.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits current counters to the tracing sink.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "cachet_tree::stats",
            modify_ops = snapshot.modify_ops,
            lookups = snapshot.lookups,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            leaf_levels = snapshot.leaf_levels,
            internal_levels = snapshot.internal_levels,
            levels_declined = snapshot.levels_declined,
            silent_expiries = snapshot.silent_expiries,
            depth = snapshot.depth,
            "tree stats snapshot"
        );
    }
}

/// Snapshot of large-value store statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlobStatsSnapshot {
    /// Total number of blob pages allocated.
    pub pages_allocated: u64,
    /// Total number of blob pages freed.
    pub pages_freed: u64,
    /// Total bytes written into blob leaves.
    pub bytes_written: u64,
    /// Total bytes read out of blob leaves.
    pub bytes_read: u64,
    /// Number of times a synthetic top level was added.
    pub level_adds: u64,
    /// Number of times a top level was collapsed away.
    pub level_collapses: u64,
    /// Number of prepends that shifted the inlined top-level ids.
    pub head_shifts: u64,
}

impl BlobStatsSnapshot {
    /// Current number of live blob pages.
    pub fn live_pages(&self) -> i64 {
        self.pages_allocated as i64 - self.pages_freed as i64
    }
}

/// Thread-safe statistics for the large-value store.
#[derive(Default)]
pub struct BlobStats {
    pages_allocated: AtomicU64,
    pages_freed: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    level_adds: AtomicU64,
    level_collapses: AtomicU64,
    head_shifts: AtomicU64,
}

impl BlobStats {
    pub(crate) fn add_pages_allocated(&self, delta: u64) {
        if delta != 0 {
            self.pages_allocated.fetch_add(delta, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn add_pages_freed(&self, delta: u64) {
        if delta != 0 {
            self.pages_freed.fetch_add(delta, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn add_bytes_written(&self, delta: u64) {
        if delta != 0 {
            self.bytes_written.fetch_add(delta, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn add_bytes_read(&self, delta: u64) {
        if delta != 0 {
            self.bytes_read.fetch_add(delta, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn inc_level_adds(&self) {
        self.level_adds.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_level_collapses(&self) {
        self.level_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_head_shifts(&self) {
        self.head_shifts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current counters.
    pub fn snapshot(&self) -> BlobStatsSnapshot {
        BlobStatsSnapshot {
            pages_allocated: self.pages_allocated.load(AtomicOrdering::Relaxed),
            pages_freed: self.pages_freed.load(AtomicOrdering::Relaxed),
            bytes_written: self.bytes_written.load(AtomicOrdering::Relaxed),
            bytes_read: self.bytes_read.load(AtomicOrdering::Relaxed),
            level_adds: self.level_adds.load(AtomicOrdering::Relaxed),
            level_collapses: self.level_collapses.load(AtomicOrdering::Relaxed),
            head_shifts: self.head_shifts.load(AtomicOrdering::Relaxed),
        }
    }
}
