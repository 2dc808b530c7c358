//! Page-manager contract consumed by the storage core, plus an in-memory
//! transactional implementation.
//!
//! The durable page manager (WAL, checkpointing, file I/O) is an external
//! collaborator; the storage core only relies on the contract expressed
//! here: transactions that acquire, allocate, and delete fixed-size pages,
//! with copy-on-write snapshot reads that never block the writer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use tracing::trace;

use crate::types::{CachetError, PageId, Result, DEFAULT_PAGE_SIZE};

/// How a transaction intends to observe pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// Mutating access through a write transaction.
    Write,
    /// Strict read: observes the latest committed state at each acquisition.
    Read,
    /// Read that tolerates slightly stale data; pinned at transaction start.
    ReadOutdatedOk,
    /// Snapshot read pinned at transaction start; never observes a commit
    /// that began after the read did.
    SnapshotRead,
}

/// Configuration for the in-memory pager.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes.
    pub page_size: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Page-manager contract consumed by the tree and blob layers.
pub trait PageStore: Send + Sync {
    /// Fixed page size shared by every page this store hands out.
    fn page_size(&self) -> usize;

    /// Opens a read transaction in the given mode.
    fn begin_read(&self, mode: AccessMode) -> Result<ReadTxn>;

    /// Opens the (single) write transaction.
    fn begin_write(&self) -> Result<WriteTxn>;

    /// Number of live data pages in the committed state, excluding the
    /// superblock. Used by tests to assert zero leakage.
    fn live_pages(&self) -> u64;
}

type PageBytes = Arc<Vec<u8>>;

struct Committed {
    /// Slot per page id; `None` marks a freed slot available for reuse.
    pages: Vec<Option<PageBytes>>,
    free: Vec<PageId>,
    commit_seq: u64,
}

struct FaultPlan {
    allocations_until_failure: Option<u64>,
    allocations_seen: u64,
}

struct StoreCore {
    page_size: usize,
    committed: RwLock<Arc<Committed>>,
    writer: Arc<Mutex<()>>,
    faults: Mutex<FaultPlan>,
}

/// In-memory transactional page store.
///
/// Single writer at a time; commits are atomic swaps of the committed
/// state, so snapshot readers are wait-free and never observe a partial
/// transaction.
pub struct MemPager {
    core: Arc<StoreCore>,
}

impl MemPager {
    /// Creates a store with a zeroed superblock at page 0.
    pub fn new(options: PagerOptions) -> Result<Self> {
        if options.page_size < 64 {
            return Err(CachetError::Invalid("page size too small"));
        }
        let superblock: PageBytes = Arc::new(vec![0u8; options.page_size]);
        let committed = Committed {
            pages: vec![Some(superblock)],
            free: Vec::new(),
            commit_seq: 0,
        };
        Ok(Self {
            core: Arc::new(StoreCore {
                page_size: options.page_size,
                committed: RwLock::new(Arc::new(committed)),
                writer: Arc::new(Mutex::new(())),
                faults: Mutex::new(FaultPlan {
                    allocations_until_failure: None,
                    allocations_seen: 0,
                }),
            }),
        })
    }

    /// Arms fault injection: the `n`-th allocation from now (1-based) fails
    /// with a storage error. Used to exercise rollback paths in tests.
    pub fn fail_allocation_after(&self, n: u64) {
        let mut plan = self.core.faults.lock();
        plan.allocations_until_failure = Some(n);
        plan.allocations_seen = 0;
    }
}

impl PageStore for MemPager {
    fn page_size(&self) -> usize {
        self.core.page_size
    }

    fn begin_read(&self, mode: AccessMode) -> Result<ReadTxn> {
        if mode == AccessMode::Write {
            return Err(CachetError::Invalid(
                "write access requires a write transaction",
            ));
        }
        let snapshot = Arc::clone(&self.core.committed.read());
        trace!(target: "cachet_pager", seq = snapshot.commit_seq, ?mode, "begin read");
        Ok(ReadTxn {
            core: Arc::clone(&self.core),
            snapshot,
            mode,
        })
    }

    fn begin_write(&self) -> Result<WriteTxn> {
        let guard = Mutex::lock_arc(&self.core.writer);
        let base = Arc::clone(&self.core.committed.read());
        trace!(target: "cachet_pager", seq = base.commit_seq, "begin write");
        Ok(WriteTxn {
            core: Arc::clone(&self.core),
            base,
            shadow: HashMap::new(),
            freed: HashSet::new(),
            appended: 0,
            _writer: guard,
        })
    }

    fn live_pages(&self) -> u64 {
        let committed = self.core.committed.read();
        let occupied = committed.pages.iter().filter(|p| p.is_some()).count();
        occupied.saturating_sub(1) as u64
    }
}

/// Immutable view of one page pinned by a read transaction.
pub struct PageRef {
    bytes: PageBytes,
}

impl PageRef {
    /// Raw page contents.
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }
}

/// Read transaction; the observed state depends on the access mode.
pub struct ReadTxn {
    core: Arc<StoreCore>,
    snapshot: Arc<Committed>,
    mode: AccessMode,
}

impl ReadTxn {
    /// Acquires a page for reading.
    pub fn acquire(&self, id: PageId) -> Result<PageRef> {
        let bytes = match self.mode {
            AccessMode::Read => {
                let latest = self.core.committed.read();
                lookup(&latest.pages, id)?
            }
            _ => lookup(&self.snapshot.pages, id)?,
        };
        Ok(PageRef { bytes })
    }

    /// The access mode this transaction was opened with.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

fn lookup(pages: &[Option<PageBytes>], id: PageId) -> Result<PageBytes> {
    let slot = pages
        .get(id.0 as usize)
        .ok_or(CachetError::Storage("page id out of range"))?;
    slot.as_ref()
        .map(Arc::clone)
        .ok_or(CachetError::Storage("page is not allocated"))
}

/// Write transaction. Dropping without `commit` rolls everything back.
pub struct WriteTxn {
    core: Arc<StoreCore>,
    base: Arc<Committed>,
    shadow: HashMap<PageId, Vec<u8>>,
    freed: HashSet<PageId>,
    /// Pages appended past the committed end of the id space.
    appended: u64,
    _writer: ArcMutexGuard<RawMutex, ()>,
}

impl WriteTxn {
    /// Fixed page size of the underlying store.
    pub fn page_size(&self) -> usize {
        self.core.page_size
    }

    /// Acquires a page for reading within this transaction, observing any
    /// uncommitted writes it already performed.
    pub fn acquire(&self, id: PageId) -> Result<&[u8]> {
        if self.freed.contains(&id) {
            return Err(CachetError::Storage("page was deleted in this txn"));
        }
        if let Some(buf) = self.shadow.get(&id) {
            return Ok(buf.as_slice());
        }
        let slot = self
            .base
            .pages
            .get(id.0 as usize)
            .ok_or(CachetError::Storage("page id out of range"))?;
        slot.as_deref()
            .map(|b| b.as_slice())
            .ok_or(CachetError::Storage("page is not allocated"))
    }

    /// Acquires a page for writing, copying it into the transaction's
    /// shadow on first touch.
    pub fn acquire_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        if self.freed.contains(&id) {
            return Err(CachetError::Storage("page was deleted in this txn"));
        }
        if !self.shadow.contains_key(&id) {
            let slot = self
                .base
                .pages
                .get(id.0 as usize)
                .ok_or(CachetError::Storage("page id out of range"))?;
            let bytes = slot
                .as_ref()
                .ok_or(CachetError::Storage("page is not allocated"))?;
            self.shadow.insert(id, bytes.as_ref().clone());
        }
        Ok(self
            .shadow
            .get_mut(&id)
            .expect("shadow entry just inserted")
            .as_mut_slice())
    }

    /// Allocates a fresh zeroed page and returns its id.
    pub fn allocate(&mut self) -> Result<PageId> {
        {
            let mut plan = self.core.faults.lock();
            if let Some(limit) = plan.allocations_until_failure {
                plan.allocations_seen += 1;
                if plan.allocations_seen >= limit {
                    plan.allocations_until_failure = None;
                    return Err(CachetError::Storage("allocation fault injected"));
                }
            }
        }
        let id = match self.base.free.iter().find(|id| !self.shadow.contains_key(*id)) {
            Some(&id) if !self.freed.contains(&id) => id,
            _ => {
                let id = PageId(self.base.pages.len() as u64 + self.appended);
                self.appended += 1;
                id
            }
        };
        self.freed.remove(&id);
        self.shadow.insert(id, vec![0u8; self.core.page_size]);
        trace!(target: "cachet_pager", page = id.0, "allocate");
        Ok(id)
    }

    /// Marks a page deleted; the slot is reclaimed at commit.
    pub fn mark_deleted(&mut self, id: PageId) -> Result<()> {
        if id.is_none() {
            return Err(CachetError::Invalid("cannot delete the superblock"));
        }
        self.shadow.remove(&id);
        self.freed.insert(id);
        trace!(target: "cachet_pager", page = id.0, "mark deleted");
        Ok(())
    }

    /// Publishes every page written in this transaction atomically.
    pub fn commit(self) -> Result<()> {
        let mut pages = self.base.pages.clone();
        let new_len = pages.len() + self.appended as usize;
        pages.resize(new_len, None);
        for (id, buf) in self.shadow {
            pages[id.0 as usize] = Some(Arc::new(buf));
        }
        let mut free: Vec<PageId> = self
            .base
            .free
            .iter()
            .copied()
            .filter(|id| pages[id.0 as usize].is_none())
            .collect();
        for id in self.freed {
            pages[id.0 as usize] = None;
            if !free.contains(&id) {
                free.push(id);
            }
        }
        let next = Committed {
            pages,
            free,
            commit_seq: self.base.commit_seq + 1,
        };
        *self.core.committed.write() = Arc::new(next);
        trace!(target: "cachet_pager", seq = self.base.commit_seq + 1, "commit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pager() -> MemPager {
        MemPager::new(PagerOptions::default()).expect("pager")
    }

    #[test]
    fn allocate_write_commit_read() -> Result<()> {
        let store = pager();
        let mut write = store.begin_write()?;
        let id = write.allocate()?;
        write.acquire_mut(id)?[0..4].copy_from_slice(&[1, 2, 3, 4]);
        write.commit()?;

        let read = store.begin_read(AccessMode::SnapshotRead)?;
        let page = read.acquire(id)?;
        assert_eq!(&page.data()[0..4], &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn dropped_transaction_rolls_back() -> Result<()> {
        let store = pager();
        let id = {
            let mut write = store.begin_write()?;
            let id = write.allocate()?;
            write.acquire_mut(id)?[0] = 9;
            id
            // dropped without commit
        };
        let read = store.begin_read(AccessMode::SnapshotRead)?;
        assert!(read.acquire(id).is_err());
        assert_eq!(store.live_pages(), 0);
        Ok(())
    }

    #[test]
    fn snapshot_read_is_pinned_across_commits() -> Result<()> {
        let store = pager();
        let id = {
            let mut write = store.begin_write()?;
            let id = write.allocate()?;
            write.acquire_mut(id)?[0] = 1;
            write.commit()?;
            id
        };
        let snapshot = store.begin_read(AccessMode::SnapshotRead)?;
        {
            let mut write = store.begin_write()?;
            write.acquire_mut(id)?[0] = 2;
            write.commit()?;
        }
        assert_eq!(snapshot.acquire(id)?.data()[0], 1);
        let strict = store.begin_read(AccessMode::Read)?;
        assert_eq!(strict.acquire(id)?.data()[0], 2);
        Ok(())
    }

    #[test]
    fn freed_pages_are_reused_and_counted() -> Result<()> {
        let store = pager();
        let id = {
            let mut write = store.begin_write()?;
            let id = write.allocate()?;
            write.commit()?;
            id
        };
        assert_eq!(store.live_pages(), 1);
        {
            let mut write = store.begin_write()?;
            write.mark_deleted(id)?;
            write.commit()?;
        }
        assert_eq!(store.live_pages(), 0);
        {
            let mut write = store.begin_write()?;
            let reused = write.allocate()?;
            assert_eq!(reused, id);
            write.commit()?;
        }
        assert_eq!(store.live_pages(), 1);
        Ok(())
    }

    #[test]
    fn allocation_fault_fires_once() -> Result<()> {
        let store = pager();
        store.fail_allocation_after(2);
        let mut write = store.begin_write()?;
        assert!(write.allocate().is_ok());
        assert!(write.allocate().is_err());
        assert!(write.allocate().is_ok());
        Ok(())
    }

    #[test]
    fn delete_then_acquire_fails_within_txn() -> Result<()> {
        let store = pager();
        let mut write = store.begin_write()?;
        let id = write.allocate()?;
        write.mark_deleted(id)?;
        assert!(write.acquire(id).is_err());
        Ok(())
    }
}
