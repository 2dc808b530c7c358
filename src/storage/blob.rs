//! Large-value tree: side storage for values too big for one leaf entry.
//!
//! One large value is a flat byte sequence stored across blob leaf pages,
//! reachable through up to [`MAX_HEIGHT`] levels of bounded-fan-out
//! internal pages. The owning record embeds a [`BlobRef`] carrying the
//! top-level child ids plus a logical `(offset, len)` window into the id
//! space; the offset is not page-aligned and determines where live data
//! begins within the first leaf.
//!
//! Growth at the tail extends the rightmost subtree and appends top-level
//! ids; growth at the head first reuses room before the logical offset,
//! otherwise shifts the inlined ids rightward (adding one synthetic top
//! level when they no longer fit within the record's ref limit). Shrinks
//! release pages from either end and collapse levels as soon as the span
//! fits in fewer slots.

use std::ops::Range;
use std::sync::Arc;

use tracing::trace;

use crate::pager::{ReadTxn, WriteTxn};
use crate::primitives::bytes::SliceCursor;
use crate::storage::stats::BlobStats;
use crate::storage::ValueSupplier;
use crate::types::{CachetError, PageId, Result, PAGE_ID_LEN};

const BLOB_LEAF_TAG: u8 = 0xB1;
const BLOB_NODE_TAG: u8 = 0xB2;
const BLOB_LEAF_HEADER_LEN: usize = 2;
const BLOB_NODE_HEADER_LEN: usize = 4;

/// Fixed prefix of an encoded [`BlobRef`]: offset, length, id count.
pub const BLOB_REF_FIXED_LEN: usize = 8 + 8 + 1;

/// Maximum number of page levels a blob tree may have.
pub const MAX_HEIGHT: u32 = 6;

/// Reference to a large value, embedded in the owning record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlobRef {
    /// Logical start of live data within the id space covered by `roots`.
    pub offset: u64,
    /// Logical value length in bytes.
    pub len: u64,
    /// Ordered top-level child ids; never more than the ref limit allows.
    pub roots: Vec<PageId>,
}

impl BlobRef {
    /// Serialized footprint of this reference.
    pub fn encoded_len(&self) -> usize {
        BLOB_REF_FIXED_LEN + self.roots.len() * PAGE_ID_LEN
    }

    /// Appends the encoded reference to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
        out.push(self.roots.len() as u8);
        for root in &self.roots {
            out.extend_from_slice(&root.0.to_be_bytes());
        }
    }

    /// Decodes a reference from exactly `buf`.
    pub fn decode(buf: &[u8]) -> Result<BlobRef> {
        let mut cursor = SliceCursor::new(buf);
        let offset = cursor.read_u64_be("blob ref offset truncated")?;
        let len = cursor.read_u64_be("blob ref length truncated")?;
        let count = cursor.read_u8("blob ref id count truncated")? as usize;
        let mut roots = Vec::with_capacity(count);
        for _ in 0..count {
            let id = PageId(cursor.read_u64_be("blob ref id truncated")?);
            if id.is_none() {
                return Err(CachetError::Corruption("blob ref id is zero"));
            }
            roots.push(id);
        }
        if cursor.remaining() != 0 {
            return Err(CachetError::Corruption("blob ref has trailing bytes"));
        }
        Ok(BlobRef { offset, len, roots })
    }
}

/// Which part of the structure an acquisition needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SliceMode {
    /// Every leaf in the live window.
    All,
    /// Only the rightmost live byte (append boundary probe).
    Tail,
    /// Only the leftmost live byte (prepend boundary probe).
    Head,
    /// Structure only, no payload read; used before deletion.
    ForDelete,
}

/// An acquired large value: the evolving reference plus, for deletions,
/// the full set of structure pages.
#[derive(Debug)]
pub struct BlobHandle {
    blob_ref: BlobRef,
    mode: SliceMode,
    pages: Vec<PageId>,
}

impl BlobHandle {
    /// The current reference (reflects any growth/shrink performed).
    pub fn blob_ref(&self) -> &BlobRef {
        &self.blob_ref
    }

    /// Mutable access for the blob tree's own operations.
    pub(crate) fn blob_ref_mut(&mut self) -> &mut BlobRef {
        &mut self.blob_ref
    }

    /// Consumes the handle, yielding the reference for re-embedding.
    pub fn into_ref(self) -> BlobRef {
        self.blob_ref
    }
}

/// One leaf's live byte range within a larger logical window; the unit of
/// scatter/gather access.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafSegment {
    /// Blob leaf page holding the bytes.
    pub page: PageId,
    /// Byte range within the page buffer (header excluded already).
    pub range: Range<usize>,
    /// Logical position of the segment's first byte within the value.
    pub logical_pos: u64,
}

enum PageView<'a> {
    Read(&'a ReadTxn),
    Write(&'a WriteTxn),
}

impl<'a> PageView<'a> {
    fn with_page<R>(&self, id: PageId, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        match self {
            PageView::Read(tx) => {
                let page = tx.acquire(id)?;
                f(page.data())
            }
            PageView::Write(tx) => f(tx.acquire(id)?),
        }
    }
}

/// Fan-out and leaf-capacity geometry shared by every blob tree page.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    /// Payload bytes per blob leaf page.
    pub leaf_cap: usize,
    /// Child ids per blob internal page.
    pub fan_out: usize,
}

impl Geometry {
    /// Derives the geometry for a page size.
    pub fn for_page_size(page_size: usize) -> Geometry {
        Geometry {
            leaf_cap: page_size - BLOB_LEAF_HEADER_LEN,
            fan_out: (page_size - BLOB_NODE_HEADER_LEN) / PAGE_ID_LEN,
        }
    }

    /// Bytes covered by one top-level id at `height` (1 = ids are leaves).
    pub fn unit(&self, height: u32) -> u64 {
        self.leaf_cap as u64 * (self.fan_out as u64).pow(height - 1)
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Large-value storage manager; stateless apart from geometry and metrics.
pub struct BlobTree {
    geo: Geometry,
    stats: Arc<BlobStats>,
}

impl BlobTree {
    /// Creates a blob tree for the given page size.
    pub fn new(page_size: usize, stats: Arc<BlobStats>) -> BlobTree {
        BlobTree {
            geo: Geometry::for_page_size(page_size),
            stats,
        }
    }

    /// The geometry in effect.
    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    /// Metrics handle.
    pub fn stats(&self) -> Arc<BlobStats> {
        Arc::clone(&self.stats)
    }

    fn max_roots(&self, ref_limit: usize) -> Result<usize> {
        if ref_limit < BLOB_REF_FIXED_LEN + PAGE_ID_LEN {
            return Err(CachetError::Invalid("ref limit below one inlined id"));
        }
        Ok((ref_limit - BLOB_REF_FIXED_LEN) / PAGE_ID_LEN)
    }

    /// Reconstructs the height from the reference: the minimal number of
    /// levels whose per-id span makes the id count come out exactly.
    pub fn height_for(&self, blob_ref: &BlobRef) -> Result<u32> {
        if blob_ref.len == 0 || blob_ref.roots.is_empty() {
            return Err(CachetError::Corruption("blob ref covers no data"));
        }
        let span = blob_ref.offset + blob_ref.len;
        for height in 1..=MAX_HEIGHT {
            if ceil_div(span, self.geo.unit(height)) == blob_ref.roots.len() as u64 {
                return Ok(height);
            }
        }
        Err(CachetError::Corruption("blob ref height out of range"))
    }

    /// Allocates a zero-initialized tree for `logical_size` bytes.
    pub fn allocate(
        &self,
        tx: &mut WriteTxn,
        logical_size: u64,
        ref_limit: usize,
    ) -> Result<BlobRef> {
        if logical_size == 0 {
            return Err(CachetError::Invalid("blob allocation of zero bytes"));
        }
        let max_roots = self.max_roots(ref_limit)? as u64;
        let mut height = 1;
        while ceil_div(logical_size, self.geo.unit(height)) > max_roots {
            height += 1;
            if height > MAX_HEIGHT {
                return Err(CachetError::Invalid("blob exceeds maximum height"));
            }
        }
        let unit = self.geo.unit(height);
        let count = ceil_div(logical_size, unit);
        let mut roots = Vec::with_capacity(count as usize);
        for idx in 0..count {
            let hi = (logical_size - idx * unit).min(unit);
            roots.push(self.build_subtree(tx, height, 0, hi)?);
        }
        trace!(
            target: "cachet_blob",
            len = logical_size,
            height,
            roots = roots.len(),
            "allocate"
        );
        Ok(BlobRef {
            offset: 0,
            len: logical_size,
            roots,
        })
    }

    /// Acquires the slice of the structure an operation needs.
    pub fn acquire(
        &self,
        tx: &WriteTxn,
        blob_ref: &BlobRef,
        mode: SliceMode,
    ) -> Result<BlobHandle> {
        let height = self.height_for(blob_ref)?;
        let pages = match mode {
            SliceMode::ForDelete => {
                let view = PageView::Write(tx);
                let mut pages = Vec::new();
                for root in &blob_ref.roots {
                    self.collect_subtree(&view, *root, height, &mut pages)?;
                }
                pages
            }
            SliceMode::Head => {
                // Probe the leftmost live byte so a missing structure
                // surfaces before the operation commits to anything.
                let view = PageView::Write(tx);
                let (leaf, _) = self.leaf_at(&view, blob_ref, height, blob_ref.offset)?;
                vec![leaf]
            }
            SliceMode::Tail => {
                let view = PageView::Write(tx);
                let last = blob_ref.offset + blob_ref.len - 1;
                let (leaf, _) = self.leaf_at(&view, blob_ref, height, last)?;
                vec![leaf]
            }
            SliceMode::All => Vec::new(),
        };
        Ok(BlobHandle {
            blob_ref: blob_ref.clone(),
            mode,
            pages,
        })
    }

    /// Marks every page of the structure deleted. Structure pages are read,
    /// payload bytes are not.
    pub fn mark_deleted(&self, tx: &mut WriteTxn, handle: BlobHandle) -> Result<()> {
        let pages = if handle.mode == SliceMode::ForDelete {
            handle.pages
        } else {
            let height = self.height_for(&handle.blob_ref)?;
            let view = PageView::Write(tx);
            let mut pages = Vec::new();
            for root in &handle.blob_ref.roots {
                self.collect_subtree(&view, *root, height, &mut pages)?;
            }
            pages
        };
        let count = pages.len() as u64;
        for page in pages {
            tx.mark_deleted(page)?;
        }
        self.stats.add_pages_freed(count);
        trace!(target: "cachet_blob", pages = count, "mark deleted");
        Ok(())
    }

    /// Writes `bytes` into the leaves covering logical positions
    /// `[pos, pos + bytes.len())`. Growth must precede via append/prepend.
    pub fn fill_at(
        &self,
        tx: &mut WriteTxn,
        blob_ref: &BlobRef,
        pos: u64,
        bytes: &[u8],
    ) -> Result<()> {
        if pos + bytes.len() as u64 > blob_ref.len {
            return Err(CachetError::Invalid("fill beyond blob length"));
        }
        let height = self.height_for(blob_ref)?;
        let mut written = 0usize;
        while written < bytes.len() {
            let phys = blob_ref.offset + pos + written as u64;
            let (leaf, in_leaf) = self.leaf_at(&PageView::Write(tx), blob_ref, height, phys)?;
            let chunk = (bytes.len() - written).min(self.geo.leaf_cap - in_leaf);
            let buf = tx.acquire_mut(leaf)?;
            if buf[0] != BLOB_LEAF_TAG {
                return Err(CachetError::Corruption("expected blob leaf page"));
            }
            let start = BLOB_LEAF_HEADER_LEN + in_leaf;
            buf[start..start + chunk].copy_from_slice(&bytes[written..written + chunk]);
            written += chunk;
        }
        self.stats.add_bytes_written(bytes.len() as u64);
        Ok(())
    }

    /// Streams `len` bytes from `supplier` into logical positions
    /// `[pos, pos + len)`, window by window. Returns `Ok(false)` when the
    /// supplier fails mid-transfer; the caller owns the rollback.
    pub fn fill_from_supplier(
        &self,
        tx: &mut WriteTxn,
        blob_ref: &BlobRef,
        pos: u64,
        len: u64,
        supplier: &mut dyn ValueSupplier,
    ) -> Result<bool> {
        let segments = self.segments(tx, blob_ref, pos, len)?;
        let mut delivered = 0u64;
        for segment in segments {
            let buf = tx.acquire_mut(segment.page)?;
            if buf[0] != BLOB_LEAF_TAG {
                return Err(CachetError::Corruption("expected blob leaf page"));
            }
            if supplier.fill(&mut buf[segment.range.clone()]).is_err() {
                trace!(
                    target: "cachet_blob",
                    delivered,
                    total = len,
                    "supplier failed mid-transfer"
                );
                return Ok(false);
            }
            delivered += segment.range.len() as u64;
        }
        self.stats.add_bytes_written(delivered);
        Ok(true)
    }

    /// Scatter/gather map: one entry per leaf overlapping
    /// `[pos, pos + len)` of the value.
    pub fn segments(
        &self,
        tx: &WriteTxn,
        blob_ref: &BlobRef,
        pos: u64,
        len: u64,
    ) -> Result<Vec<LeafSegment>> {
        if pos + len > blob_ref.len {
            return Err(CachetError::Invalid("segment range beyond blob length"));
        }
        let height = self.height_for(blob_ref)?;
        let view = PageView::Write(tx);
        let mut segments = Vec::new();
        let mut covered = 0u64;
        while covered < len {
            let logical = pos + covered;
            let phys = blob_ref.offset + logical;
            let (leaf, in_leaf) = self.leaf_at(&view, blob_ref, height, phys)?;
            let chunk = (len - covered).min((self.geo.leaf_cap - in_leaf) as u64) as usize;
            let start = BLOB_LEAF_HEADER_LEN + in_leaf;
            segments.push(LeafSegment {
                page: leaf,
                range: start..start + chunk,
                logical_pos: logical,
            });
            covered += chunk as u64;
        }
        Ok(segments)
    }

    /// Reads `[pos, pos + len)` of the value into `dst` under a read
    /// transaction.
    pub fn read_range(
        &self,
        tx: &ReadTxn,
        blob_ref: &BlobRef,
        pos: u64,
        len: u64,
        dst: &mut Vec<u8>,
    ) -> Result<()> {
        if pos + len > blob_ref.len {
            return Err(CachetError::Invalid("read beyond blob length"));
        }
        let height = self.height_for(blob_ref)?;
        let view = PageView::Read(tx);
        dst.reserve(len as usize);
        let mut covered = 0u64;
        while covered < len {
            let phys = blob_ref.offset + pos + covered;
            let (leaf, in_leaf) = self.leaf_at(&view, blob_ref, height, phys)?;
            let chunk = (len - covered).min((self.geo.leaf_cap - in_leaf) as u64) as usize;
            view.with_page(leaf, |bytes| {
                if bytes[0] != BLOB_LEAF_TAG {
                    return Err(CachetError::Corruption("expected blob leaf page"));
                }
                let start = BLOB_LEAF_HEADER_LEN + in_leaf;
                dst.extend_from_slice(&bytes[start..start + chunk]);
                Ok(())
            })?;
            covered += chunk as u64;
        }
        self.stats.add_bytes_read(len);
        Ok(())
    }

    /// Grows the value by `extra` bytes at the tail, allocating pages and
    /// adding a level when the inlined ids would overflow the ref limit.
    /// Returns the change in the reference's serialized footprint.
    pub fn append(
        &self,
        tx: &mut WriteTxn,
        handle: &mut BlobHandle,
        extra: u64,
        ref_limit: usize,
    ) -> Result<i64> {
        if extra == 0 {
            return Ok(0);
        }
        let max_roots = self.max_roots(ref_limit)? as u64;
        let blob_ref = handle.blob_ref_mut();
        let old_ref_len = blob_ref.encoded_len() as i64;
        let mut height = self.height_for(blob_ref)?;
        let end = blob_ref.offset + blob_ref.len;
        let new_end = end + extra;
        while ceil_div(new_end, self.geo.unit(height)) > max_roots {
            self.add_level(tx, blob_ref, &mut height)?;
        }
        let unit = self.geo.unit(height);
        let last_old = ((end - 1) / unit) as usize;
        let lo_local = end - last_old as u64 * unit;
        let hi_local = (new_end - last_old as u64 * unit).min(unit);
        if hi_local > lo_local {
            self.ensure_range(tx, blob_ref.roots[last_old], height, lo_local, hi_local)?;
        }
        let needed = ceil_div(new_end, unit) as usize;
        for idx in blob_ref.roots.len()..needed {
            let hi = (new_end - idx as u64 * unit).min(unit);
            let root = self.build_subtree(tx, height, 0, hi)?;
            blob_ref.roots.push(root);
        }
        blob_ref.len += extra;
        trace!(
            target: "cachet_blob",
            extra,
            len = blob_ref.len,
            height,
            roots = blob_ref.roots.len(),
            "append"
        );
        Ok(blob_ref.encoded_len() as i64 - old_ref_len)
    }

    /// Grows the value by `extra` bytes at the head, shifting the logical
    /// start backward. Room before offset zero within the current top-level
    /// span is reused; otherwise the inlined ids shift rightward, adding a
    /// level when they no longer fit.
    pub fn prepend(
        &self,
        tx: &mut WriteTxn,
        handle: &mut BlobHandle,
        extra: u64,
        ref_limit: usize,
    ) -> Result<i64> {
        if extra == 0 {
            return Ok(0);
        }
        let max_roots = self.max_roots(ref_limit)? as u64;
        let blob_ref = handle.blob_ref_mut();
        let old_ref_len = blob_ref.encoded_len() as i64;
        let mut height = self.height_for(blob_ref)?;
        loop {
            if extra <= blob_ref.offset {
                // Room exists before offset zero in the current span.
                let new_offset = blob_ref.offset - extra;
                self.ensure_range(tx, blob_ref.roots[0], height, new_offset, blob_ref.offset)?;
                blob_ref.offset = new_offset;
                blob_ref.len += extra;
                break;
            }
            let unit = self.geo.unit(height);
            let shift = ceil_div(extra - blob_ref.offset, unit);
            if blob_ref.roots.len() as u64 + shift > max_roots {
                self.add_level(tx, blob_ref, &mut height)?;
                continue;
            }
            // Shift the inlined ids rightward by building new head units.
            let new_offset = blob_ref.offset + shift * unit - extra;
            let mut new_roots = Vec::with_capacity(blob_ref.roots.len() + shift as usize);
            for j in 0..shift {
                let lo = if j == 0 { new_offset } else { 0 };
                new_roots.push(self.build_subtree(tx, height, lo, unit)?);
            }
            let old_offset = blob_ref.offset;
            new_roots.append(&mut blob_ref.roots);
            blob_ref.roots = new_roots;
            if old_offset > 0 {
                // The old first unit's leading bytes become live data.
                let first_old = blob_ref.roots[shift as usize];
                self.ensure_range(tx, first_old, height, 0, old_offset)?;
            }
            blob_ref.offset = new_offset;
            blob_ref.len += extra;
            self.stats.inc_head_shifts();
            break;
        }
        trace!(
            target: "cachet_blob",
            extra,
            len = blob_ref.len,
            offset = blob_ref.offset,
            height,
            roots = blob_ref.roots.len(),
            "prepend"
        );
        Ok(blob_ref.encoded_len() as i64 - old_ref_len)
    }

    /// Shrinks the value by `cut` bytes from the tail, releasing now-unused
    /// pages and collapsing levels when the span fits in fewer slots.
    pub fn unappend(
        &self,
        tx: &mut WriteTxn,
        handle: &mut BlobHandle,
        cut: u64,
        ref_limit: usize,
    ) -> Result<i64> {
        if cut == 0 {
            return Ok(0);
        }
        let blob_ref = handle.blob_ref_mut();
        if cut >= blob_ref.len {
            return Err(CachetError::Invalid("unappend would empty the blob"));
        }
        let old_ref_len = blob_ref.encoded_len() as i64;
        let mut height = self.height_for(blob_ref)?;
        let unit = self.geo.unit(height);
        let new_end = blob_ref.offset + blob_ref.len - cut;
        let keep = ceil_div(new_end, unit) as usize;
        for idx in keep..blob_ref.roots.len() {
            self.free_subtree(tx, blob_ref.roots[idx], height)?;
        }
        blob_ref.roots.truncate(keep);
        let keep_until = new_end - (keep as u64 - 1) * unit;
        if keep_until < unit {
            self.free_above(tx, blob_ref.roots[keep - 1], height, keep_until)?;
        }
        blob_ref.len -= cut;
        self.collapse_levels(tx, blob_ref, &mut height, ref_limit)?;
        trace!(
            target: "cachet_blob",
            cut,
            len = blob_ref.len,
            height,
            roots = blob_ref.roots.len(),
            "unappend"
        );
        Ok(blob_ref.encoded_len() as i64 - old_ref_len)
    }

    /// Shrinks the value by `cut` bytes from the head, re-shifting the
    /// top-level ids leftward and collapsing levels where possible.
    pub fn unprepend(
        &self,
        tx: &mut WriteTxn,
        handle: &mut BlobHandle,
        cut: u64,
        ref_limit: usize,
    ) -> Result<i64> {
        if cut == 0 {
            return Ok(0);
        }
        let blob_ref = handle.blob_ref_mut();
        if cut >= blob_ref.len {
            return Err(CachetError::Invalid("unprepend would empty the blob"));
        }
        let old_ref_len = blob_ref.encoded_len() as i64;
        let mut height = self.height_for(blob_ref)?;
        let unit = self.geo.unit(height);
        let new_offset = blob_ref.offset + cut;
        let drop_units = (new_offset / unit) as usize;
        for idx in 0..drop_units {
            self.free_subtree(tx, blob_ref.roots[idx], height)?;
        }
        blob_ref.roots.drain(..drop_units);
        let local_offset = new_offset - drop_units as u64 * unit;
        if local_offset > 0 {
            self.free_below(tx, blob_ref.roots[0], height, local_offset)?;
        }
        blob_ref.offset = local_offset;
        blob_ref.len -= cut;
        self.collapse_levels(tx, blob_ref, &mut height, ref_limit)?;
        trace!(
            target: "cachet_blob",
            cut,
            len = blob_ref.len,
            offset = blob_ref.offset,
            height,
            roots = blob_ref.roots.len(),
            "unprepend"
        );
        Ok(blob_ref.encoded_len() as i64 - old_ref_len)
    }

    // Internal mechanics ----------------------------------------------------

    fn alloc_leaf(&self, tx: &mut WriteTxn) -> Result<PageId> {
        let id = tx.allocate()?;
        let buf = tx.acquire_mut(id)?;
        buf[0] = BLOB_LEAF_TAG;
        self.stats.add_pages_allocated(1);
        Ok(id)
    }

    fn alloc_node(&self, tx: &mut WriteTxn, slots: &[PageId]) -> Result<PageId> {
        let id = tx.allocate()?;
        self.write_node(tx, id, slots, true)?;
        self.stats.add_pages_allocated(1);
        Ok(id)
    }

    fn write_node(
        &self,
        tx: &mut WriteTxn,
        id: PageId,
        slots: &[PageId],
        fresh: bool,
    ) -> Result<()> {
        if slots.len() > self.geo.fan_out {
            return Err(CachetError::Invalid("blob node fan-out exceeded"));
        }
        let buf = tx.acquire_mut(id)?;
        if !fresh && buf[0] != BLOB_NODE_TAG {
            return Err(CachetError::Corruption("expected blob internal page"));
        }
        buf[0] = BLOB_NODE_TAG;
        buf[1] = 0;
        buf[2..4].copy_from_slice(&(slots.len() as u16).to_be_bytes());
        for (idx, slot) in slots.iter().enumerate() {
            let at = BLOB_NODE_HEADER_LEN + idx * PAGE_ID_LEN;
            buf[at..at + PAGE_ID_LEN].copy_from_slice(&slot.0.to_be_bytes());
        }
        Ok(())
    }

    fn node_slots(&self, bytes: &[u8]) -> Result<Vec<PageId>> {
        let mut cursor = SliceCursor::new(bytes);
        let tag = cursor.read_u8("blob node tag truncated")?;
        if tag != BLOB_NODE_TAG {
            return Err(CachetError::Corruption("expected blob internal page"));
        }
        let _pad = cursor.read_u8("blob node header truncated")?;
        let count = cursor.read_u16_be("blob node count truncated")? as usize;
        if count > self.geo.fan_out {
            return Err(CachetError::Corruption("blob node count exceeds fan-out"));
        }
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(PageId(cursor.read_u64_be("blob node slot truncated")?));
        }
        Ok(slots)
    }

    /// Builds a fresh subtree of `height` levels whose live local byte
    /// range is `[lo, hi)`; pages outside the range are not allocated.
    /// Children are built before their parent.
    fn build_subtree(&self, tx: &mut WriteTxn, height: u32, lo: u64, hi: u64) -> Result<PageId> {
        debug_assert!(lo < hi && hi <= self.geo.unit(height));
        if height == 1 {
            return self.alloc_leaf(tx);
        }
        let child_unit = self.geo.unit(height - 1);
        let first = (lo / child_unit) as usize;
        let last = ((hi - 1) / child_unit) as usize;
        let mut slots = vec![PageId::NONE; last + 1];
        for (idx, slot) in slots.iter_mut().enumerate().take(last + 1).skip(first) {
            let base = idx as u64 * child_unit;
            let child_lo = lo.saturating_sub(base);
            let child_hi = (hi - base).min(child_unit);
            *slot = self.build_subtree(tx, height - 1, child_lo, child_hi)?;
        }
        self.alloc_node(tx, &slots)
    }

    /// Allocates any missing pages covering local range `[lo, hi)` in an
    /// existing subtree.
    fn ensure_range(
        &self,
        tx: &mut WriteTxn,
        node: PageId,
        height: u32,
        lo: u64,
        hi: u64,
    ) -> Result<()> {
        if height == 1 || lo >= hi {
            return Ok(());
        }
        let mut slots = self.node_slots(tx.acquire(node)?)?;
        let child_unit = self.geo.unit(height - 1);
        let first = (lo / child_unit) as usize;
        let last = ((hi - 1) / child_unit) as usize;
        if slots.len() < last + 1 {
            slots.resize(last + 1, PageId::NONE);
        }
        for idx in first..=last {
            let base = idx as u64 * child_unit;
            let child_lo = lo.saturating_sub(base);
            let child_hi = (hi - base).min(child_unit);
            if slots[idx].is_none() {
                slots[idx] = self.build_subtree(tx, height - 1, child_lo, child_hi)?;
            } else {
                self.ensure_range(tx, slots[idx], height - 1, child_lo, child_hi)?;
            }
        }
        self.write_node(tx, node, &slots, false)
    }

    /// Frees every page of the subtree.
    fn free_subtree(&self, tx: &mut WriteTxn, node: PageId, height: u32) -> Result<()> {
        if height > 1 {
            let slots = self.node_slots(tx.acquire(node)?)?;
            for slot in slots {
                if !slot.is_none() {
                    self.free_subtree(tx, slot, height - 1)?;
                }
            }
        }
        tx.mark_deleted(node)?;
        self.stats.add_pages_freed(1);
        Ok(())
    }

    /// Frees pages covering local bytes `>= keep_until` within the subtree.
    fn free_above(&self, tx: &mut WriteTxn, node: PageId, height: u32, keep_until: u64) -> Result<()> {
        debug_assert!(keep_until > 0);
        if height == 1 {
            return Ok(());
        }
        let mut slots = self.node_slots(tx.acquire(node)?)?;
        let child_unit = self.geo.unit(height - 1);
        let boundary = ((keep_until - 1) / child_unit) as usize;
        for idx in (boundary + 1)..slots.len() {
            if !slots[idx].is_none() {
                self.free_subtree(tx, slots[idx], height - 1)?;
            }
        }
        if slots.len() > boundary + 1 {
            slots.truncate(boundary + 1);
        }
        let child_keep = keep_until - boundary as u64 * child_unit;
        if child_keep < child_unit && boundary < slots.len() && !slots[boundary].is_none() {
            self.free_above(tx, slots[boundary], height - 1, child_keep)?;
        }
        self.write_node(tx, node, &slots, false)
    }

    /// Frees pages covering local bytes `< keep_from` within the subtree.
    fn free_below(&self, tx: &mut WriteTxn, node: PageId, height: u32, keep_from: u64) -> Result<()> {
        if height == 1 || keep_from == 0 {
            return Ok(());
        }
        let mut slots = self.node_slots(tx.acquire(node)?)?;
        let child_unit = self.geo.unit(height - 1);
        let first_live = (keep_from / child_unit) as usize;
        let take_count = first_live.min(slots.len());
        for slot in slots.iter_mut().take(take_count) {
            if !slot.is_none() {
                self.free_subtree(tx, *slot, height - 1)?;
                *slot = PageId::NONE;
            }
        }
        let child_keep = keep_from - (first_live as u64) * child_unit;
        if child_keep > 0 && first_live < slots.len() && !slots[first_live].is_none() {
            self.free_below(tx, slots[first_live], height - 1, child_keep)?;
        }
        self.write_node(tx, node, &slots, false)
    }

    /// Introduces one synthetic top level holding the current ids.
    fn add_level(&self, tx: &mut WriteTxn, blob_ref: &mut BlobRef, height: &mut u32) -> Result<()> {
        if *height >= MAX_HEIGHT {
            return Err(CachetError::Invalid("blob exceeds maximum height"));
        }
        let mut parents = Vec::with_capacity(ceil_div(
            blob_ref.roots.len() as u64,
            self.geo.fan_out as u64,
        ) as usize);
        for chunk in blob_ref.roots.chunks(self.geo.fan_out) {
            parents.push(self.alloc_node(tx, chunk)?);
        }
        blob_ref.roots = parents;
        *height += 1;
        self.stats.inc_level_adds();
        trace!(
            target: "cachet_blob",
            height = *height,
            roots = blob_ref.roots.len(),
            "level added"
        );
        Ok(())
    }

    /// Collapses top levels while the span fits within the ref limit one
    /// level down, re-shifting leading unused slots into the offset.
    fn collapse_levels(
        &self,
        tx: &mut WriteTxn,
        blob_ref: &mut BlobRef,
        height: &mut u32,
        ref_limit: usize,
    ) -> Result<u32> {
        let max_roots = self.max_roots(ref_limit)?;
        loop {
            if *height <= 1 {
                break;
            }
            let child_unit = self.geo.unit(*height - 1);
            let mut children: Vec<PageId> = Vec::new();
            for (idx, root) in blob_ref.roots.iter().enumerate() {
                let mut slots = self.node_slots(tx.acquire(*root)?)?;
                if idx + 1 < blob_ref.roots.len() {
                    slots.resize(self.geo.fan_out, PageId::NONE);
                }
                children.append(&mut slots);
            }
            let lead = children.iter().take_while(|id| id.is_none()).count();
            while children.last().is_some_and(|id| id.is_none()) {
                children.pop();
            }
            let live = &children[lead..];
            if live.len() > max_roots {
                break;
            }
            if live.iter().any(|id| id.is_none()) {
                return Err(CachetError::Corruption("blob id space has interior hole"));
            }
            for root in &blob_ref.roots {
                tx.mark_deleted(*root)?;
            }
            self.stats.add_pages_freed(blob_ref.roots.len() as u64);
            blob_ref.offset -= lead as u64 * child_unit;
            blob_ref.roots = live.to_vec();
            *height -= 1;
            self.stats.inc_level_collapses();
            trace!(
                target: "cachet_blob",
                height = *height,
                roots = blob_ref.roots.len(),
                "level collapsed"
            );
        }
        Ok(*height)
    }

    /// Descends to the leaf covering physical position `phys` of the id
    /// space, returning the leaf page and the in-leaf byte offset.
    fn leaf_at(
        &self,
        view: &PageView<'_>,
        blob_ref: &BlobRef,
        height: u32,
        phys: u64,
    ) -> Result<(PageId, usize)> {
        let unit = self.geo.unit(height);
        let root_idx = (phys / unit) as usize;
        if root_idx >= blob_ref.roots.len() {
            return Err(CachetError::Corruption("blob position beyond id space"));
        }
        let mut node = blob_ref.roots[root_idx];
        let mut local = phys - root_idx as u64 * unit;
        let mut level = height;
        while level > 1 {
            let child_unit = self.geo.unit(level - 1);
            let idx = (local / child_unit) as usize;
            let slots = view.with_page(node, |bytes| self.node_slots(bytes))?;
            let child = slots
                .get(idx)
                .copied()
                .ok_or(CachetError::Corruption("blob child slot out of range"))?;
            if child.is_none() {
                return Err(CachetError::Corruption("blob child slot unallocated"));
            }
            node = child;
            local -= idx as u64 * child_unit;
            level -= 1;
        }
        Ok((node, local as usize))
    }

    fn collect_subtree(
        &self,
        view: &PageView<'_>,
        node: PageId,
        height: u32,
        out: &mut Vec<PageId>,
    ) -> Result<()> {
        if height > 1 {
            let slots = view.with_page(node, |bytes| self.node_slots(bytes))?;
            for slot in slots {
                if !slot.is_none() {
                    self.collect_subtree(view, slot, height - 1, out)?;
                }
            }
        }
        out.push(node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{AccessMode, MemPager, PageStore, PagerOptions};
    use crate::storage::SliceSupplier;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const SMALL_PAGE: usize = 128;
    // With 128-byte pages: leaf_cap = 126, fan_out = 15.
    const WIDE_LIMIT: usize = BLOB_REF_FIXED_LEN + 27 * PAGE_ID_LEN;
    const NARROW_LIMIT: usize = BLOB_REF_FIXED_LEN + 3 * PAGE_ID_LEN;

    fn small_store() -> (MemPager, BlobTree) {
        let pager = MemPager::new(PagerOptions {
            page_size: SMALL_PAGE,
        })
        .expect("pager");
        let tree = BlobTree::new(SMALL_PAGE, Arc::new(BlobStats::default()));
        (pager, tree)
    }

    fn write_all(
        pager: &MemPager,
        tree: &BlobTree,
        bytes: &[u8],
        ref_limit: usize,
    ) -> BlobRef {
        let mut tx = pager.begin_write().expect("write txn");
        let blob_ref = tree
            .allocate(&mut tx, bytes.len() as u64, ref_limit)
            .expect("allocate");
        tree.fill_at(&mut tx, &blob_ref, 0, bytes).expect("fill");
        tx.commit().expect("commit");
        blob_ref
    }

    fn read_all(pager: &MemPager, tree: &BlobTree, blob_ref: &BlobRef) -> Vec<u8> {
        let tx = pager.begin_read(AccessMode::SnapshotRead).expect("read txn");
        let mut dst = Vec::new();
        tree.read_range(&tx, blob_ref, 0, blob_ref.len, &mut dst)
            .expect("read");
        dst
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn single_leaf_roundtrip() {
        let (pager, tree) = small_store();
        let data = pattern(100, 3);
        let blob_ref = write_all(&pager, &tree, &data, WIDE_LIMIT);
        assert_eq!(blob_ref.roots.len(), 1);
        assert_eq!(tree.height_for(&blob_ref).unwrap(), 1);
        assert_eq!(read_all(&pager, &tree, &blob_ref), data);
    }

    #[test]
    fn multi_leaf_roundtrip() {
        let (pager, tree) = small_store();
        let data = pattern(126 * 5 + 17, 7);
        let blob_ref = write_all(&pager, &tree, &data, WIDE_LIMIT);
        assert_eq!(blob_ref.roots.len(), 6);
        assert_eq!(tree.height_for(&blob_ref).unwrap(), 1);
        assert_eq!(read_all(&pager, &tree, &blob_ref), data);
    }

    #[test]
    fn narrow_ref_limit_forces_synthetic_level() {
        let (pager, tree) = small_store();
        // 4 leaves needed but only 3 ids fit: one internal level required.
        let data = pattern(126 * 4, 9);
        let blob_ref = write_all(&pager, &tree, &data, NARROW_LIMIT);
        assert_eq!(tree.height_for(&blob_ref).unwrap(), 2);
        assert_eq!(blob_ref.roots.len(), 1);
        assert_eq!(read_all(&pager, &tree, &blob_ref), data);
    }

    #[test]
    fn append_extends_and_preserves_prefix() {
        let (pager, tree) = small_store();
        let head = pattern(200, 1);
        let tail = pattern(500, 2);
        let blob_ref = write_all(&pager, &tree, &head, WIDE_LIMIT);

        let mut tx = pager.begin_write().expect("write txn");
        let mut handle = tree
            .acquire(&tx, &blob_ref, SliceMode::Tail)
            .expect("acquire");
        tree.append(&mut tx, &mut handle, tail.len() as u64, WIDE_LIMIT)
            .expect("append");
        let grown = handle.blob_ref().clone();
        tree.fill_at(&mut tx, &grown, head.len() as u64, &tail)
            .expect("fill tail");
        tx.commit().expect("commit");

        let mut expected = head;
        expected.extend_from_slice(&tail);
        assert_eq!(read_all(&pager, &tree, &grown), expected);
    }

    #[test]
    fn append_unappend_roundtrip_restores_ref_and_pages() {
        let (pager, tree) = small_store();
        let data = pattern(126 * 3 - 5, 11);
        let blob_ref = write_all(&pager, &tree, &data, WIDE_LIMIT);
        let live_before = pager.live_pages();

        for cut in [1u64, 125, 126, 400] {
            let mut tx = pager.begin_write().expect("write txn");
            let mut handle = tree
                .acquire(&tx, &blob_ref, SliceMode::Tail)
                .expect("acquire");
            let delta_grow = tree.append(&mut tx, &mut handle, cut, WIDE_LIMIT).expect("append");
            let delta_shrink = tree
                .unappend(&mut tx, &mut handle, cut, WIDE_LIMIT)
                .expect("unappend");
            assert_eq!(delta_grow + delta_shrink, 0);
            assert_eq!(handle.blob_ref(), &blob_ref);
            tx.commit().expect("commit");
            assert_eq!(pager.live_pages(), live_before);
            assert_eq!(read_all(&pager, &tree, &blob_ref), data);
        }
    }

    #[test]
    fn prepend_within_first_leaf_reuses_slot() {
        let (pager, tree) = small_store();
        let data = pattern(50, 4);
        let blob_ref = write_all(&pager, &tree, &data, WIDE_LIMIT);

        // Shrink from the head first so offset becomes non-zero.
        let mut tx = pager.begin_write().expect("write txn");
        let mut handle = tree
            .acquire(&tx, &blob_ref, SliceMode::Head)
            .expect("acquire");
        tree.unprepend(&mut tx, &mut handle, 10, WIDE_LIMIT)
            .expect("unprepend");
        assert_eq!(handle.blob_ref().offset, 10);
        let roots_before = handle.blob_ref().roots.clone();
        tree.prepend(&mut tx, &mut handle, 10, WIDE_LIMIT)
            .expect("prepend");
        assert_eq!(handle.blob_ref().offset, 0);
        assert_eq!(handle.blob_ref().roots, roots_before);
        let restored = handle.blob_ref().clone();
        tree.fill_at(&mut tx, &restored, 0, &data[..10])
            .expect("refill head");
        tx.commit().expect("commit");
        assert_eq!(read_all(&pager, &tree, &restored), data);
    }

    #[test]
    fn prepend_shifts_ids_rightward() {
        let (pager, tree) = small_store();
        let head = pattern(126 * 2, 5);
        let body = pattern(126, 6);
        let blob_ref = write_all(&pager, &tree, &body, WIDE_LIMIT);

        let mut tx = pager.begin_write().expect("write txn");
        let mut handle = tree
            .acquire(&tx, &blob_ref, SliceMode::Head)
            .expect("acquire");
        tree.prepend(&mut tx, &mut handle, head.len() as u64, WIDE_LIMIT)
            .expect("prepend");
        let grown = handle.blob_ref().clone();
        assert_eq!(grown.offset, 0);
        assert_eq!(grown.roots.len(), 3);
        assert_eq!(grown.roots[2], blob_ref.roots[0]);
        tree.fill_at(&mut tx, &grown, 0, &head).expect("fill head");
        tx.commit().expect("commit");

        let mut expected = head;
        expected.extend_from_slice(&body);
        assert_eq!(read_all(&pager, &tree, &grown), expected);
    }

    #[test]
    fn prepend_unprepend_roundtrip() {
        let (pager, tree) = small_store();
        let data = pattern(126 * 2 + 30, 8);
        let blob_ref = write_all(&pager, &tree, &data, WIDE_LIMIT);
        let live_before = pager.live_pages();

        for cut in [1u64, 30, 126, 200] {
            let mut tx = pager.begin_write().expect("write txn");
            let mut handle = tree
                .acquire(&tx, &blob_ref, SliceMode::Head)
                .expect("acquire");
            let delta_grow = tree
                .prepend(&mut tx, &mut handle, cut, WIDE_LIMIT)
                .expect("prepend");
            let delta_shrink = tree
                .unprepend(&mut tx, &mut handle, cut, WIDE_LIMIT)
                .expect("unprepend");
            assert_eq!(delta_grow + delta_shrink, 0);
            assert_eq!(handle.blob_ref(), &blob_ref);
            tx.commit().expect("commit");
            assert_eq!(pager.live_pages(), live_before);
            assert_eq!(read_all(&pager, &tree, &blob_ref), data);
        }
    }

    #[test]
    fn growth_past_ref_limit_adds_level_and_shrink_collapses_it() {
        let (pager, tree) = small_store();
        let data = pattern(126 * 3, 13);
        let blob_ref = write_all(&pager, &tree, &data, NARROW_LIMIT);
        assert_eq!(tree.height_for(&blob_ref).unwrap(), 1);

        let mut tx = pager.begin_write().expect("write txn");
        let mut handle = tree
            .acquire(&tx, &blob_ref, SliceMode::Tail)
            .expect("acquire");
        let extra = 126 * 2;
        tree.append(&mut tx, &mut handle, extra, NARROW_LIMIT)
            .expect("append");
        assert_eq!(tree.height_for(handle.blob_ref()).unwrap(), 2);
        tree.unappend(&mut tx, &mut handle, extra, NARROW_LIMIT)
            .expect("unappend");
        assert_eq!(handle.blob_ref(), &blob_ref);
        tx.commit().expect("commit");
        assert_eq!(read_all(&pager, &tree, &blob_ref), data);
    }

    #[test]
    fn delete_releases_every_page() {
        let (pager, tree) = small_store();
        let data = pattern(126 * 7 + 3, 17);
        let blob_ref = write_all(&pager, &tree, &data, NARROW_LIMIT);
        assert!(pager.live_pages() > 0);

        let mut tx = pager.begin_write().expect("write txn");
        let handle = tree
            .acquire(&tx, &blob_ref, SliceMode::ForDelete)
            .expect("acquire");
        tree.mark_deleted(&mut tx, handle).expect("delete");
        tx.commit().expect("commit");
        assert_eq!(pager.live_pages(), 0);
    }

    #[test]
    fn supplier_streams_across_segments() {
        let (pager, tree) = small_store();
        let data = pattern(126 * 2 + 40, 19);
        let mut tx = pager.begin_write().expect("write txn");
        let blob_ref = tree
            .allocate(&mut tx, data.len() as u64, WIDE_LIMIT)
            .expect("allocate");
        let mut supplier = SliceSupplier::new(&data);
        let ok = tree
            .fill_from_supplier(&mut tx, &blob_ref, 0, data.len() as u64, &mut supplier)
            .expect("stream");
        assert!(ok);
        tx.commit().expect("commit");
        assert_eq!(read_all(&pager, &tree, &blob_ref), data);
    }

    #[test]
    fn segments_cover_range_without_overlap() {
        let (pager, tree) = small_store();
        let data = pattern(126 * 3, 23);
        let blob_ref = write_all(&pager, &tree, &data, WIDE_LIMIT);
        let tx = pager.begin_write().expect("write txn");
        let segments = tree
            .segments(&tx, &blob_ref, 100, 200)
            .expect("segments");
        let total: usize = segments.iter().map(|s| s.range.len()).sum();
        assert_eq!(total, 200);
        assert_eq!(segments[0].logical_pos, 100);
        for pair in segments.windows(2) {
            assert_eq!(
                pair[0].logical_pos + pair[0].range.len() as u64,
                pair[1].logical_pos
            );
        }
    }

    #[test]
    fn randomized_grow_shrink_keeps_bytes_consistent() {
        let (pager, tree) = small_store();
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        let mut model: Vec<u8> = pattern(300, 29);
        let blob_ref = write_all(&pager, &tree, &model, WIDE_LIMIT);
        let mut current = blob_ref;

        for round in 0..40 {
            let mut tx = pager.begin_write().expect("write txn");
            let mode = if round % 2 == 0 {
                SliceMode::Tail
            } else {
                SliceMode::Head
            };
            let mut handle = tree.acquire(&tx, &current, mode).expect("acquire");
            match rng.gen_range(0..4) {
                0 => {
                    let extra = rng.gen_range(1..300u64);
                    tree.append(&mut tx, &mut handle, extra, WIDE_LIMIT)
                        .expect("append");
                    let fresh = pattern(extra as usize, round as u8);
                    let grown = handle.blob_ref().clone();
                    tree.fill_at(&mut tx, &grown, model.len() as u64, &fresh)
                        .expect("fill");
                    model.extend_from_slice(&fresh);
                }
                1 => {
                    let extra = rng.gen_range(1..300u64);
                    tree.prepend(&mut tx, &mut handle, extra, WIDE_LIMIT)
                        .expect("prepend");
                    let fresh = pattern(extra as usize, round as u8);
                    let grown = handle.blob_ref().clone();
                    tree.fill_at(&mut tx, &grown, 0, &fresh).expect("fill");
                    let mut next = fresh;
                    next.extend_from_slice(&model);
                    model = next;
                }
                2 => {
                    if model.len() < 2 {
                        continue;
                    }
                    let cut = rng.gen_range(1..model.len() as u64);
                    tree.unappend(&mut tx, &mut handle, cut, WIDE_LIMIT)
                        .expect("unappend");
                    model.truncate(model.len() - cut as usize);
                }
                _ => {
                    if model.len() < 2 {
                        continue;
                    }
                    let cut = rng.gen_range(1..model.len() as u64);
                    tree.unprepend(&mut tx, &mut handle, cut, WIDE_LIMIT)
                        .expect("unprepend");
                    model.drain(..cut as usize);
                }
            }
            current = handle.into_ref();
            tx.commit().expect("commit");
            assert_eq!(read_all(&pager, &tree, &current), model, "round {round}");
        }
    }
}
