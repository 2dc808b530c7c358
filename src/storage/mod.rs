//! Storage core: record codec, node balancer, large-value tree, and the
//! modify-operation driver.

pub mod blob;
pub mod node;
pub mod ops;
pub mod record;
pub mod stats;
pub mod tree;

use std::time::{SystemTime, UNIX_EPOCH};

pub use blob::{BlobHandle, BlobRef, BlobTree, LeafSegment, SliceMode};
pub use ops::{ModifyOperation, SetPolicy, Verdict};
pub use record::{Payload, Record};
pub use stats::{BlobStats, BlobStatsSnapshot, TreeStats, TreeStatsSnapshot};
pub use tree::{Tree, TreeOptions, Value};

/// Time source consumed by expiry checks; injected so tests can steer it.
pub trait Clock: Send + Sync {
    /// Current time as unix seconds.
    fn now_unix(&self) -> u32;
}

/// Wall-clock implementation used outside tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or(0)
    }
}

/// Error returned by a value supplier that cannot deliver its bytes, e.g.
/// because the client connection feeding it went away mid-transfer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SupplierError;

/// Source of value bytes for store/append/prepend operations.
///
/// The total length is known up front; the engine then asks for the bytes
/// window by window, in order, each window sized to one storage segment.
/// A failure aborts the transfer and rolls back any tentative growth.
pub trait ValueSupplier {
    /// Total number of bytes this supplier will deliver.
    fn total_len(&self) -> usize;

    /// Fills `dst` with exactly `dst.len()` bytes, advancing the stream.
    fn fill(&mut self, dst: &mut [u8]) -> std::result::Result<(), SupplierError>;
}

/// Supplier over an in-memory byte slice.
#[derive(Debug)]
pub struct SliceSupplier<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceSupplier<'a> {
    /// Wraps `bytes` as a supplier.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl ValueSupplier for SliceSupplier<'_> {
    fn total_len(&self) -> usize {
        self.bytes.len()
    }

    fn fill(&mut self, dst: &mut [u8]) -> std::result::Result<(), SupplierError> {
        let end = self.pos + dst.len();
        if end > self.bytes.len() {
            return Err(SupplierError);
        }
        dst.copy_from_slice(&self.bytes[self.pos..end]);
        self.pos = end;
        Ok(())
    }
}

/// Per-operation result surfaced to the caller. Every variant maps 1:1 to
/// a distinct protocol response; none of them aborts the transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Value stored; carries the assigned CAS version.
    Stored {
        /// Version stamp for subsequent CAS operations.
        cas: u64,
    },
    /// Key removed.
    Deleted,
    /// Counter mutated; carries the new value and version.
    Counter {
        /// Value after the increment/decrement.
        value: u64,
        /// Version stamp assigned to the rewritten record.
        cas: u64,
    },
    /// Key absent (or expired).
    NotFound,
    /// Store precondition failed (add on present, replace on absent,
    /// CAS version mismatch).
    NotStored,
    /// Value would exceed the configured hard maximum.
    TooLarge,
    /// Increment/decrement target is not a bounded unsigned decimal.
    NotNumeric,
    /// The value supplier failed mid-transfer; tentative growth was
    /// rolled back and the prior value is intact.
    SupplierFailed,
}
