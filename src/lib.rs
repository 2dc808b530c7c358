//! Cachet: the ordered key-value storage core of a distributed cache
//! server.
//!
//! Variable-size values keyed by opaque byte strings, with point
//! read/insert/delete, atomic numeric increment/decrement, and atomic
//! append/prepend. Per-key atomicity and snapshot-isolated reads come
//! from the underlying transactional page manager (an in-memory
//! implementation ships in [`pager`]; a durable one is an external
//! collaborator honoring the same contract).
//!
//! Layering, bottom up:
//!
//! - [`pager`]: transactional page store contract plus [`pager::MemPager`]
//! - [`storage::record`]: on-node value representation
//! - [`storage::node`]: tree node codec and the split/merge/level balancer
//! - [`storage::blob`]: large-value side tree for values past the inline
//!   threshold
//! - [`storage::tree`]: the modify-operation driver and the outward API
//! - [`storage::ops`]: the pluggable single-key operations

pub mod error;
pub mod pager;
pub mod primitives;
pub mod storage;
pub mod types;

pub use error::{CachetError, Result};
pub use pager::{AccessMode, MemPager, PageStore, PagerOptions};
pub use storage::{
    Outcome, SliceSupplier, SupplierError, Tree, TreeOptions, Value, ValueSupplier,
};
