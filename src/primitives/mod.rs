//! Low-level building blocks shared by the pager and the storage layers.

pub mod bytes;
