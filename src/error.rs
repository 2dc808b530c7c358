//! Error taxonomy shared across the storage core.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CachetError>;

/// Failures surfaced by the storage core.
///
/// Expected per-operation outcomes (`NotFound`, `NotStored`, `TooLarge`,
/// `NotNumeric`, `SupplierFailed`) are not errors; they are reported through
/// [`crate::storage::Outcome`]. This enum carries only failures that abort
/// the current operation.
#[derive(Debug, Error)]
pub enum CachetError {
    /// I/O error from the underlying page manager.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// On-page data failed a structural validity check.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// Caller-supplied argument or configuration is unusable.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The page manager refused an acquisition or allocation.
    #[error("storage failure: {0}")]
    Storage(&'static str),
}
