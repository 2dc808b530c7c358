//! Operation implementations plugged into the modify-operation driver.
//!
//! Each operation receives the old record (absent if the key is missing or
//! expired) plus an acquired large-value handle when one exists, and
//! returns a verdict: a replacement record, a deletion, or no change. The
//! driver owns structural maintenance and disposal of a replaced value's
//! pages; an operation that grows a large value in place takes the handle
//! out of the `Existing` so the driver knows the pages were reused.

use crate::pager::WriteTxn;
use crate::storage::blob::{BlobHandle, BlobTree, SliceMode};
use crate::storage::record::{Payload, Record};
use crate::storage::{Outcome, ValueSupplier};
use crate::types::{CachetError, Result};

/// Longest decimal representation accepted by increment/decrement.
const MAX_NUMERIC_LEN: usize = 20;

/// Store-family admission policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetPolicy {
    /// Unconditional store.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Store only if the present record carries this CAS version.
    Cas(u64),
}

/// What the operation decided.
#[derive(Debug)]
pub enum Verdict {
    /// Write this record for the key.
    Updated(Record, Outcome),
    /// Remove the key.
    Deleted(Outcome),
    /// Leave the key as it was.
    Unchanged(Outcome),
}

/// The old state handed to an operation.
#[derive(Debug)]
pub struct Existing {
    /// Decoded record currently stored for the key.
    pub record: Record,
    /// Acquired large-value handle, present iff the record is large. An
    /// operation that reuses the structure takes it; a handle still here
    /// after an `Updated`/`Deleted` verdict is disposed by the driver.
    pub blob: Option<BlobHandle>,
}

/// Driver-owned facilities an operation may use.
pub struct OpContext<'t> {
    /// The open write transaction.
    pub tx: &'t mut WriteTxn,
    /// Large-value store.
    pub blob: &'t BlobTree,
    /// Values up to this length stay inline in the leaf entry.
    pub inline_max: usize,
    /// Hard maximum value length.
    pub hard_max_value: usize,
    /// CAS version to stamp on a stored record.
    pub cas: u64,
}

/// Callback contract between the driver and one operation.
pub trait ModifyOperation {
    /// Which slice of an existing large value the operation needs.
    fn blob_slice(&self) -> SliceMode {
        SliceMode::ForDelete
    }

    /// Applies the operation to the old state, returning the verdict.
    fn apply(
        &mut self,
        ctx: &mut OpContext<'_>,
        existing: Option<&mut Existing>,
    ) -> Result<Verdict>;
}

/// Builds the payload for `len` supplied bytes, promoting to the
/// large-value tree past the inline threshold. Returns `None` when the
/// supplier failed; a tentative allocation is deleted before returning.
fn build_payload(
    ctx: &mut OpContext<'_>,
    len: usize,
    flags: u32,
    expiry: u32,
    supplier: &mut dyn ValueSupplier,
) -> Result<Option<Payload>> {
    if len <= ctx.inline_max {
        let mut buf = vec![0u8; len];
        if supplier.fill(&mut buf).is_err() {
            return Ok(None);
        }
        return Ok(Some(Payload::Inline(buf)));
    }
    let budget = Record::ref_budget(flags, expiry);
    let blob_ref = ctx.blob.allocate(ctx.tx, len as u64, budget)?;
    if !ctx
        .blob
        .fill_from_supplier(ctx.tx, &blob_ref, 0, len as u64, supplier)?
    {
        let handle = ctx.blob.acquire(ctx.tx, &blob_ref, SliceMode::ForDelete)?;
        ctx.blob.mark_deleted(ctx.tx, handle)?;
        return Ok(None);
    }
    Ok(Some(Payload::Blob(blob_ref)))
}

/// The set family: set / add-if-absent / replace-if-present / CAS.
pub struct SetOp<'s> {
    /// Admission policy.
    pub policy: SetPolicy,
    /// Client flags to store.
    pub flags: u32,
    /// Absolute expiry (0 = never).
    pub expiry: u32,
    /// Source of the value bytes.
    pub supplier: &'s mut dyn ValueSupplier,
}

impl ModifyOperation for SetOp<'_> {
    fn apply(
        &mut self,
        ctx: &mut OpContext<'_>,
        existing: Option<&mut Existing>,
    ) -> Result<Verdict> {
        match self.policy {
            SetPolicy::Add if existing.is_some() => {
                return Ok(Verdict::Unchanged(Outcome::NotStored));
            }
            SetPolicy::Replace if existing.is_none() => {
                return Ok(Verdict::Unchanged(Outcome::NotStored));
            }
            SetPolicy::Cas(expected) => match &existing {
                None => return Ok(Verdict::Unchanged(Outcome::NotFound)),
                Some(old) => {
                    if old.record.cas != Some(expected) {
                        return Ok(Verdict::Unchanged(Outcome::NotStored));
                    }
                }
            },
            _ => {}
        }
        let len = self.supplier.total_len();
        if len > ctx.hard_max_value {
            return Ok(Verdict::Unchanged(Outcome::TooLarge));
        }
        let payload = match build_payload(ctx, len, self.flags, self.expiry, self.supplier)? {
            Some(payload) => payload,
            None => return Ok(Verdict::Unchanged(Outcome::SupplierFailed)),
        };
        let cas = ctx.cas;
        Ok(Verdict::Updated(
            Record {
                flags: self.flags,
                expiry: self.expiry,
                cas: Some(cas),
                payload,
            },
            Outcome::Stored { cas },
        ))
    }
}

/// Removes the key if present.
pub struct DeleteOp;

impl ModifyOperation for DeleteOp {
    fn apply(
        &mut self,
        _ctx: &mut OpContext<'_>,
        existing: Option<&mut Existing>,
    ) -> Result<Verdict> {
        match existing {
            Some(_) => Ok(Verdict::Deleted(Outcome::Deleted)),
            None => Ok(Verdict::Unchanged(Outcome::NotFound)),
        }
    }
}

/// Atomic numeric increment/decrement over a decimal-encoded value.
pub struct CounterOp {
    /// Amount to add or subtract.
    pub delta: u64,
    /// True for decrement.
    pub decrement: bool,
}

impl ModifyOperation for CounterOp {
    fn apply(
        &mut self,
        ctx: &mut OpContext<'_>,
        existing: Option<&mut Existing>,
    ) -> Result<Verdict> {
        let Some(old) = existing else {
            return Ok(Verdict::Unchanged(Outcome::NotFound));
        };
        let digits = match &old.record.payload {
            Payload::Inline(bytes) if bytes.len() <= MAX_NUMERIC_LEN => bytes.as_slice(),
            _ => return Ok(Verdict::Unchanged(Outcome::NotNumeric)),
        };
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Ok(Verdict::Unchanged(Outcome::NotNumeric));
        }
        let text = std::str::from_utf8(digits)
            .map_err(|_| CachetError::Corruption("numeric value not utf-8"))?;
        let Ok(current) = text.parse::<u64>() else {
            return Ok(Verdict::Unchanged(Outcome::NotNumeric));
        };
        // Saturate to zero instead of wrapping in either direction.
        let value = if self.decrement {
            current.checked_sub(self.delta).unwrap_or(0)
        } else {
            current.checked_add(self.delta).unwrap_or(0)
        };
        let cas = ctx.cas;
        Ok(Verdict::Updated(
            Record {
                flags: old.record.flags,
                expiry: old.record.expiry,
                cas: Some(cas),
                payload: Payload::Inline(value.to_string().into_bytes()),
            },
            Outcome::Counter { value, cas },
        ))
    }
}

/// Splices supplied bytes at the tail (append) or head (prepend) of an
/// existing value without copying the unaffected bytes.
pub struct ConcatOp<'s> {
    /// True for append, false for prepend.
    pub at_tail: bool,
    /// Source of the spliced bytes.
    pub supplier: &'s mut dyn ValueSupplier,
}

impl ModifyOperation for ConcatOp<'_> {
    fn blob_slice(&self) -> SliceMode {
        if self.at_tail {
            SliceMode::Tail
        } else {
            SliceMode::Head
        }
    }

    fn apply(
        &mut self,
        ctx: &mut OpContext<'_>,
        existing: Option<&mut Existing>,
    ) -> Result<Verdict> {
        let Some(old) = existing else {
            return Ok(Verdict::Unchanged(Outcome::NotFound));
        };
        let extra = self.supplier.total_len();
        let old_len = old.record.value_len();
        if old_len + extra as u64 > ctx.hard_max_value as u64 {
            return Ok(Verdict::Unchanged(Outcome::TooLarge));
        }
        let flags = old.record.flags;
        let expiry = old.record.expiry;
        let payload = match &old.record.payload {
            Payload::Inline(old_bytes) => {
                let total = old_bytes.len() + extra;
                if total <= ctx.inline_max {
                    let mut buf = vec![0u8; total];
                    let fill_result = if self.at_tail {
                        buf[..old_bytes.len()].copy_from_slice(old_bytes);
                        self.supplier.fill(&mut buf[old_bytes.len()..])
                    } else {
                        buf[extra..].copy_from_slice(old_bytes);
                        self.supplier.fill(&mut buf[..extra])
                    };
                    if fill_result.is_err() {
                        return Ok(Verdict::Unchanged(Outcome::SupplierFailed));
                    }
                    Payload::Inline(buf)
                } else {
                    // Promotion past the inline threshold: the old bytes
                    // move into a fresh large-value tree, the new bytes
                    // stream in after them.
                    let budget = Record::ref_budget(flags, expiry);
                    let blob_ref = ctx.blob.allocate(ctx.tx, total as u64, budget)?;
                    let old_pos = if self.at_tail { 0 } else { extra as u64 };
                    let new_pos = if self.at_tail { old_len } else { 0 };
                    ctx.blob.fill_at(ctx.tx, &blob_ref, old_pos, old_bytes)?;
                    if !ctx.blob.fill_from_supplier(
                        ctx.tx,
                        &blob_ref,
                        new_pos,
                        extra as u64,
                        self.supplier,
                    )? {
                        let handle = ctx.blob.acquire(ctx.tx, &blob_ref, SliceMode::ForDelete)?;
                        ctx.blob.mark_deleted(ctx.tx, handle)?;
                        return Ok(Verdict::Unchanged(Outcome::SupplierFailed));
                    }
                    Payload::Blob(blob_ref)
                }
            }
            Payload::Blob(_) => {
                let mut handle = old
                    .blob
                    .take()
                    .ok_or(CachetError::Invalid("large value without handle"))?;
                let budget = Record::ref_budget(flags, expiry);
                let extra = extra as u64;
                if self.at_tail {
                    ctx.blob.append(ctx.tx, &mut handle, extra, budget)?;
                    let filled = ctx.blob.fill_from_supplier(
                        ctx.tx,
                        handle.blob_ref(),
                        old_len,
                        extra,
                        self.supplier,
                    )?;
                    if !filled {
                        ctx.blob.unappend(ctx.tx, &mut handle, extra, budget)?;
                        old.blob = Some(handle);
                        return Ok(Verdict::Unchanged(Outcome::SupplierFailed));
                    }
                } else {
                    ctx.blob.prepend(ctx.tx, &mut handle, extra, budget)?;
                    let filled = ctx.blob.fill_from_supplier(
                        ctx.tx,
                        handle.blob_ref(),
                        0,
                        extra,
                        self.supplier,
                    )?;
                    if !filled {
                        ctx.blob.unprepend(ctx.tx, &mut handle, extra, budget)?;
                        old.blob = Some(handle);
                        return Ok(Verdict::Unchanged(Outcome::SupplierFailed));
                    }
                }
                Payload::Blob(handle.into_ref())
            }
        };
        let cas = ctx.cas;
        Ok(Verdict::Updated(
            Record {
                flags,
                expiry,
                cas: Some(cas),
                payload,
            },
            Outcome::Stored { cas },
        ))
    }
}
