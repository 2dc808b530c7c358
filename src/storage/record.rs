//! On-node representation of one key's stored value.
//!
//! A record is the leaf-entry payload: a one-byte header length, a
//! metadata-presence byte, the present metadata fields in fixed order
//! (numeric flags, expiry, CAS version), then either the inline value
//! bytes or an embedded [`BlobRef`] for values promoted to the
//! large-value tree. The header-length byte bounds everything except the
//! inline payload, which is why a blob reference has a hard "ref limit"
//! on its serialized footprint.

use crate::primitives::bytes::SliceCursor;
use crate::storage::blob::BlobRef;
use crate::types::{CachetError, Result};

const META_HAS_FLAGS: u8 = 0x01;
const META_HAS_EXPIRY: u8 = 0x02;
const META_HAS_CAS: u8 = 0x04;
const META_LARGE: u8 = 0x08;
const META_KNOWN: u8 = META_HAS_FLAGS | META_HAS_EXPIRY | META_HAS_CAS | META_LARGE;

/// Upper bound on the serialized record header (everything but inline bytes).
pub const RECORD_MAX_HEADER: usize = u8::MAX as usize;

/// Value payload: inline bytes or a reference into the large-value tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// Value stored directly in the leaf entry.
    Inline(Vec<u8>),
    /// Value stored in a large-value tree reachable through this reference.
    Blob(BlobRef),
}

/// Stored representation of one key's value plus metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    /// Opaque client flags; 0 is not stored on the wire.
    pub flags: u32,
    /// Absolute expiry in unix seconds; 0 means "never" and is not stored.
    pub expiry: u32,
    /// CAS version assigned at store time.
    pub cas: Option<u64>,
    /// The value itself.
    pub payload: Payload,
}

impl Record {
    /// True if the value lives in the large-value tree.
    pub fn is_large(&self) -> bool {
        matches!(self.payload, Payload::Blob(_))
    }

    /// Logical value length in bytes.
    pub fn value_len(&self) -> u64 {
        match &self.payload {
            Payload::Inline(bytes) => bytes.len() as u64,
            Payload::Blob(blob_ref) => blob_ref.len,
        }
    }

    /// True if the record has an expiry in the past (relative to `now`).
    pub fn is_expired(&self, now: u32) -> bool {
        self.expiry != 0 && self.expiry <= now
    }

    /// The blob reference, if the value is large.
    pub fn blob_ref(&self) -> Option<&BlobRef> {
        match &self.payload {
            Payload::Blob(blob_ref) => Some(blob_ref),
            Payload::Inline(_) => None,
        }
    }

    /// Byte budget available to a [`BlobRef`] inside a record carrying the
    /// given metadata. The CAS field is always counted: every stored record
    /// gets a version.
    pub fn ref_budget(flags: u32, expiry: u32) -> usize {
        let mut used = 2 + 8;
        if flags != 0 {
            used += 4;
        }
        if expiry != 0 {
            used += 4;
        }
        RECORD_MAX_HEADER - used
    }

    fn header_len(&self) -> usize {
        let mut len = 2;
        if self.flags != 0 {
            len += 4;
        }
        if self.expiry != 0 {
            len += 4;
        }
        if self.cas.is_some() {
            len += 8;
        }
        if let Payload::Blob(blob_ref) = &self.payload {
            len += blob_ref.encoded_len();
        }
        len
    }

    /// Total serialized length.
    pub fn encoded_len(&self) -> usize {
        let inline = match &self.payload {
            Payload::Inline(bytes) => bytes.len(),
            Payload::Blob(_) => 0,
        };
        self.header_len() + inline
    }

    /// Serializes the record, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let header_len = self.header_len();
        if header_len > RECORD_MAX_HEADER {
            return Err(CachetError::Invalid("record header exceeds size byte"));
        }
        out.push(header_len as u8);
        let mut meta = 0u8;
        if self.flags != 0 {
            meta |= META_HAS_FLAGS;
        }
        if self.expiry != 0 {
            meta |= META_HAS_EXPIRY;
        }
        if self.cas.is_some() {
            meta |= META_HAS_CAS;
        }
        if self.is_large() {
            meta |= META_LARGE;
        }
        out.push(meta);
        if self.flags != 0 {
            out.extend_from_slice(&self.flags.to_be_bytes());
        }
        if self.expiry != 0 {
            out.extend_from_slice(&self.expiry.to_be_bytes());
        }
        if let Some(cas) = self.cas {
            out.extend_from_slice(&cas.to_be_bytes());
        }
        match &self.payload {
            Payload::Blob(blob_ref) => blob_ref.encode(out),
            Payload::Inline(bytes) => out.extend_from_slice(bytes),
        }
        Ok(())
    }

    /// Decodes a record from a full leaf-entry payload slice.
    pub fn decode(buf: &[u8]) -> Result<Record> {
        let mut cursor = SliceCursor::new(buf);
        let header_len = cursor.read_u8("record header length truncated")? as usize;
        if header_len < 2 || header_len > buf.len() {
            return Err(CachetError::Corruption("record header length out of range"));
        }
        let meta = cursor.read_u8("record meta byte truncated")?;
        if meta & !META_KNOWN != 0 {
            return Err(CachetError::Corruption("record meta has unknown bits"));
        }
        let flags = if meta & META_HAS_FLAGS != 0 {
            cursor.read_u32_be("record flags truncated")?
        } else {
            0
        };
        let expiry = if meta & META_HAS_EXPIRY != 0 {
            cursor.read_u32_be("record expiry truncated")?
        } else {
            0
        };
        let cas = if meta & META_HAS_CAS != 0 {
            Some(cursor.read_u64_be("record cas truncated")?)
        } else {
            None
        };
        let payload = if meta & META_LARGE != 0 {
            let ref_len = header_len
                .checked_sub(cursor.position())
                .ok_or(CachetError::Corruption("record header shorter than meta"))?;
            let blob_ref = BlobRef::decode(cursor.take(ref_len)?)?;
            if cursor.remaining() != 0 {
                return Err(CachetError::Corruption("large record has trailing bytes"));
            }
            Payload::Blob(blob_ref)
        } else {
            if cursor.position() != header_len {
                return Err(CachetError::Corruption("record header length mismatch"));
            }
            Payload::Inline(cursor.take(buf.len() - header_len)?.to_vec())
        };
        Ok(Record {
            flags,
            expiry,
            cas,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageId;

    fn roundtrip(record: &Record) -> Record {
        let mut buf = Vec::new();
        record.encode(&mut buf).expect("encode");
        assert_eq!(buf.len(), record.encoded_len());
        Record::decode(&buf).expect("decode")
    }

    #[test]
    fn inline_record_roundtrip_all_metadata() {
        let record = Record {
            flags: 0xdead_beef,
            expiry: 1_700_000_000,
            cas: Some(42),
            payload: Payload::Inline(b"hello".to_vec()),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn inline_record_roundtrip_no_metadata() {
        let record = Record {
            flags: 0,
            expiry: 0,
            cas: None,
            payload: Payload::Inline(Vec::new()),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn large_record_roundtrip() {
        let record = Record {
            flags: 7,
            expiry: 0,
            cas: Some(9),
            payload: Payload::Blob(BlobRef {
                offset: 123,
                len: 1 << 20,
                roots: vec![PageId(4), PageId(5), PageId(6)],
            }),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn expiry_comparison_treats_zero_as_never() {
        let mut record = Record {
            flags: 0,
            expiry: 0,
            cas: Some(1),
            payload: Payload::Inline(Vec::new()),
        };
        assert!(!record.is_expired(u32::MAX));
        record.expiry = 10;
        assert!(!record.is_expired(9));
        assert!(record.is_expired(10));
    }

    #[test]
    fn ref_budget_shrinks_with_metadata() {
        assert_eq!(Record::ref_budget(0, 0), 245);
        assert_eq!(Record::ref_budget(1, 0), 241);
        assert_eq!(Record::ref_budget(1, 1), 237);
    }

    #[test]
    fn decode_rejects_unknown_meta_bits() {
        let err = Record::decode(&[2, 0x80]).expect_err("unknown bits");
        assert!(matches!(err, CachetError::Corruption(_)));
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let record = Record {
            flags: 1,
            expiry: 1,
            cas: Some(1),
            payload: Payload::Inline(b"x".to_vec()),
        };
        let mut buf = Vec::new();
        record.encode(&mut buf).expect("encode");
        let err = Record::decode(&buf[..4]).expect_err("truncated");
        assert!(matches!(err, CachetError::Corruption(_)));
    }
}
