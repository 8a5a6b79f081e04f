//! Snapshot log record format.
//!
//! A snapshot artifact in DATA or CHKPT mode is a plain stream of log records
//! terminated by exactly one Done record. There is no file header: the Done
//! record at the tail is the only completion marker.
//!
//! # Record Layout
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────────┬─────────────┬──────────────────┐
//! │ Type (1) │ Reserved (3) │ Body Length (4)  │ Body CRC (4)│ Body (variable)  │
//! └──────────┴──────────────┴──────────────────┴─────────────┴──────────────────┘
//! ```
//!
//! # Bodies
//!
//! ```text
//! ItemLink:          item_type(1) expiry_tag(1) expiry(8) flags(4)
//!                    key_len(2) value_len(4) key value
//! CollectionElement: has_subkey(1) subkey_len(2) value_len(4) subkey value
//! Done:              magic "SNAPDONE"(8) format_version(4)
//! ```
//!
//! A CollectionElement record carries no owner key: it belongs to the nearest
//! preceding ItemLink record.

use byteorder::{LittleEndian, ReadBytesExt};
use cachesnap_core::{Element, Expiry, Item, ItemType};
use crc32fast::Hasher;
use std::io::{Cursor, Read};

/// Size of the fixed record header in bytes
pub const LOG_HEADER_SIZE: usize = 12;

/// Magic bytes in the body of a Done record
pub const SNAPSHOT_DONE_MAGIC: [u8; 8] = *b"SNAPDONE";

/// Current snapshot record format version
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const DONE_BODY_SIZE: usize = 12;

/// Size of a complete Done record. Every valid artifact ends with exactly
/// this many bytes of Done record.
pub const DONE_RECORD_SIZE: usize = LOG_HEADER_SIZE + DONE_BODY_SIZE;

const LINK_FIXED_SIZE: usize = 20;
const ELEMENT_FIXED_SIZE: usize = 7;

const EXPIRY_NEVER: u8 = 0;
const EXPIRY_STICKY: u8 = 1;
const EXPIRY_AT: u8 = 2;

/// Record type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// An item linked into the hash table
    ItemLink,
    /// One element of the preceding collection item
    CollectionElement,
    /// Snapshot completion marker
    Done,
}

impl RecordType {
    /// On-disk tag
    pub fn tag(self) -> u8 {
        match self {
            RecordType::ItemLink => 1,
            RecordType::CollectionElement => 2,
            RecordType::Done => 3,
        }
    }

    /// Decode an on-disk tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordType::ItemLink),
            2 => Some(RecordType::CollectionElement),
            3 => Some(RecordType::Done),
            _ => None,
        }
    }
}

/// Fixed record header (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Record type
    pub record_type: RecordType,
    /// Body length in bytes
    pub body_length: u32,
    /// CRC32 of the body
    pub body_crc: u32,
}

impl LogHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        bytes[0] = self.record_type.tag();
        bytes[4..8].copy_from_slice(&self.body_length.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.body_crc.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; LOG_HEADER_SIZE]) -> Result<Self, LogRecordError> {
        let record_type =
            RecordType::from_tag(bytes[0]).ok_or(LogRecordError::UnknownType(bytes[0]))?;
        let mut cursor = Cursor::new(&bytes[4..]);
        let body_length = cursor.read_u32::<LittleEndian>()?;
        let body_crc = cursor.read_u32::<LittleEndian>()?;
        Ok(LogHeader {
            record_type,
            body_length,
            body_crc,
        })
    }

    /// Reject bodies that would make the record exceed `max_record_size`.
    pub fn check_body_length(&self, max_record_size: usize) -> Result<(), LogRecordError> {
        let max_body = max_record_size.saturating_sub(LOG_HEADER_SIZE);
        if self.body_length as usize > max_body {
            return Err(LogRecordError::BodyTooLarge {
                length: self.body_length as usize,
                max: max_body,
            });
        }
        Ok(())
    }

    /// Verify a body against this header's CRC.
    pub fn verify_body(&self, body: &[u8]) -> Result<(), LogRecordError> {
        let computed = compute_crc(body);
        if computed != self.body_crc {
            return Err(LogRecordError::ChecksumMismatch {
                expected: self.body_crc,
                computed,
            });
        }
        Ok(())
    }
}

/// Borrowed view of a record, used for encoding without copying items.
#[derive(Debug, Clone, Copy)]
pub enum LogRecordRef<'a> {
    /// Item link record
    ItemLink(&'a Item),
    /// Collection element record
    CollectionElement(&'a Element),
    /// Done record
    Done,
}

impl<'a> LogRecordRef<'a> {
    /// Record type of this record
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecordRef::ItemLink(_) => RecordType::ItemLink,
            LogRecordRef::CollectionElement(_) => RecordType::CollectionElement,
            LogRecordRef::Done => RecordType::Done,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            LogRecordRef::ItemLink(item) => LINK_FIXED_SIZE + item.key.len() + item.value.len(),
            LogRecordRef::CollectionElement(elem) => {
                ELEMENT_FIXED_SIZE + elem.subkey.as_ref().map_or(0, |s| s.len()) + elem.value.len()
            }
            LogRecordRef::Done => DONE_BODY_SIZE,
        }
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        LOG_HEADER_SIZE + self.body_len()
    }

    fn check_field_lengths(&self) -> Result<(), LogRecordError> {
        match self {
            LogRecordRef::ItemLink(item) => {
                check_field("key", item.key.len(), u16::MAX as usize)?;
                check_field("value", item.value.len(), u32::MAX as usize)
            }
            LogRecordRef::CollectionElement(elem) => {
                if let Some(subkey) = &elem.subkey {
                    check_field("subkey", subkey.len(), u16::MAX as usize)?;
                }
                check_field("element value", elem.value.len(), u32::MAX as usize)
            }
            LogRecordRef::Done => Ok(()),
        }
    }

    /// Append the encoded record to `out`.
    ///
    /// Writes exactly `encoded_len()` bytes. Callers that need a bounded
    /// buffer reserve that much beforehand.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), LogRecordError> {
        self.check_field_lengths()?;

        let header_start = out.len();
        out.extend_from_slice(&[0u8; LOG_HEADER_SIZE]);
        let body_start = out.len();

        match self {
            LogRecordRef::ItemLink(item) => {
                let (tag, secs) = match item.expiry {
                    Expiry::Never => (EXPIRY_NEVER, 0),
                    Expiry::Sticky => (EXPIRY_STICKY, 0),
                    Expiry::At(at) => (EXPIRY_AT, at),
                };
                out.push(item.item_type.code());
                out.push(tag);
                out.extend_from_slice(&secs.to_le_bytes());
                out.extend_from_slice(&item.flags.to_le_bytes());
                out.extend_from_slice(&(item.key.len() as u16).to_le_bytes());
                out.extend_from_slice(&(item.value.len() as u32).to_le_bytes());
                out.extend_from_slice(&item.key);
                out.extend_from_slice(&item.value);
            }
            LogRecordRef::CollectionElement(elem) => {
                let subkey = elem.subkey.as_deref().unwrap_or(&[]);
                out.push(u8::from(elem.subkey.is_some()));
                out.extend_from_slice(&(subkey.len() as u16).to_le_bytes());
                out.extend_from_slice(&(elem.value.len() as u32).to_le_bytes());
                out.extend_from_slice(subkey);
                out.extend_from_slice(&elem.value);
            }
            LogRecordRef::Done => {
                out.extend_from_slice(&SNAPSHOT_DONE_MAGIC);
                out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
            }
        }

        let header = LogHeader {
            record_type: self.record_type(),
            body_length: (out.len() - body_start) as u32,
            body_crc: compute_crc(&out[body_start..]),
        };
        out[header_start..body_start].copy_from_slice(&header.to_bytes());
        Ok(())
    }

    /// Serialize the record into a fresh vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LogRecordError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

/// A decoded snapshot log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Item link record
    ItemLink(Item),
    /// Collection element record
    CollectionElement(Element),
    /// Done record
    Done,
}

impl LogRecord {
    /// Record type of this record
    pub fn record_type(&self) -> RecordType {
        self.as_ref().record_type()
    }

    /// Borrowed view for encoding
    pub fn as_ref(&self) -> LogRecordRef<'_> {
        match self {
            LogRecord::ItemLink(item) => LogRecordRef::ItemLink(item),
            LogRecord::CollectionElement(elem) => LogRecordRef::CollectionElement(elem),
            LogRecord::Done => LogRecordRef::Done,
        }
    }

    /// Serialize the record.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LogRecordError> {
        self.as_ref().to_bytes()
    }

    /// Decode a record body that has already been checked against `header`.
    pub fn decode_body(header: &LogHeader, body: &[u8]) -> Result<Self, LogRecordError> {
        if body.len() != header.body_length as usize {
            return Err(LogRecordError::InsufficientData);
        }
        header.verify_body(body)?;

        let mut cursor = Cursor::new(body);
        let record = match header.record_type {
            RecordType::ItemLink => {
                let type_code = cursor.read_u8()?;
                let item_type = ItemType::from_code(type_code).ok_or_else(|| {
                    LogRecordError::InvalidBody(format!("unknown item type {}", type_code))
                })?;
                let expiry_tag = cursor.read_u8()?;
                let secs = cursor.read_u64::<LittleEndian>()?;
                let expiry = match expiry_tag {
                    EXPIRY_NEVER => Expiry::Never,
                    EXPIRY_STICKY => Expiry::Sticky,
                    EXPIRY_AT => Expiry::At(secs),
                    other => {
                        return Err(LogRecordError::InvalidBody(format!(
                            "unknown expiry tag {}",
                            other
                        )))
                    }
                };
                let flags = cursor.read_u32::<LittleEndian>()?;
                let key_len = cursor.read_u16::<LittleEndian>()? as usize;
                let value_len = cursor.read_u32::<LittleEndian>()? as usize;
                let key = read_bytes(&mut cursor, key_len)?;
                let value = read_bytes(&mut cursor, value_len)?;
                LogRecord::ItemLink(Item {
                    key,
                    item_type,
                    flags,
                    expiry,
                    value,
                })
            }
            RecordType::CollectionElement => {
                let has_subkey = match cursor.read_u8()? {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(LogRecordError::InvalidBody(format!(
                            "invalid subkey marker {}",
                            other
                        )))
                    }
                };
                let subkey_len = cursor.read_u16::<LittleEndian>()? as usize;
                let value_len = cursor.read_u32::<LittleEndian>()? as usize;
                if !has_subkey && subkey_len != 0 {
                    return Err(LogRecordError::InvalidBody(
                        "subkey length without subkey".to_string(),
                    ));
                }
                let subkey = read_bytes(&mut cursor, subkey_len)?;
                let value = read_bytes(&mut cursor, value_len)?;
                LogRecord::CollectionElement(Element {
                    subkey: has_subkey.then_some(subkey),
                    value,
                })
            }
            RecordType::Done => {
                let mut magic = [0u8; 8];
                cursor.read_exact(&mut magic)?;
                if magic != SNAPSHOT_DONE_MAGIC {
                    return Err(LogRecordError::InvalidBody(
                        "bad done record magic".to_string(),
                    ));
                }
                let version = cursor.read_u32::<LittleEndian>()?;
                if version != SNAPSHOT_FORMAT_VERSION {
                    return Err(LogRecordError::UnsupportedVersion(version));
                }
                LogRecord::Done
            }
        };

        if cursor.position() as usize != body.len() {
            return Err(LogRecordError::InvalidBody(format!(
                "{} trailing bytes in {:?} body",
                body.len() - cursor.position() as usize,
                header.record_type
            )));
        }
        Ok(record)
    }

    /// Deserialize one record from the front of `bytes`.
    ///
    /// Returns (record, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8], max_record_size: usize) -> Result<(Self, usize), LogRecordError> {
        if bytes.len() < LOG_HEADER_SIZE {
            return Err(LogRecordError::InsufficientData);
        }
        let mut header_bytes = [0u8; LOG_HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..LOG_HEADER_SIZE]);
        let header = LogHeader::from_bytes(&header_bytes)?;
        header.check_body_length(max_record_size)?;

        let end = LOG_HEADER_SIZE + header.body_length as usize;
        if bytes.len() < end {
            return Err(LogRecordError::InsufficientData);
        }
        let record = Self::decode_body(&header, &bytes[LOG_HEADER_SIZE..end])?;
        Ok((record, end))
    }
}

fn check_field(field: &'static str, len: usize, max: usize) -> Result<(), LogRecordError> {
    if len > max {
        return Err(LogRecordError::FieldTooLong { field, len, max });
    }
    Ok(())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, LogRecordError> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(LogRecordError::InsufficientData);
    }
    let mut out = vec![0u8; len];
    cursor.read_exact(&mut out)?;
    Ok(out)
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Log record encoding and parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogRecordError {
    /// Not enough data to parse record
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Header carries an unknown type tag
    #[error("Unknown record type: {0}")]
    UnknownType(u8),

    /// Declared body length exceeds the configured maximum
    #[error("Body length {length} exceeds maximum {max}")]
    BodyTooLarge {
        /// Declared body length
        length: usize,
        /// Maximum body length
        max: usize,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from header
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Body fields are inconsistent
    #[error("Invalid record body: {0}")]
    InvalidBody(String),

    /// Unsupported format version in a Done record
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// A field is too long for its length prefix
    #[error("{field} length {len} exceeds {max}")]
    FieldTooLong {
        /// Field name
        field: &'static str,
        /// Field length
        len: usize,
        /// Largest encodable length
        max: usize,
    },
}

impl From<std::io::Error> for LogRecordError {
    fn from(_: std::io::Error) -> Self {
        // Reads here only ever run against in-memory cursors
        LogRecordError::InsufficientData
    }
}

impl From<LogRecordError> for cachesnap_core::SnapshotError {
    fn from(e: LogRecordError) -> Self {
        match e {
            LogRecordError::FieldTooLong { len, max, .. } => {
                cachesnap_core::SnapshotError::RecordTooLarge { size: len, max }
            }
            other => cachesnap_core::SnapshotError::CorruptArtifact(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX: usize = 1024 * 1024;

    fn sample_item() -> Item {
        Item::kv("foo", "bar")
            .with_flags(7)
            .with_expiry(Expiry::At(1_700_000_000))
    }

    #[test]
    fn test_header_roundtrip() {
        let header = LogHeader {
            record_type: RecordType::CollectionElement,
            body_length: 4242,
            body_crc: 0xDEADBEEF,
        };
        let parsed = LogHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_unknown_type() {
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        bytes[0] = 9;
        assert_eq!(
            LogHeader::from_bytes(&bytes),
            Err(LogRecordError::UnknownType(9))
        );
    }

    #[test]
    fn test_item_link_roundtrip() {
        let item = sample_item();
        let bytes = LogRecordRef::ItemLink(&item).to_bytes().unwrap();
        assert_eq!(bytes.len(), LogRecordRef::ItemLink(&item).encoded_len());

        let (parsed, consumed) = LogRecord::from_bytes(&bytes, MAX).unwrap();
        assert_eq!(parsed, LogRecord::ItemLink(item));
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_sticky_collection_link() {
        let item = Item::collection("tree", ItemType::Btree)
            .unwrap()
            .with_expiry(Expiry::Sticky);
        let bytes = LogRecordRef::ItemLink(&item).to_bytes().unwrap();
        let (parsed, _) = LogRecord::from_bytes(&bytes, MAX).unwrap();
        assert_eq!(parsed, LogRecord::ItemLink(item));
    }

    #[test]
    fn test_element_subkey_distinguishes_empty() {
        let with_empty = Element::keyed("", "v");
        let without = Element::value("v");

        let a = LogRecordRef::CollectionElement(&with_empty).to_bytes().unwrap();
        let b = LogRecordRef::CollectionElement(&without).to_bytes().unwrap();

        let (pa, _) = LogRecord::from_bytes(&a, MAX).unwrap();
        let (pb, _) = LogRecord::from_bytes(&b, MAX).unwrap();
        assert_eq!(pa, LogRecord::CollectionElement(with_empty));
        assert_eq!(pb, LogRecord::CollectionElement(without));
    }

    #[test]
    fn test_done_record_fixed_size() {
        let bytes = LogRecordRef::Done.to_bytes().unwrap();
        assert_eq!(bytes.len(), DONE_RECORD_SIZE);
        let (parsed, consumed) = LogRecord::from_bytes(&bytes, MAX).unwrap();
        assert_eq!(parsed, LogRecord::Done);
        assert_eq!(consumed, DONE_RECORD_SIZE);
    }

    #[test]
    fn test_checksum_failure() {
        let item = sample_item();
        let mut bytes = LogRecordRef::ItemLink(&item).to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(matches!(
            LogRecord::from_bytes(&bytes, MAX),
            Err(LogRecordError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_body_rejected_before_read() {
        let header = LogHeader {
            record_type: RecordType::ItemLink,
            body_length: 4096,
            body_crc: 0,
        };
        let err = header.check_body_length(1024).unwrap_err();
        assert!(matches!(err, LogRecordError::BodyTooLarge { length: 4096, .. }));

        // from_bytes checks the limit before looking for the body
        let bytes = header.to_bytes();
        assert!(matches!(
            LogRecord::from_bytes(&bytes, 1024),
            Err(LogRecordError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn test_key_too_long() {
        let item = Item::kv(vec![b'k'; u16::MAX as usize + 1], "v");
        let err = LogRecordRef::ItemLink(&item).to_bytes().unwrap_err();
        assert!(matches!(err, LogRecordError::FieldTooLong { field: "key", .. }));

        let converted: cachesnap_core::SnapshotError = err.into();
        assert!(matches!(
            converted,
            cachesnap_core::SnapshotError::RecordTooLarge { .. }
        ));
    }

    #[test]
    fn test_multiple_records_in_sequence() {
        let list = Item::collection("mylist", ItemType::List).unwrap();
        let elems = [Element::value("a"), Element::value("b")];

        let mut all = Vec::new();
        LogRecordRef::ItemLink(&list).encode_into(&mut all).unwrap();
        for e in &elems {
            LogRecordRef::CollectionElement(e).encode_into(&mut all).unwrap();
        }
        LogRecordRef::Done.encode_into(&mut all).unwrap();

        let mut offset = 0;
        let mut types = Vec::new();
        while offset < all.len() {
            let (record, consumed) = LogRecord::from_bytes(&all[offset..], MAX).unwrap();
            types.push(record.record_type());
            offset += consumed;
        }
        assert_eq!(
            types,
            vec![
                RecordType::ItemLink,
                RecordType::CollectionElement,
                RecordType::CollectionElement,
                RecordType::Done
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_decoding_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = LogRecord::from_bytes(&bytes, MAX);
        }

        #[test]
        fn prop_truncated_records_are_rejected(
            key in proptest::collection::vec(any::<u8>(), 1..64),
            value in proptest::collection::vec(any::<u8>(), 0..128),
            cut in 0usize..1000,
        ) {
            let item = Item::kv(key, value);
            let bytes = LogRecordRef::ItemLink(&item).to_bytes().unwrap();
            let cut = cut % bytes.len();
            prop_assert!(LogRecord::from_bytes(&bytes[..cut], MAX).is_err());
        }
    }
}
