//! Sequential log record reader

use std::io::{self, Read};

use super::log_record::{LogHeader, LogRecord, LogRecordError, LOG_HEADER_SIZE};

/// Reads records one at a time from a byte stream.
///
/// A clean end of stream at a record boundary yields `Ok(None)`; a stream
/// that ends inside a header or body is an error.
pub struct LogRecordReader<R> {
    inner: R,
    max_record_size: usize,
    body: Vec<u8>,
    offset: u64,
}

impl<R: Read> LogRecordReader<R> {
    /// Wrap a reader, rejecting records larger than `max_record_size`
    pub fn new(inner: R, max_record_size: usize) -> Self {
        LogRecordReader {
            inner,
            max_record_size,
            body: Vec::new(),
            offset: 0,
        }
    }

    /// Offset of the next unread record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, ReadError> {
        let mut header_bytes = [0u8; LOG_HEADER_SIZE];
        match read_full(&mut self.inner, &mut header_bytes)? {
            0 => return Ok(None),
            n if n < LOG_HEADER_SIZE => {
                return Err(ReadError::Truncated {
                    offset: self.offset,
                    expected: LOG_HEADER_SIZE,
                    got: n,
                })
            }
            _ => {}
        }

        let header = LogHeader::from_bytes(&header_bytes).map_err(|e| ReadError::Record {
            offset: self.offset,
            source: e,
        })?;
        header
            .check_body_length(self.max_record_size)
            .map_err(|e| ReadError::Record {
                offset: self.offset,
                source: e,
            })?;

        let body_len = header.body_length as usize;
        self.body.resize(body_len, 0);
        let got = read_full(&mut self.inner, &mut self.body)?;
        if got < body_len {
            return Err(ReadError::Truncated {
                offset: self.offset,
                expected: body_len,
                got,
            });
        }

        let record = LogRecord::decode_body(&header, &self.body).map_err(|e| ReadError::Record {
            offset: self.offset,
            source: e,
        })?;
        self.offset += (LOG_HEADER_SIZE + body_len) as u64;
        Ok(Some(record))
    }
}

/// Fill `buf` as far as the stream allows, returning the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Errors from [`LogRecordReader`]
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Underlying read failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stream ended inside a record
    #[error("Truncated record at offset {offset}: expected {expected} bytes, got {got}")]
    Truncated {
        /// Offset of the record
        offset: u64,
        /// Bytes needed
        expected: usize,
        /// Bytes available
        got: usize,
    },

    /// Record failed to decode
    #[error("Bad record at offset {offset}: {source}")]
    Record {
        /// Offset of the record
        offset: u64,
        /// Decode failure
        source: LogRecordError,
    },
}

impl From<ReadError> for cachesnap_core::SnapshotError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Io(io) => cachesnap_core::SnapshotError::Io(io),
            other => cachesnap_core::SnapshotError::CorruptArtifact(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::LogRecordRef;
    use cachesnap_core::{Element, Item, ItemType};
    use std::io::Cursor;

    fn stream() -> Vec<u8> {
        let list = Item::collection("l", ItemType::List).unwrap();
        let elem = Element::value("x");
        let mut out = Vec::new();
        LogRecordRef::ItemLink(&list).encode_into(&mut out).unwrap();
        LogRecordRef::CollectionElement(&elem)
            .encode_into(&mut out)
            .unwrap();
        LogRecordRef::Done.encode_into(&mut out).unwrap();
        out
    }

    #[test]
    fn test_reads_all_then_none() {
        let bytes = stream();
        let mut reader = LogRecordReader::new(Cursor::new(&bytes), 1024);

        assert!(matches!(
            reader.next_record().unwrap(),
            Some(LogRecord::ItemLink(_))
        ));
        assert!(matches!(
            reader.next_record().unwrap(),
            Some(LogRecord::CollectionElement(_))
        ));
        assert_eq!(reader.next_record().unwrap(), Some(LogRecord::Done));
        assert_eq!(reader.next_record().unwrap(), None);
        assert_eq!(reader.offset(), bytes.len() as u64);
    }

    #[test]
    fn test_truncated_body() {
        let bytes = stream();
        let cut = &bytes[..LOG_HEADER_SIZE + 3];
        let mut reader = LogRecordReader::new(Cursor::new(cut), 1024);
        assert!(matches!(
            reader.next_record(),
            Err(ReadError::Truncated { offset: 0, .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = stream();
        let mut reader = LogRecordReader::new(Cursor::new(&bytes[..5]), 1024);
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, ReadError::Truncated { got: 5, .. }));

        let converted: cachesnap_core::SnapshotError = err.into();
        assert!(converted.is_corruption());
    }

    #[test]
    fn test_body_limit() {
        let bytes = stream();
        let mut reader = LogRecordReader::new(Cursor::new(&bytes), LOG_HEADER_SIZE + 4);
        assert!(matches!(
            reader.next_record(),
            Err(ReadError::Record {
                source: LogRecordError::BodyTooLarge { .. },
                ..
            })
        ));
    }
}
