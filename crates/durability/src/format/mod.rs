//! On-disk byte format for snapshot artifacts.
//!
//! Keeping serialization separate from the writer and the replayer makes
//! format evolution easier to manage.
//!
//! # Module Structure
//!
//! - `log_record`: record header, record bodies, encode/decode
//! - `reader`: sequential record reader over any `Read`

pub mod log_record;
pub mod reader;

pub use log_record::{
    LogHeader, LogRecord, LogRecordError, LogRecordRef, RecordType, DONE_RECORD_SIZE,
    LOG_HEADER_SIZE, SNAPSHOT_DONE_MAGIC, SNAPSHOT_FORMAT_VERSION,
};
pub use reader::{LogRecordReader, ReadError};
