//! Durability layer for cachesnap
//!
//! This crate handles everything that touches disk:
//!
//! - Binary log record format for snapshot artifacts
//! - Fixed-capacity snapshot buffer and fsync-on-flush file writer
//! - Validity check for completed artifacts
//! - Recovery: sequential snapshot replay into a redo target

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer; // Pre-allocated snapshot buffer
pub mod format; // Binary on-disk record format
pub mod recovery; // Validity check and replay
pub mod writer; // Buffered artifact writer

pub use buffer::SnapshotBuffer;
pub use format::{
    LogHeader, LogRecord, LogRecordError, LogRecordReader, LogRecordRef, ReadError, RecordType,
    DONE_RECORD_SIZE, LOG_HEADER_SIZE, SNAPSHOT_DONE_MAGIC, SNAPSHOT_FORMAT_VERSION,
};
pub use recovery::{check_file_validity, RedoError, RedoStore, ReplayStats, SnapshotReplayer};
pub use writer::{SnapshotWriter, WriterCounters};
