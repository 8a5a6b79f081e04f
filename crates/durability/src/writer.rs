//! Buffered snapshot file writer.
//!
//! The writer stages bytes in the run's [`SnapshotBuffer`] and writes the
//! whole buffer to the artifact whenever the next append would overflow it.
//! Every [`flush`](SnapshotWriter::flush) ends with an fsync, so once a run
//! has finished the artifact is durable up to its last byte.
//!
//! # Short Writes
//!
//! A flush issues a single `write` for the buffered bytes. If the kernel
//! accepts fewer bytes than requested the flush fails with
//! [`SnapshotError::ShortWrite`]; the run is aborted rather than retried.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cachesnap_core::{Result, SnapshotError};
use tracing::{debug, warn};

use crate::buffer::SnapshotBuffer;
use crate::format::LogRecordRef;

/// Permission bits for new artifacts
#[cfg(unix)]
const ARTIFACT_MODE: u32 = 0o640;

/// Cumulative writer counters for one artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterCounters {
    /// Buffer flushes (on overflow and explicit)
    pub flushes: u64,
    /// fsync calls
    pub sync_calls: u64,
    /// Bytes written to the file
    pub bytes_written: u64,
}

/// Writer for one snapshot artifact
pub struct SnapshotWriter<'a> {
    file: File,
    path: PathBuf,
    buffer: &'a mut SnapshotBuffer,
    max_record_size: usize,
    counters: WriterCounters,
}

impl<'a> SnapshotWriter<'a> {
    /// Create (or truncate) the artifact at `path`, staging through `buffer`.
    ///
    /// Records larger than `max_record_size` are refused, so everything the
    /// writer accepts can be read back by a replayer with the same limit.
    /// The buffer is cleared; anything left over from an earlier run is
    /// discarded.
    pub fn create(
        path: &Path,
        buffer: &'a mut SnapshotBuffer,
        max_record_size: usize,
    ) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(ARTIFACT_MODE);
        }
        let file = options.open(path)?;
        buffer.clear();

        debug!(target: "cachesnap::snapshot", path = %path.display(), capacity = buffer.capacity(), "Opened snapshot artifact");
        Ok(SnapshotWriter {
            file,
            path: path.to_path_buf(),
            buffer,
            max_record_size,
            counters: WriterCounters::default(),
        })
    }

    /// Artifact path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counters so far
    pub fn counters(&self) -> WriterCounters {
        self.counters
    }

    /// Bytes staged but not yet written
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Make room for `n` bytes, writing out the buffer if necessary.
    ///
    /// Fails with `RecordTooLarge` if `n` exceeds the buffer capacity.
    pub fn ensure_space(&mut self, n: usize) -> Result<()> {
        if n > self.buffer.capacity() {
            return Err(SnapshotError::RecordTooLarge {
                size: n,
                max: self.buffer.capacity(),
            });
        }
        if !self.buffer.fits(n) {
            self.write_buffer()?;
        }
        Ok(())
    }

    /// Copy `bytes` into the buffer, making room first.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_space(bytes.len())?;
        self.buffer.append(bytes);
        Ok(())
    }

    /// Encode a log record into the buffer, making room first.
    ///
    /// Fails with `RecordTooLarge` if the record exceeds the maximum record
    /// size; nothing is buffered in that case.
    pub fn append_record(&mut self, record: LogRecordRef<'_>) -> Result<()> {
        let size = record.encoded_len();
        if size > self.max_record_size {
            warn!(target: "cachesnap::snapshot", path = %self.path.display(), size, max = self.max_record_size, "Snapshot record too large");
            return Err(SnapshotError::RecordTooLarge {
                size,
                max: self.max_record_size,
            });
        }
        self.ensure_space(size)?;
        record.encode_into(self.buffer.tail())?;
        debug_assert!(self.buffer.len() <= self.buffer.capacity());
        Ok(())
    }

    /// Write out anything buffered, then fsync.
    ///
    /// The fsync is issued even when the buffer is empty.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.write_buffer()?;
        }
        self.counters.sync_calls += 1;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flush and close the artifact, returning its final size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        let size = self.file.metadata()?.len();
        debug!(
            target: "cachesnap::snapshot",
            path = %self.path.display(),
            size,
            flushes = self.counters.flushes,
            "Closed snapshot artifact"
        );
        Ok(size)
    }

    /// Close an artifact whose trailer has already been flushed, returning
    /// its size.
    ///
    /// Anything still buffered is flushed first; an already flushed writer
    /// is closed without another fsync.
    pub fn close(mut self) -> Result<u64> {
        if !self.buffer.is_empty() {
            self.flush()?;
        }
        Ok(self.file.metadata()?.len())
    }

    /// Best-effort flush for a run that is ending early, then close.
    ///
    /// Failures are logged, not returned: the run already has an outcome.
    pub fn abandon(mut self) -> u64 {
        if let Err(e) = self.flush() {
            warn!(target: "cachesnap::snapshot", path = %self.path.display(), error = %e, "Failed to flush abandoned snapshot");
        }
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn write_buffer(&mut self) -> Result<()> {
        let requested = self.buffer.len();
        let written = loop {
            match self.file.write(self.buffer.as_slice()) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "cachesnap::snapshot", path = %self.path.display(), error = %e, "Snapshot write failed");
                    return Err(e.into());
                }
            }
        };
        self.counters.bytes_written += written as u64;
        if written != requested {
            warn!(target: "cachesnap::snapshot", path = %self.path.display(), written, requested, "Short snapshot write");
            return Err(SnapshotError::ShortWrite { written, requested });
        }
        self.counters.flushes += 1;
        self.buffer.clear();
        Ok(())
    }
}
