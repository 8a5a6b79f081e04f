//! Fixed-capacity snapshot buffer
//!
//! The buffer is allocated once when the engine starts and reused by every
//! run. It never grows: the writer flushes it to the file before an append
//! would overflow it.

/// Pre-allocated, append-only byte buffer
#[derive(Debug)]
pub struct SnapshotBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl SnapshotBuffer {
    /// Allocate a buffer of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        SnapshotBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Fixed capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space before the buffer must be flushed
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Whether `n` more bytes fit without flushing
    pub fn fits(&self, n: usize) -> bool {
        n <= self.remaining()
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop all buffered bytes, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appendable view of the buffered bytes.
    ///
    /// Callers must have checked [`fits`](Self::fits) for everything they
    /// append.
    pub(crate) fn tail(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Copy `bytes` into the buffer. The caller must have ensured space.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        debug_assert!(self.fits(bytes.len()));
        self.data.extend_from_slice(bytes);
    }
}
