//! Item scan contract
//!
//! The snapshot engine does not own the item store. It drives a batched
//! cursor supplied by the store through these traits:
//!
//! 1. [`ItemSource::open_scan`] opens a cursor, optionally prefix-filtered,
//!    with or without collection elements, optionally checkpoint-scoped
//! 2. [`ItemScan::next_batch`] yields up to `capacity` items at a time
//! 3. [`ItemScan::release`] hands each batch back once it has been dumped
//! 4. [`ItemScan::close`] ends the scan, reporting whether it completed

use std::fmt;
use std::sync::Arc;

use cachesnap_core::{Element, Item, PrefixFilter, Result};

/// Command-log hooks bracketing a checkpoint scan.
///
/// The command-log manager uses these to mark the epoch a CHKPT artifact
/// covers. Only checkpoint-mode scans receive a scope.
pub trait CheckpointScope: Send + Sync {
    /// Called by the item source when the scan opens
    fn on_scan_open(&self);

    /// Called by the item source when the scan closes
    fn on_scan_close(&self, completed: bool);
}

/// Options for opening a scan
#[derive(Clone, Default)]
pub struct ScanOptions {
    /// Key space to cover
    pub prefix: PrefixFilter,
    /// Return the elements of collection items with each item
    pub with_elements: bool,
    /// Command-log scope, for checkpoint scans
    pub checkpoint_scope: Option<Arc<dyn CheckpointScope>>,
}

impl fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOptions")
            .field("prefix", &self.prefix)
            .field("with_elements", &self.with_elements)
            .field("checkpoint_scoped", &self.checkpoint_scope.is_some())
            .finish()
    }
}

/// One item returned by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedItem {
    /// The item
    pub item: Item,
    /// Its elements, when the scan was opened with `with_elements` and the
    /// item is a collection
    pub elements: Vec<Element>,
}

impl ScannedItem {
    /// Wrap an item with no elements
    pub fn new(item: Item) -> Self {
        ScannedItem {
            item,
            elements: Vec::new(),
        }
    }
}

/// Result of one `next_batch` call
#[derive(Debug)]
pub enum ScanBatch {
    /// Zero or more items. An empty batch is not the end of the scan.
    Items(Vec<ScannedItem>),
    /// The scan is exhausted
    End,
    /// The scan could not allocate its batch
    OutOfMemory,
}

/// An open scan cursor
pub trait ItemScan: Send {
    /// Fetch up to `capacity` items
    fn next_batch(&mut self, capacity: usize) -> ScanBatch;

    /// Return a batch obtained from `next_batch`
    fn release(&mut self, batch: Vec<ScannedItem>);

    /// Close the scan
    fn close(self: Box<Self>, completed: bool);
}

/// A store that can be scanned
pub trait ItemSource: Send + Sync {
    /// Open a scan cursor
    fn open_scan(&self, options: ScanOptions) -> Result<Box<dyn ItemScan>>;
}
