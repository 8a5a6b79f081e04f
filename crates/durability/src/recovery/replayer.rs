//! Snapshot replay for recovery
//!
//! Replays a DATA or CHKPT artifact into a [`RedoStore`], record by record,
//! until the Done record.
//!
//! # Replay Properties
//!
//! - **Ordered**: Records are applied in file order; each CollectionElement
//!   goes to the collection linked by the nearest preceding ItemLink
//! - **Tolerant**: A record the store rejects is logged and skipped
//! - **Bounded**: Out-of-memory in the store aborts replay
//! - **Complete**: A stream that ends before the Done record is corrupt
//!
//! # Usage
//!
//! ```ignore
//! let replayer = SnapshotReplayer::new(max_record_size);
//! let stats = replayer.apply(path, &store)?;
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cachesnap_core::{Element, Item, Result, SnapshotError};
use tracing::{debug, info, warn};

use crate::format::{LogRecord, LogRecordReader};

/// Target of snapshot replay.
///
/// Implemented by the item store being rebuilt. The owner handle pins a
/// collection item for as long as the replayer tracks it; dropping the
/// handle releases it.
pub trait RedoStore {
    /// Handle to a linked collection item
    type Owner;

    /// Link an item into the store, replacing any existing item with the
    /// same key.
    fn redo_link(&self, item: &Item) -> std::result::Result<(), RedoError>;

    /// Look up a collection item by key, pinning it.
    ///
    /// Returns `None` if no item with this key exists or it is not a
    /// collection.
    fn collection_owner(&self, key: &[u8]) -> Option<Self::Owner>;

    /// Insert an element into a pinned collection.
    fn redo_element(
        &self,
        owner: &Self::Owner,
        element: &Element,
    ) -> std::result::Result<(), RedoError>;
}

/// Failure of a single redo operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedoError {
    /// The store ran out of memory
    #[error("out of memory")]
    OutOfMemory,

    /// The store refused the record
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Statistics from snapshot replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Total number of records read, Done included
    pub records_read: usize,
    /// ItemLink records applied
    pub links_applied: usize,
    /// ItemLink records the store rejected
    pub links_skipped: usize,
    /// CollectionElement records applied
    pub elements_applied: usize,
    /// CollectionElement records rejected or without a collection to go to
    pub elements_skipped: usize,
    /// Replay stopped early because the engine is shutting down
    pub interrupted: bool,
}

impl ReplayStats {
    /// Create empty stats
    pub fn new() -> Self {
        ReplayStats::default()
    }

    /// Check if any records were skipped
    pub fn has_skipped(&self) -> bool {
        self.links_skipped > 0 || self.elements_skipped > 0
    }
}

/// Snapshot replay engine
pub struct SnapshotReplayer {
    max_record_size: usize,
    shutdown: Option<Arc<AtomicBool>>,
}

impl SnapshotReplayer {
    /// Create a replayer accepting records up to `max_record_size` bytes
    pub fn new(max_record_size: usize) -> Self {
        SnapshotReplayer {
            max_record_size,
            shutdown: None,
        }
    }

    /// Stop replay, successfully, once `flag` is set.
    ///
    /// The flag is checked once per record.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Largest accepted record
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    fn shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Replay the artifact at `path` into `store`.
    pub fn apply<S: RedoStore>(&self, path: &Path, store: &S) -> Result<ReplayStats> {
        info!(target: "cachesnap::recovery", path = %path.display(), "Applying snapshot file");

        let file = File::open(path).map_err(|e| {
            warn!(target: "cachesnap::recovery", path = %path.display(), error = %e, "Failed to open snapshot file");
            SnapshotError::Io(e)
        })?;

        let result = self.replay(LogRecordReader::new(BufReader::new(file), self.max_record_size), store);
        match &result {
            Ok(stats) if stats.interrupted => {
                info!(target: "cachesnap::recovery", records = stats.records_read, "Snapshot replay interrupted by shutdown");
            }
            Ok(stats) => {
                if stats.has_skipped() {
                    warn!(
                        target: "cachesnap::recovery",
                        links_skipped = stats.links_skipped,
                        elements_skipped = stats.elements_skipped,
                        "Skipped records during snapshot replay"
                    );
                }
                info!(target: "cachesnap::recovery", records = stats.records_read, "Snapshot replay succeeded");
            }
            Err(e) => {
                warn!(target: "cachesnap::recovery", path = %path.display(), error = %e, "Snapshot replay failed");
            }
        }
        result
    }

    /// Replay records from an open reader.
    pub fn replay<R, S>(&self, mut reader: LogRecordReader<R>, store: &S) -> Result<ReplayStats>
    where
        R: std::io::Read,
        S: RedoStore,
    {
        let mut stats = ReplayStats::new();
        let mut owner: Option<S::Owner> = None;
        let mut seen_link = false;

        loop {
            if self.shutting_down() {
                stats.interrupted = true;
                return Ok(stats);
            }

            let offset = reader.offset();
            let record = match reader.next_record()? {
                Some(record) => record,
                None => {
                    return Err(SnapshotError::corrupt(format!(
                        "snapshot ends at offset {} without a done record",
                        offset
                    )))
                }
            };
            stats.records_read += 1;

            match record {
                LogRecord::ItemLink(item) => {
                    seen_link = true;
                    match store.redo_link(&item) {
                        Ok(()) => stats.links_applied += 1,
                        Err(RedoError::OutOfMemory) => {
                            warn!(target: "cachesnap::recovery", offset, "Item link redo failed: out of memory");
                            return Err(SnapshotError::OutOfMemory);
                        }
                        Err(e) => {
                            warn!(target: "cachesnap::recovery", offset, error = %e, "Item link redo failed, skipping");
                            stats.links_skipped += 1;
                        }
                    }
                    // Release the previous collection before tracking the next
                    owner = None;
                    if item.is_collection() {
                        owner = store.collection_owner(&item.key);
                    }
                }
                LogRecord::CollectionElement(element) => {
                    if !seen_link {
                        return Err(SnapshotError::corrupt(format!(
                            "element record at offset {} precedes any item link",
                            offset
                        )));
                    }
                    let Some(current) = owner.as_ref() else {
                        debug!(target: "cachesnap::recovery", offset, "Element without a linked collection, skipping");
                        stats.elements_skipped += 1;
                        continue;
                    };
                    match store.redo_element(current, &element) {
                        Ok(()) => stats.elements_applied += 1,
                        Err(RedoError::OutOfMemory) => {
                            warn!(target: "cachesnap::recovery", offset, "Element redo failed: out of memory");
                            return Err(SnapshotError::OutOfMemory);
                        }
                        Err(e) => {
                            warn!(target: "cachesnap::recovery", offset, error = %e, "Element redo failed, skipping");
                            stats.elements_skipped += 1;
                        }
                    }
                }
                LogRecord::Done => {
                    drop(owner);
                    return Ok(stats);
                }
            }
        }
    }
}
