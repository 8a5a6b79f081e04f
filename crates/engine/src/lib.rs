//! Snapshot engine for cachesnap
//!
//! This crate orchestrates the lower layers into snapshot runs:
//! - SnapshotEngine: run anchor, start/stop/stats, exclusivity
//! - Dump strategies: key listing and replayable records
//! - Scan contract: the item store's batched cursor and checkpoint hooks
//! - Background worker for asynchronous runs
//! - Configuration via `snapshot.toml`
//! - MemStore: reference item store for end-to-end runs and tests
//!
//! The engine is the only component that knows about:
//! - Run lifecycle and cancellation
//! - Cross-layer coordination (scan + writer + replay)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod config;
pub mod dump;
pub mod memstore;
pub mod scan;
pub mod snapshot;

pub use background::{SnapshotWorker, WorkerStats};
pub use config::{SnapshotConfig, CONFIG_FILE_NAME};
pub use dump::{DumpContext, DumpStrategy};
pub use memstore::{MemStore, PinnedCollection};
pub use scan::{CheckpointScope, ItemScan, ItemSource, ScanBatch, ScanOptions, ScannedItem};
pub use snapshot::{
    SnapshotCallback, SnapshotEngine, SnapshotReport, SnapshotRequest, SnapshotTicket,
};

pub use cachesnap_core::{
    Element, Expiry, Item, ItemType, PrefixFilter, Result, SnapshotError, SnapshotMode,
};
pub use cachesnap_durability::{check_file_validity, RedoError, RedoStore, ReplayStats};
