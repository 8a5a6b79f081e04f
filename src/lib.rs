//! cachesnap - Checkpoint snapshots for an in-memory cache server
//!
//! cachesnap writes point-in-time snapshots of a cache's items to a file and
//! replays them into an empty cache at startup. Three modes are supported:
//! KEY (a text listing of keys), DATA and CHKPT (replayable log records).
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use cachesnap::{MemStore, SnapshotConfig, SnapshotEngine, SnapshotMode, SnapshotRequest};
//!
//! let store = MemStore::new();
//! let engine = SnapshotEngine::new(SnapshotConfig::default(), Arc::new(store.clone()), None)?;
//!
//! // Write a replayable snapshot on this thread
//! engine.run_direct(SnapshotRequest::new(SnapshotMode::Data).with_path("data_snapshot"))?;
//!
//! // Rebuild a fresh cache from it
//! let restored = MemStore::new();
//! engine.apply_file("data_snapshot".as_ref(), &restored)?;
//! ```
//!
//! # Architecture
//!
//! - `cachesnap-core`: item model, modes, prefix filters, errors
//! - `cachesnap-durability`: record format, buffered writer, validity check, replay
//! - `cachesnap-engine`: run control, dump strategies, background worker, config

// Re-export the public API from cachesnap-engine
pub use cachesnap_engine::*;

/// Record format and recovery internals
pub mod durability {
    pub use cachesnap_durability::*;
}
