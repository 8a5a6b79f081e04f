//! Recovery module
//!
//! - `validity`: completion check on a snapshot artifact
//! - `replayer`: snapshot replayer (SnapshotReplayer, RedoStore)

pub mod replayer;
pub mod validity;

pub use replayer::{RedoError, RedoStore, ReplayStats, SnapshotReplayer};
pub use validity::check_file_validity;
