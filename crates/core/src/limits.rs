//! Size limits and defaults for snapshot runs
//!
//! Defaults can be overridden through the engine's `SnapshotConfig`; the
//! hard limits are properties of the on-disk record format.

/// Default snapshot buffer capacity (10 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Default number of items requested per scan batch
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 16;

/// Default maximum encoded record size, header included (2 MiB)
pub const DEFAULT_MAX_RECORD_SIZE: usize = 2 * 1024 * 1024;

/// Artifact path used when a request does not name one
pub const DEFAULT_SNAPSHOT_PATH: &str = "chkpt_snapshot";

/// Prefix delimiter within keys
pub const DEFAULT_PREFIX_DELIMITER: u8 = b':';

/// Longest key the record format can carry
pub const MAX_KEY_LENGTH: usize = u16::MAX as usize;

/// Bytes reserved per key-dump line in addition to the key itself:
/// type letter and two separators, up to 20 expiry digits, newline
pub const KEY_LINE_OVERHEAD: usize = 24;
