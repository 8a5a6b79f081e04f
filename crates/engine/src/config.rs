//! Snapshot configuration via `snapshot.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields
//! the stock configuration. Settings are read once when the engine is
//! constructed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use cachesnap_core::limits::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_RECORD_SIZE, DEFAULT_SCAN_BATCH_SIZE, DEFAULT_SNAPSHOT_PATH,
};
use cachesnap_core::{Result, SnapshotError};
use cachesnap_durability::DONE_RECORD_SIZE;

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "snapshot.toml";

/// Snapshot configuration loaded from `snapshot.toml`.
///
/// # Example
///
/// ```toml
/// buffer_size = 10485760
/// scan_batch_size = 16
/// max_record_size = 2097152
/// default_file_path = "chkpt_snapshot"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot buffer capacity in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Items requested per scan batch.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// Largest record accepted, header included.
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,
    /// Artifact path used when a request does not name one.
    #[serde(default = "default_file_path")]
    pub default_file_path: PathBuf,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_scan_batch_size() -> usize {
    DEFAULT_SCAN_BATCH_SIZE
}

fn default_max_record_size() -> usize {
    DEFAULT_MAX_RECORD_SIZE
}

fn default_file_path() -> PathBuf {
    PathBuf::from(DEFAULT_SNAPSHOT_PATH)
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            scan_batch_size: default_scan_batch_size(),
            max_record_size: default_max_record_size(),
            default_file_path: default_file_path(),
        }
    }
}

impl SnapshotConfig {
    /// Check the settings for consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero batch size, or a maximum record
    /// size that cannot hold a Done record or does not fit the buffer.
    pub fn validate(&self) -> Result<()> {
        if self.scan_batch_size == 0 {
            return Err(SnapshotError::invalid("scan_batch_size must be at least 1"));
        }
        if self.max_record_size < DONE_RECORD_SIZE {
            return Err(SnapshotError::invalid(format!(
                "max_record_size {} is smaller than a done record ({} bytes)",
                self.max_record_size, DONE_RECORD_SIZE
            )));
        }
        if self.max_record_size > self.buffer_size {
            return Err(SnapshotError::invalid(format!(
                "max_record_size {} exceeds buffer_size {}",
                self.max_record_size, self.buffer_size
            )));
        }
        if self.default_file_path.as_os_str().is_empty() {
            return Err(SnapshotError::invalid("default_file_path is empty"));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Snapshot configuration
#
# Snapshot buffer capacity in bytes (default: 10 MiB).
# The buffer is allocated once and written out whenever it fills.
buffer_size = 10485760

# Items fetched from the item store per scan batch (default: 16).
# The stop flag is checked once per batch.
scan_batch_size = 16

# Largest record accepted on replay, header included (default: 2 MiB).
# Must not exceed buffer_size.
max_record_size = 2097152

# Artifact path used when a snapshot request names none.
default_file_path = "chkpt_snapshot"
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SnapshotConfig = toml::from_str(&content).map_err(|e| {
            SnapshotError::invalid(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SnapshotError::invalid(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = SnapshotConfig::default();
        assert_eq!(config.buffer_size, 10 * 1024 * 1024);
        assert_eq!(config.scan_batch_size, 16);
        assert_eq!(config.default_file_path, PathBuf::from("chkpt_snapshot"));
        config.validate().unwrap();
    }

    #[test]
    fn default_toml_matches_default() {
        let config: SnapshotConfig = toml::from_str(SnapshotConfig::default_toml()).unwrap();
        assert_eq!(config, SnapshotConfig::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: SnapshotConfig = toml::from_str("").unwrap();
        assert_eq!(config, SnapshotConfig::default());
    }

    #[test]
    fn partial_file_overrides() {
        let config: SnapshotConfig = toml::from_str("scan_batch_size = 64").unwrap();
        assert_eq!(config.scan_batch_size, 64);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero_batch = SnapshotConfig {
            scan_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_batch.validate(),
            Err(SnapshotError::InvalidArgument(_))
        ));

        let tiny_record = SnapshotConfig {
            max_record_size: 8,
            ..Default::default()
        };
        assert!(tiny_record.validate().is_err());

        let record_over_buffer = SnapshotConfig {
            buffer_size: 1024,
            max_record_size: 4096,
            ..Default::default()
        };
        assert!(record_over_buffer.validate().is_err());
    }

    #[test]
    fn write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(!path.exists());

        SnapshotConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());
        assert_eq!(
            SnapshotConfig::from_file(&path).unwrap(),
            SnapshotConfig::default()
        );
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "scan_batch_size = 4\n").unwrap();

        SnapshotConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(SnapshotConfig::from_file(&path).unwrap().scan_batch_size, 4);
    }

    #[test]
    fn write_to_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = SnapshotConfig {
            buffer_size: 4096,
            scan_batch_size: 2,
            max_record_size: 1024,
            default_file_path: PathBuf::from("/tmp/snap"),
        };
        config.write_to_file(&path).unwrap();
        assert_eq!(SnapshotConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn from_file_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "scan_batch_size = 0\n").unwrap();
        assert!(SnapshotConfig::from_file(&path).is_err());

        std::fs::write(&path, "buffer_size = \"big\"\n").unwrap();
        assert!(SnapshotConfig::from_file(&path).is_err());
    }
}
