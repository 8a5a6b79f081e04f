//! Snapshot modes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SnapshotError;

/// What a snapshot run writes
///
/// | Mode | Artifact | Replayable | Cancellable |
/// |------|----------|------------|-------------|
/// | `Key` | text lines, one per key | no | yes |
/// | `Data` | log records + Done | yes | yes |
/// | `Checkpoint` | log records + Done | yes | no |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotMode {
    /// Keys only, as text
    Key,
    /// Full data, as log records
    Data,
    /// Full data, scoped by the command-log checkpoint
    Checkpoint,
}

impl SnapshotMode {
    /// Name used in stats and admin commands
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotMode::Key => "KEY",
            SnapshotMode::Data => "DATA",
            SnapshotMode::Checkpoint => "CHKPT",
        }
    }

    /// Whether a stop request can end the run early.
    ///
    /// Checkpoint runs must produce a complete artifact matching the
    /// command-log epoch that scoped them.
    pub fn is_cancellable(self) -> bool {
        !matches!(self, SnapshotMode::Checkpoint)
    }

    /// Whether the run writes replayable log records
    pub fn writes_records(self) -> bool {
        !matches!(self, SnapshotMode::Key)
    }
}

impl fmt::Display for SnapshotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotMode {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KEY" => Ok(SnapshotMode::Key),
            "DATA" => Ok(SnapshotMode::Data),
            "CHKPT" => Ok(SnapshotMode::Checkpoint),
            _ => Err(SnapshotError::invalid(format!(
                "unknown snapshot mode '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<u8> for SnapshotMode {
    type Error = SnapshotError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(SnapshotMode::Key),
            1 => Ok(SnapshotMode::Data),
            2 => Ok(SnapshotMode::Checkpoint),
            _ => Err(SnapshotError::invalid(format!(
                "snapshot mode({}) is invalid",
                code
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("KEY".parse::<SnapshotMode>().unwrap(), SnapshotMode::Key);
        assert_eq!("data".parse::<SnapshotMode>().unwrap(), SnapshotMode::Data);
        assert_eq!(
            "chkpt".parse::<SnapshotMode>().unwrap(),
            SnapshotMode::Checkpoint
        );
    }

    #[test]
    fn test_unknown_modes_are_invalid_argument() {
        for bad in ["", "KEYS", "checkpoint", "3"] {
            assert!(matches!(
                bad.parse::<SnapshotMode>(),
                Err(SnapshotError::InvalidArgument(_))
            ));
        }
        for code in [3u8, 4, 255] {
            assert!(matches!(
                SnapshotMode::try_from(code),
                Err(SnapshotError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_mode_properties() {
        assert!(SnapshotMode::Key.is_cancellable());
        assert!(SnapshotMode::Data.is_cancellable());
        assert!(!SnapshotMode::Checkpoint.is_cancellable());
        assert!(!SnapshotMode::Key.writes_records());
        assert!(SnapshotMode::Checkpoint.writes_records());
        assert_eq!(SnapshotMode::Checkpoint.to_string(), "CHKPT");
    }
}
