//! Snapshot artifact validity check

use std::io::{Read, Seek, SeekFrom};

use cachesnap_core::{Result, SnapshotError};
use tracing::{debug, warn};

use crate::format::{LogRecord, DONE_RECORD_SIZE};

/// Check that an artifact ends with a Done record.
///
/// Returns the artifact size and leaves the file positioned at offset 0,
/// ready for replay. Anything short of a well-formed Done record at the
/// tail is `CorruptArtifact`.
pub fn check_file_validity<F: Read + Seek>(file: &mut F) -> Result<u64> {
    let size = file.seek(SeekFrom::End(0))?;
    if size < DONE_RECORD_SIZE as u64 {
        warn!(target: "cachesnap::recovery", size, "Snapshot file too small for a done record");
        return Err(SnapshotError::corrupt(format!(
            "file size {} is smaller than a done record",
            size
        )));
    }

    let offset = file.seek(SeekFrom::End(-(DONE_RECORD_SIZE as i64)))?;
    let mut tail = [0u8; DONE_RECORD_SIZE];
    file.read_exact(&mut tail)?;

    match LogRecord::from_bytes(&tail, DONE_RECORD_SIZE) {
        Ok((LogRecord::Done, _)) => {}
        Ok((other, _)) => {
            warn!(target: "cachesnap::recovery", record_type = ?other.record_type(), "Snapshot file does not end with a done record");
            return Err(SnapshotError::corrupt("last record is not a done record"));
        }
        Err(e) => {
            warn!(target: "cachesnap::recovery", error = %e, "Snapshot file does not end with a done record");
            return Err(SnapshotError::corrupt(format!("invalid done record: {}", e)));
        }
    }

    file.seek(SeekFrom::Start(0))?;
    let valid_size = offset + DONE_RECORD_SIZE as u64;
    debug!(target: "cachesnap::recovery", size = valid_size, "Snapshot file is complete");
    Ok(valid_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::LogRecordRef;
    use cachesnap_core::Item;
    use std::io::Cursor;

    fn complete() -> Vec<u8> {
        let mut out = Vec::new();
        LogRecordRef::ItemLink(&Item::kv("k", "v"))
            .encode_into(&mut out)
            .unwrap();
        LogRecordRef::Done.encode_into(&mut out).unwrap();
        out
    }

    #[test]
    fn test_complete_file_is_valid_and_rewound() {
        let bytes = complete();
        let mut cursor = Cursor::new(bytes.clone());
        let size = check_file_validity(&mut cursor).unwrap();
        assert_eq!(size, bytes.len() as u64);
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_truncated_file_is_invalid() {
        let bytes = complete();
        for cut in [0, 1, bytes.len() - DONE_RECORD_SIZE, bytes.len() - 1] {
            let mut cursor = Cursor::new(bytes[..cut].to_vec());
            let err = check_file_validity(&mut cursor).unwrap_err();
            assert!(err.is_corruption(), "cut at {} should be corrupt", cut);
        }
    }

    #[test]
    fn test_damaged_done_record_is_invalid() {
        let mut bytes = complete();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(check_file_validity(&mut Cursor::new(bytes))
            .unwrap_err()
            .is_corruption());
    }
}
