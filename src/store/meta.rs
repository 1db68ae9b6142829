//! The term/vote metadata file.
//!
//! A single fixed-size record, updated atomically: write a temporary file,
//! fsync it, rename it over `metadata`, then fsync the directory.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::StorageError;
use crate::storage::HardState;
use crate::store::codec;

const METADATA_FILE: &str = "metadata";
const METADATA_TMP: &str = "metadata.tmp";

/// Read the hard state from disk; a missing file means a pristine node.
pub(crate) fn load(dir: &Path) -> Result<HardState, StorageError> {
    let path = dir.join(METADATA_FILE);
    let buf = match fs::read(&path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HardState::default()),
        Err(e) => return Err(StorageError::io(e)),
    };
    let (term, voted_for) = codec::decode_metadata(&buf)?;
    Ok(HardState {
        current_term: term,
        voted_for: if voted_for == 0 { None } else { Some(voted_for) },
    })
}

/// Durably store the hard state.
pub(crate) fn store(dir: &Path, hs: &HardState) -> Result<(), StorageError> {
    let buf = codec::encode_metadata(hs.current_term, hs.voted_for.unwrap_or(0));
    let tmp = dir.join(METADATA_TMP);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(METADATA_FILE))?;
    sync_dir(dir)?;
    Ok(())
}

/// Fsync a directory so renames and unlinks within it are durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    let handle = fs::File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_pristine() {
        let dir = TempDir::new().unwrap();
        let hs = load(dir.path()).unwrap();
        assert_eq!(hs, HardState::default());
    }

    #[test]
    fn test_store_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let hs = HardState {
            current_term: 12,
            voted_for: Some(3),
        };
        store(dir.path(), &hs).unwrap();
        assert_eq!(load(dir.path()).unwrap(), hs);

        // Overwrite with a cleared vote.
        let hs2 = HardState {
            current_term: 13,
            voted_for: None,
        };
        store(dir.path(), &hs2).unwrap();
        assert_eq!(load(dir.path()).unwrap(), hs2);

        // The temporary file never survives.
        assert!(!dir.path().join(METADATA_TMP).exists());
    }

    #[test]
    fn test_corrupt_metadata_is_reported() {
        let dir = TempDir::new().unwrap();
        store(
            dir.path(),
            &HardState {
                current_term: 5,
                voted_for: Some(1),
            },
        )
        .unwrap();
        let path = dir.path().join(METADATA_FILE);
        let mut buf = fs::read(&path).unwrap();
        buf[10] ^= 0xFF;
        fs::write(&path, &buf).unwrap();
        let err = load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Corrupt);
    }
}
