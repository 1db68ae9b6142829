//! Segment files: naming, loading, validation, truncation.
//!
//! Two filename classes: open segments (`open-<counter>`) are preallocated,
//! zero-filled files currently accepting writes; closed segments
//! (`<first>-<last>`, zero-padded inclusive raft indices) are sealed and
//! immutable.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::error::StorageError;
use crate::store::codec;
use crate::store::codec::WireEntry;

/// A parsed segment filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SegmentName {
    Closed { first: u64, last: u64 },
    Open { counter: u64 },
}

pub(crate) fn closed_filename(first: u64, last: u64) -> String {
    format!("{:016}-{:016}", first, last)
}

pub(crate) fn open_filename(counter: u64) -> String {
    format!("open-{}", counter)
}

/// Parse a directory entry name as a segment filename.
pub(crate) fn parse_filename(name: &str) -> Option<SegmentName> {
    if let Some(counter) = name.strip_prefix("open-") {
        let counter: u64 = counter.parse().ok()?;
        return Some(SegmentName::Open { counter });
    }
    let (first, last) = name.split_once('-')?;
    if first.len() != 16 || last.len() != 16 {
        return None;
    }
    let first: u64 = first.parse().ok()?;
    let last: u64 = last.parse().ok()?;
    if first == 0 || last < first {
        return None;
    }
    Some(SegmentName::Closed { first, last })
}

/// Load a closed segment. Any decoding failure is corruption: closed
/// segments are sealed with their checksums intact.
pub(crate) fn load_closed(path: &Path, first: u64, last: u64) -> Result<Vec<WireEntry>, StorageError> {
    let buf = fs::read(path).map_err(StorageError::io)?;
    if buf.len() < 8 {
        return Err(StorageError::corrupt(anyhow::anyhow!(
            "closed segment {} too short",
            path.display()
        )));
    }
    let format = LittleEndian::read_u64(&buf[0..]);
    if format != codec::DISK_FORMAT {
        return Err(StorageError::malformed(anyhow::anyhow!(
            "closed segment {}: unsupported format {format}",
            path.display()
        )));
    }

    let mut entries = Vec::new();
    let mut off = 8usize;
    loop {
        match codec::decode_batch(&buf, &mut off) {
            Ok(Some(batch)) => entries.extend(batch),
            Ok(None) => break,
            Err(e) => {
                return Err(StorageError::corrupt(anyhow::anyhow!(
                    "closed segment {}: {:?} at offset {off}",
                    path.display(),
                    e
                )));
            }
        }
    }

    let expected = (last - first + 1) as usize;
    if entries.len() != expected {
        return Err(StorageError::corrupt(anyhow::anyhow!(
            "closed segment {}: holds {} entries, filename promises {expected}",
            path.display(),
            entries.len()
        )));
    }
    Ok(entries)
}

/// Load an open segment, tolerating a torn tail.
///
/// Returns the intact entries and the byte offset of the end of the last
/// intact batch, to which the file should be truncated on repair. An open
/// segment which was allocated but never written loads as empty with offset
/// zero.
pub(crate) fn load_open(path: &Path) -> Result<(Vec<WireEntry>, u64), StorageError> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        // Unlinked between listing and reading: a canceled pool allocation.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(StorageError::io(e)),
    };
    if buf.len() < 8 {
        return Ok((Vec::new(), 0));
    }
    let format = LittleEndian::read_u64(&buf[0..]);
    if format == 0 {
        // Preallocated but never written.
        return Ok((Vec::new(), 0));
    }
    if format != codec::DISK_FORMAT {
        return Err(StorageError::malformed(anyhow::anyhow!(
            "open segment {}: unsupported format {format}",
            path.display()
        )));
    }

    let mut entries = Vec::new();
    let mut off = 8usize;
    let mut good = 8u64;
    loop {
        match codec::decode_batch(&buf, &mut off) {
            Ok(Some(batch)) => {
                entries.extend(batch);
                good = off as u64;
            }
            Ok(None) => break,
            Err(e) => {
                // A torn write: everything up to `good` is intact.
                tracing::warn!(segment = %path.display(), error = ?e, offset = off, "repairing torn segment tail");
                break;
            }
        }
    }
    Ok((entries, good))
}

/// Write a closed segment holding the given entries, durably: temp file,
/// fsync, rename into place. The caller fsyncs the directory.
pub(crate) fn write_closed(dir: &Path, first: u64, last: u64, entries: &[WireEntry]) -> Result<PathBuf, StorageError> {
    debug_assert_eq!(entries.len() as u64, last - first + 1);
    let name = closed_filename(first, last);
    let tmp = dir.join(format!("{}.tmp", name));
    let path = dir.join(&name);

    let mut buf = vec![0u8; 8];
    LittleEndian::write_u64(&mut buf[0..], codec::DISK_FORMAT);
    buf.extend_from_slice(&codec::encode_batch(entries));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wire(term: u64, tag: u8) -> WireEntry {
        WireEntry {
            term,
            etype: codec::ENTRY_COMMAND,
            payload: vec![tag; 5],
        }
    }

    #[test]
    fn test_filename_round_trip() {
        assert_eq!(
            parse_filename(&closed_filename(16, 32)),
            Some(SegmentName::Closed { first: 16, last: 32 })
        );
        assert_eq!(parse_filename(&open_filename(7)), Some(SegmentName::Open { counter: 7 }));
        assert_eq!(parse_filename("metadata"), None);
        assert_eq!(parse_filename("snapshot-1-2-3.meta"), None);
        // A closed segment range can never be inverted or start at zero.
        assert_eq!(parse_filename(&closed_filename(1, 1)).is_some(), true);
        assert_eq!(parse_filename("0000000000000005-0000000000000002"), None);
    }

    #[test]
    fn test_closed_segment_round_trip() {
        let dir = TempDir::new().unwrap();
        let entries = vec![wire(1, 1), wire(1, 2), wire(2, 3)];
        let path = write_closed(dir.path(), 4, 6, &entries).unwrap();
        let loaded = load_closed(&path, 4, 6).unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_closed_segment_entry_count_must_match_filename() {
        let dir = TempDir::new().unwrap();
        let entries = vec![wire(1, 1), wire(1, 2)];
        let path = write_closed(dir.path(), 4, 5, &entries).unwrap();
        let err = load_closed(&path, 4, 6).unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Corrupt);
    }

    #[test]
    fn test_open_segment_torn_tail_repair() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(open_filename(1));

        let mut buf = vec![0u8; 8];
        LittleEndian::write_u64(&mut buf[0..], codec::DISK_FORMAT);
        let first = codec::encode_batch(&[wire(1, 1), wire(1, 2)]);
        buf.extend_from_slice(&first);
        let good = buf.len() as u64;
        // A second batch, torn mid-write.
        let second = codec::encode_batch(&[wire(1, 3)]);
        buf.extend_from_slice(&second[..second.len() - 3]);
        fs::write(&path, &buf).unwrap();

        let (entries, repaired) = load_open(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(repaired, good);
    }

    #[test]
    fn test_never_written_open_segment_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(open_filename(3));
        fs::write(&path, vec![0u8; 4096]).unwrap();
        let (entries, good) = load_open(&path).unwrap();
        assert!(entries.is_empty());
        assert_eq!(good, 0);
    }
}
