//! The snapshot store: a metadata + data file pair per snapshot.
//!
//! A snapshot is valid only once both files exist; the metadata file is
//! written first, so a metadata file without its data companion marks an
//! aborted put and is removed on listing. The two most recent snapshots are
//! always retained as a safety margin against races with a reader.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::StorageError;
use crate::storage::Snapshot;
use crate::store::codec;
use crate::store::meta::sync_dir;

/// Info about a persisted snapshot, parsed from its metadata filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SnapshotInfo {
    pub term: u64,
    pub index: u64,
    pub timestamp: u64,
    pub meta_filename: String,
}

impl SnapshotInfo {
    pub fn data_filename(&self) -> String {
        self.meta_filename.trim_end_matches(".meta").to_string()
    }

    /// The recency key: higher term wins, then higher index, then higher
    /// timestamp.
    fn sort_key(&self) -> (u64, u64, u64) {
        (self.term, self.index, self.timestamp)
    }
}

pub(crate) fn meta_filename(term: u64, index: u64, timestamp: u64) -> String {
    format!("snapshot-{}-{}-{}.meta", term, index, timestamp)
}

/// Parse a snapshot metadata filename (`snapshot-<term>-<index>-<ts>.meta`).
pub(crate) fn parse_meta_filename(name: &str) -> Option<SnapshotInfo> {
    let stem = name.strip_suffix(".meta")?;
    let rest = stem.strip_prefix("snapshot-")?;
    let mut parts = rest.splitn(3, '-');
    let term: u64 = parts.next()?.parse().ok()?;
    let index: u64 = parts.next()?.parse().ok()?;
    let timestamp: u64 = parts.next()?.parse().ok()?;
    Some(SnapshotInfo {
        term,
        index,
        timestamp,
        meta_filename: name.to_string(),
    })
}

/// List the snapshots in the directory, oldest first.
///
/// Metadata files with no data companion are leftovers of an aborted put and
/// are removed along the way.
pub(crate) fn list(dir: &Path) -> Result<Vec<SnapshotInfo>, StorageError> {
    let mut infos = Vec::new();
    for dirent in fs::read_dir(dir).map_err(StorageError::io)? {
        let dirent = dirent.map_err(StorageError::io)?;
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        let info = match parse_meta_filename(&name) {
            Some(info) => info,
            None => continue,
        };
        if !dir.join(info.data_filename()).exists() {
            tracing::warn!(meta = %info.meta_filename, "removing orphan snapshot metadata");
            let _ = fs::remove_file(dir.join(&info.meta_filename));
            continue;
        }
        infos.push(info);
    }
    infos.sort_by_key(|i| i.sort_key());
    Ok(infos)
}

/// Load the snapshot described by `info`.
pub(crate) fn load(dir: &Path, info: &SnapshotInfo) -> Result<Snapshot, StorageError> {
    let meta_buf = fs::read(dir.join(&info.meta_filename)).map_err(StorageError::io)?;
    let (configuration_index, configuration) = codec::decode_snapshot_meta(&meta_buf)?;
    let data = fs::read(dir.join(info.data_filename())).map_err(StorageError::io)?;
    Ok(Snapshot {
        last_index: info.index,
        last_term: info.term,
        configuration_index,
        configuration,
        data,
    })
}

/// Persist a snapshot: metadata first, then data, then a directory fsync.
pub(crate) fn put(dir: &Path, snapshot: &Snapshot, timestamp: u64) -> Result<SnapshotInfo, StorageError> {
    let info = SnapshotInfo {
        term: snapshot.last_term,
        index: snapshot.last_index,
        timestamp,
        meta_filename: meta_filename(snapshot.last_term, snapshot.last_index, timestamp),
    };

    let meta_buf = codec::encode_snapshot_meta(&snapshot.configuration, snapshot.configuration_index);
    write_file(&dir.join(&info.meta_filename), &meta_buf)?;
    write_file(&dir.join(info.data_filename()), &snapshot.data)?;
    sync_dir(dir)?;
    Ok(info)
}

/// Remove all snapshots except the last two.
pub(crate) fn prune(dir: &Path) -> Result<(), StorageError> {
    let infos = list(dir)?;
    if infos.len() <= 2 {
        return Ok(());
    }
    for info in &infos[..infos.len() - 2] {
        tracing::debug!(meta = %info.meta_filename, "pruning old snapshot");
        fs::remove_file(dir.join(&info.meta_filename)).map_err(StorageError::io)?;
        fs::remove_file(dir.join(info.data_filename())).map_err(StorageError::io)?;
    }
    sync_dir(dir)?;
    Ok(())
}

fn write_file(path: &Path, buf: &[u8]) -> Result<(), StorageError> {
    let mut file = fs::File::create(path)?;
    file.write_all(buf)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Configuration;
    use crate::membership::ServerRole;
    use tempfile::TempDir;

    fn snapshot(term: u64, index: u64) -> Snapshot {
        let mut configuration = Configuration::new();
        configuration.add(1, "n1", ServerRole::Voter).unwrap();
        Snapshot {
            last_index: index,
            last_term: term,
            configuration_index: 1,
            configuration,
            data: format!("state-at-{}", index).into_bytes(),
        }
    }

    #[test]
    fn test_put_then_load_latest() {
        let dir = TempDir::new().unwrap();
        put(dir.path(), &snapshot(1, 10), 100).unwrap();
        put(dir.path(), &snapshot(1, 20), 200).unwrap();
        put(dir.path(), &snapshot(2, 15), 300).unwrap();

        let infos = list(dir.path()).unwrap();
        // Higher term wins over higher index.
        let latest = infos.last().unwrap();
        assert_eq!((latest.term, latest.index), (2, 15));

        let loaded = load(dir.path(), latest).unwrap();
        assert_eq!(loaded, snapshot(2, 15));
    }

    #[test]
    fn test_timestamp_breaks_ties() {
        let dir = TempDir::new().unwrap();
        put(dir.path(), &snapshot(1, 10), 500).unwrap();
        put(dir.path(), &snapshot(1, 10), 900).unwrap();
        let infos = list(dir.path()).unwrap();
        assert_eq!(infos.last().unwrap().timestamp, 900);
    }

    #[test]
    fn test_prune_keeps_last_two() {
        let dir = TempDir::new().unwrap();
        for i in 1..=5u64 {
            put(dir.path(), &snapshot(1, i * 10), i * 100).unwrap();
        }
        prune(dir.path()).unwrap();

        let infos = list(dir.path()).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].index, 40);
        assert_eq!(infos[1].index, 50);

        // Pruning again is a no-op.
        prune(dir.path()).unwrap();
        assert_eq!(list(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_orphan_metadata_is_removed_on_list() {
        let dir = TempDir::new().unwrap();
        put(dir.path(), &snapshot(1, 10), 100).unwrap();
        // An aborted put: metadata without data.
        let orphan = meta_filename(1, 99, 999);
        fs::write(dir.path().join(&orphan), b"whatever").unwrap();

        let infos = list(dir.path()).unwrap();
        assert_eq!(infos.len(), 1);
        assert!(!dir.path().join(&orphan).exists());
    }
}
