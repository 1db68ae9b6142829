//! The built-in durable store: segmented log files plus a snapshot store.
//!
//! Layout of a data directory:
//!
//! ```text
//! metadata                       term/vote record
//! open-<counter>                 preallocated segment accepting writes
//! <first>-<last>                 sealed, immutable segment
//! snapshot-<term>-<index>-<ts>       state machine payload
//! snapshot-<term>-<index>-<ts>.meta  snapshot metadata
//! ```
//!
//! All mutating operations serialize behind one async lock, which doubles as
//! the write barrier: a truncation or snapshot installation can only run once
//! outstanding appends have drained. Blocking file I/O runs on the blocking
//! thread pool.

pub(crate) mod codec;
pub(crate) mod meta;
pub(crate) mod prepare;
pub(crate) mod segment;
pub(crate) mod snapshot;
#[cfg(test)]
mod test;

use std::collections::BTreeMap;
use std::fs;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

use crate::error::StorageError;
use crate::membership::Configuration;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::storage::HardState;
use crate::storage::InitialState;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::storage::StateMachine;
use crate::store::codec::WireEntry;
use crate::store::prepare::PreparePool;
use crate::store::prepare::PreparedSegment;
use crate::AppData;
use crate::AppDataResponse;

/// Tuning knobs for a [`DiskStore`].
#[derive(Debug, Clone)]
pub struct DiskStoreOptions {
    /// Size in bytes of each preallocated segment file.
    pub segment_size: u64,
}

impl Default for DiskStoreOptions {
    fn default() -> Self {
        Self {
            segment_size: 4 * 1024 * 1024,
        }
    }
}

/// A closed segment on disk.
#[derive(Debug, Clone)]
struct ClosedSegment {
    first: u64,
    last: u64,
    filename: String,
}

/// The open segment currently accepting writes.
struct ActiveSegment {
    path: PathBuf,
    file: fs::File,
    first_index: u64,
    /// Last index written, 0 when the segment is still empty.
    last_index: u64,
    /// Bytes written so far (including the format header).
    written: u64,
    size: u64,
}

struct StoreState<D: AppData> {
    closed: bool,
    errored: bool,
    hard_state: HardState,
    /// In-memory mirror of every entry still present in segment files.
    log: BTreeMap<u64, Entry<D>>,
    /// The most recent snapshot, fully loaded.
    snapshot: Option<Snapshot>,
    /// Index of the last entry applied to the state machine.
    applied: u64,
    closed_segments: Vec<ClosedSegment>,
    active: Option<ActiveSegment>,
    /// Index the next appended entry will take.
    append_next: u64,
    /// State reported to the core at startup.
    initial: InitialState,
}

/// The production [`RaftStorage`] implementation: a segmented append-only
/// log, a paired snapshot store, and the user's [`StateMachine`].
pub struct DiskStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    dir: PathBuf,
    sm: M,
    segment_size: u64,
    prepare: PreparePool,
    state: Mutex<StoreState<D>>,
    _marker: PhantomData<fn() -> R>,
}

impl<D, R, M> DiskStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    /// Open (or create) a data directory, performing crash recovery:
    /// validate closed segments, repair a torn tail in the open segment,
    /// remove stray files, and restore the state machine from the latest
    /// snapshot.
    pub async fn open(dir: impl Into<PathBuf>, options: DiskStoreOptions, sm: M) -> Result<Self, StorageError> {
        let dir: PathBuf = dir.into();
        fs::create_dir_all(&dir)?;

        let load_dir = dir.clone();
        let loaded = spawn_blocking(move || load_directory::<D>(&load_dir))
            .await
            .map_err(|e| StorageError::io(anyhow::anyhow!("load task panicked: {e}")))??;

        // Restore the state machine from the snapshot (an index-0 snapshot is
        // the bootstrap baseline and carries only a configuration).
        let mut applied = 0;
        if let Some(snapshot) = &loaded.snapshot {
            if snapshot.last_index > 0 {
                sm.restore(snapshot.last_index, &snapshot.data)
                    .await
                    .map_err(StorageError::io)?;
                applied = snapshot.last_index;
            }
        }

        let last_log_index = loaded.log.keys().next_back().copied().unwrap_or(0);
        let snapshot_last = loaded.snapshot.as_ref().filter(|s| s.last_index > 0).map(|s| (s.last_term, s.last_index));
        let last_log_index = last_log_index.max(snapshot_last.map(|(_, i)| i).unwrap_or(0));
        let last_log_term = loaded
            .log
            .values()
            .next_back()
            .map(|e| e.term)
            .or(snapshot_last.map(|(t, _)| t))
            .unwrap_or(0);

        // The active configuration is the latest configuration entry in the
        // log, else the snapshot's.
        let mut configuration = Configuration::new();
        let mut configuration_index = 0;
        if let Some(snapshot) = &loaded.snapshot {
            configuration = snapshot.configuration.clone();
            configuration_index = snapshot.configuration_index;
        }
        for (index, entry) in loaded.log.iter() {
            if let EntryPayload::Configuration(cfg) = &entry.payload {
                configuration = cfg.clone();
                configuration_index = *index;
            }
        }

        let initial = InitialState {
            last_log_index,
            last_log_term,
            last_applied: applied,
            hard_state: loaded.hard_state.clone(),
            configuration,
            configuration_index,
            snapshot_last,
        };

        let prepare = PreparePool::new(dir.clone(), options.segment_size, loaded.next_counter);
        prepare.prewarm();

        let state = StoreState {
            closed: false,
            errored: false,
            hard_state: loaded.hard_state,
            log: loaded.log,
            snapshot: loaded.snapshot,
            applied,
            closed_segments: loaded.closed_segments,
            active: None,
            append_next: last_log_index + 1,
            initial,
        };

        Ok(Self {
            dir,
            sm,
            segment_size: options.segment_size,
            prepare,
            state: Mutex::new(state),
            _marker: PhantomData,
        })
    }

    /// Access the wrapped state machine.
    pub fn state_machine(&self) -> &M {
        &self.sm
    }

    /// `(ready, inflight)` of the prepare pool, for invariant checks.
    #[cfg(test)]
    pub(crate) fn prepare_stats(&self) -> (usize, usize) {
        self.prepare.stats()
    }

    fn check_usable(state: &StoreState<D>) -> Result<(), StorageError> {
        if state.closed {
            return Err(StorageError::shutdown());
        }
        if state.errored {
            return Err(StorageError::io(anyhow::anyhow!("store is errored, writes refused")));
        }
        Ok(())
    }

    /// Seal the active segment: truncate to its used size, rename it to its
    /// closed name, and fsync the directory.
    async fn finalize_active(&self, state: &mut StoreState<D>) -> Result<(), StorageError> {
        let active = match state.active.take() {
            Some(active) => active,
            None => return Ok(()),
        };
        debug_assert!(active.last_index >= active.first_index);
        let filename = segment::closed_filename(active.first_index, active.last_index);
        let dir = self.dir.clone();
        let from = active.path.clone();
        let to = self.dir.join(&filename);
        let file = active.file.try_clone()?;
        let written = active.written;
        spawn_blocking(move || -> Result<(), StorageError> {
            file.set_len(written)?;
            file.sync_all()?;
            fs::rename(&from, &to)?;
            meta::sync_dir(&dir)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::io(anyhow::anyhow!("finalize task panicked: {e}")))??;

        state.closed_segments.push(ClosedSegment {
            first: active.first_index,
            last: active.last_index,
            filename,
        });
        tracing::debug!(first = active.first_index, last = active.last_index, "finalized segment");
        Ok(())
    }

    /// Adopt a freshly prepared segment as the active one.
    fn adopt_prepared(&self, state: &mut StoreState<D>, prepared: PreparedSegment, size: u64) {
        tracing::debug!(counter = prepared.counter, first_index = state.append_next, "adopting prepared segment");
        state.active = Some(ActiveSegment {
            path: prepared.path,
            file: prepared.file,
            first_index: state.append_next,
            last_index: 0,
            written: 0,
            size,
        });
    }

    /// Write `buf` at `offset` in the active segment and fsync it.
    async fn write_active(&self, state: &mut StoreState<D>, offset: u64, buf: Vec<u8>) -> Result<(), StorageError> {
        let active = state.active.as_mut().expect("active segment present");
        let mut file = active.file.try_clone()?;
        spawn_blocking(move || -> Result<(), StorageError> {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&buf)?;
            file.sync_data()?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::io(anyhow::anyhow!("write task panicked: {e}")))??;
        Ok(())
    }

    fn now_millis() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// Persist a snapshot pair and prune snapshots to the last two.
    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let dir = self.dir.clone();
        spawn_blocking(move || -> Result<(), StorageError> {
            snapshot::put(&dir, &snapshot, Self::now_millis())?;
            snapshot::prune(&dir)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::io(anyhow::anyhow!("snapshot task panicked: {e}")))??;
        Ok(())
    }
}

#[async_trait]
impl<D, R, M> RaftStorage<D, R> for DiskStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    async fn get_initial_state(&self) -> Result<InitialState, StorageError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StorageError::shutdown());
        }
        Ok(state.initial.clone())
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        Self::check_usable(&state)?;
        debug_assert!(
            hs.current_term >= state.hard_state.current_term,
            "term must never decrease"
        );
        let dir = self.dir.clone();
        let hs_clone = hs.clone();
        let res = spawn_blocking(move || meta::store(&dir, &hs_clone))
            .await
            .map_err(|e| StorageError::io(anyhow::anyhow!("metadata task panicked: {e}")))?;
        if let Err(err) = res {
            state.errored = true;
            return Err(err);
        }
        state.hard_state = hs.clone();
        Ok(())
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>, StorageError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StorageError::shutdown());
        }
        Ok(state.log.range(start..stop).map(|(_, e)| e.clone()).collect())
    }

    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<D>>, StorageError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StorageError::shutdown());
        }
        Ok(state.log.get(&index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[Entry<D>]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        Self::check_usable(&state)?;
        debug_assert_eq!(entries[0].index, state.append_next);

        let wires = entries.iter().map(entry_to_wire).collect::<Result<Vec<_>, _>>()?;
        let batch = codec::encode_batch(&wires);
        if batch.len() as u64 + 8 > self.segment_size {
            state.errored = true;
            return Err(StorageError::io(anyhow::anyhow!(
                "entry batch of {} bytes exceeds the segment size",
                batch.len()
            )));
        }

        // Roll to the next prepared segment when the active one is too full.
        let needs_roll = state
            .active
            .as_ref()
            .map(|a| a.written + batch.len() as u64 > a.size)
            .unwrap_or(false);
        if needs_roll {
            if let Err(err) = self.finalize_active(&mut state).await {
                state.errored = true;
                return Err(err);
            }
        }
        if state.active.is_none() {
            let size = self.segment_size;
            let prepared = match self.prepare.acquire().await {
                Ok(prepared) => prepared,
                Err(err) => {
                    if err.kind() == crate::StorageErrorKind::Io {
                        state.errored = true;
                    }
                    return Err(err);
                }
            };
            self.adopt_prepared(&mut state, prepared, size);
        }

        // First write into a fresh segment carries the format header.
        let (offset, buf) = {
            let active = state.active.as_ref().expect("active segment present");
            if active.written == 0 {
                let mut buf = vec![0u8; 8];
                LittleEndian::write_u64(&mut buf[0..], codec::DISK_FORMAT);
                buf.extend_from_slice(&batch);
                (0, buf)
            } else {
                (active.written, batch)
            }
        };
        let len = buf.len() as u64;
        if let Err(err) = self.write_active(&mut state, offset, buf).await {
            state.errored = true;
            return Err(err);
        }

        let last = entries.last().expect("entries not empty").index;
        {
            let active = state.active.as_mut().expect("active segment present");
            active.written = offset + len;
            active.last_index = last;
        }
        for entry in entries {
            state.log.insert(entry.index, entry.clone());
        }
        state.append_next = last + 1;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn truncate_log(&self, from: u64) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        Self::check_usable(&state)?;
        if from >= state.append_next {
            return Ok(());
        }

        // Entries at and above `from` leave the in-memory mirror first; the
        // survivors below are needed to rewrite a spanning segment.
        let dropped = state.log.split_off(&from);
        drop(dropped);

        // The active segment: discarded entirely, or rewritten in place.
        if let Some(active) = state.active.take() {
            if from <= active.first_index {
                drop(active.file);
                if let Err(e) = fs::remove_file(&active.path) {
                    state.errored = true;
                    return Err(StorageError::io(e));
                }
            } else if active.last_index >= from {
                let keep: Vec<WireEntry> = state
                    .log
                    .range(active.first_index..from)
                    .map(|(_, e)| entry_to_wire(e))
                    .collect::<Result<_, _>>()?;
                let mut buf = vec![0u8; 8];
                LittleEndian::write_u64(&mut buf[0..], codec::DISK_FORMAT);
                buf.extend_from_slice(&codec::encode_batch(&keep));
                let size = active.size;
                let written = buf.len() as u64;
                let file = active.file.try_clone()?;
                let res = spawn_blocking(move || -> Result<(), StorageError> {
                    // Clear the old contents, keep the preallocated extent.
                    file.set_len(0)?;
                    file.set_len(size)?;
                    let mut file = file;
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(&buf)?;
                    file.sync_all()?;
                    Ok(())
                })
                .await
                .map_err(|e| StorageError::io(anyhow::anyhow!("truncate task panicked: {e}")))?;
                if let Err(err) = res {
                    state.errored = true;
                    return Err(err);
                }
                state.active = Some(ActiveSegment {
                    written,
                    last_index: from - 1,
                    ..active
                });
            } else {
                state.active = Some(active);
            }
        }

        // Closed segments fully at or above `from` are unlinked; one spanning
        // `from` is rewritten to its surviving prefix.
        let mut kept = Vec::with_capacity(state.closed_segments.len());
        for seg in std::mem::take(&mut state.closed_segments) {
            if seg.first >= from {
                if let Err(e) = fs::remove_file(self.dir.join(&seg.filename)) {
                    state.errored = true;
                    return Err(StorageError::io(e));
                }
            } else if seg.last >= from {
                let keep: Vec<WireEntry> = state
                    .log
                    .range(seg.first..from)
                    .map(|(_, e)| entry_to_wire(e))
                    .collect::<Result<_, _>>()?;
                let dir = self.dir.clone();
                let first = seg.first;
                let old = seg.filename.clone();
                let res = spawn_blocking(move || -> Result<String, StorageError> {
                    let path = segment::write_closed(&dir, first, from - 1, &keep)?;
                    fs::remove_file(dir.join(&old))?;
                    Ok(path.file_name().expect("segment filename").to_string_lossy().into_owned())
                })
                .await
                .map_err(|e| StorageError::io(anyhow::anyhow!("truncate task panicked: {e}")))?;
                match res {
                    Ok(filename) => kept.push(ClosedSegment {
                        first: seg.first,
                        last: from - 1,
                        filename,
                    }),
                    Err(err) => {
                        state.errored = true;
                        return Err(err);
                    }
                }
            } else {
                kept.push(seg);
            }
        }
        state.closed_segments = kept;
        state.append_next = from;

        let dir = self.dir.clone();
        spawn_blocking(move || meta::sync_dir(&dir))
            .await
            .map_err(|e| StorageError::io(anyhow::anyhow!("sync task panicked: {e}")))??;
        Ok(())
    }

    async fn apply_entry_to_state_machine(&self, index: u64, data: &D) -> Result<R, StorageError> {
        let res = self.sm.apply(index, data).await.map_err(StorageError::io)?;
        let mut state = self.state.lock().await;
        state.applied = state.applied.max(index);
        Ok(res)
    }

    async fn replicate_to_state_machine(&self, entries: &[(u64, &D)]) -> Result<(), StorageError> {
        for (index, data) in entries {
            self.sm.apply(*index, data).await.map_err(StorageError::io)?;
        }
        if let Some((last, _)) = entries.last() {
            let mut state = self.state.lock().await;
            state.applied = state.applied.max(*last);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn build_snapshot(&self, trailing: u64) -> Result<Snapshot, StorageError> {
        let mut state = self.state.lock().await;
        Self::check_usable(&state)?;
        let last_index = state.applied;
        if last_index == 0 {
            return Err(StorageError::io(anyhow::anyhow!("nothing applied yet, no snapshot to build")));
        }

        let last_term = state
            .log
            .get(&last_index)
            .map(|e| e.term)
            .or_else(|| state.snapshot.as_ref().filter(|s| s.last_index == last_index).map(|s| s.last_term))
            .ok_or_else(|| StorageError::corrupt(anyhow::anyhow!("term of applied index {last_index} unknown")))?;

        // The configuration as of the snapshot: the most recent
        // configuration entry at or below it.
        let from_log = state
            .log
            .range(..=last_index)
            .rev()
            .find_map(|(index, entry)| match &entry.payload {
                EntryPayload::Configuration(cfg) => Some((*index, cfg.clone())),
                _ => None,
            });
        let (configuration_index, configuration) = match from_log {
            Some((index, cfg)) => (index, cfg),
            None => match &state.snapshot {
                Some(s) => (s.configuration_index, s.configuration.clone()),
                None => (state.initial.configuration_index, state.initial.configuration.clone()),
            },
        };

        let data = self.sm.snapshot().await.map_err(StorageError::io)?;
        let snapshot = Snapshot {
            last_index,
            last_term,
            configuration_index,
            configuration,
            data,
        };

        self.put_snapshot(snapshot.clone()).await?;

        // Prune closed segments wholly below the trailing window.
        let retain_first = last_index.saturating_sub(trailing) + 1;
        let mut kept = Vec::with_capacity(state.closed_segments.len());
        for seg in std::mem::take(&mut state.closed_segments) {
            if seg.last < retain_first {
                tracing::debug!(first = seg.first, last = seg.last, "pruning segment behind snapshot");
                if let Err(e) = fs::remove_file(self.dir.join(&seg.filename)) {
                    state.errored = true;
                    return Err(StorageError::io(e));
                }
            } else {
                kept.push(seg);
            }
        }
        state.closed_segments = kept;

        // The in-memory mirror follows the files still on disk.
        let floor = state
            .closed_segments
            .iter()
            .map(|s| s.first)
            .chain(state.active.as_ref().map(|a| a.first_index))
            .min()
            .unwrap_or(state.append_next);
        state.log = state.log.split_off(&floor);
        state.snapshot = Some(snapshot.clone());

        let dir = self.dir.clone();
        spawn_blocking(move || meta::sync_dir(&dir))
            .await
            .map_err(|e| StorageError::io(anyhow::anyhow!("sync task panicked: {e}")))??;

        tracing::info!(last_index, "snapshot taken");
        Ok(snapshot)
    }

    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(last_index = snapshot.last_index))]
    async fn install_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        Self::check_usable(&state)?;

        self.sm
            .restore(snapshot.last_index, &snapshot.data)
            .await
            .map_err(StorageError::io)?;

        self.put_snapshot(snapshot.clone()).await?;

        // The whole log is superseded by the snapshot.
        if let Some(active) = state.active.take() {
            drop(active.file);
            if let Err(e) = fs::remove_file(&active.path) {
                state.errored = true;
                return Err(StorageError::io(e));
            }
        }
        for seg in std::mem::take(&mut state.closed_segments) {
            if let Err(e) = fs::remove_file(self.dir.join(&seg.filename)) {
                state.errored = true;
                return Err(StorageError::io(e));
            }
        }
        state.log.clear();
        state.append_next = snapshot.last_index + 1;
        state.applied = snapshot.last_index;
        state.snapshot = Some(snapshot.clone());

        let dir = self.dir.clone();
        spawn_blocking(move || meta::sync_dir(&dir))
            .await
            .map_err(|e| StorageError::io(anyhow::anyhow!("sync task panicked: {e}")))??;
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StorageError::shutdown());
        }
        Ok(state.snapshot.as_ref().filter(|s| s.last_index > 0).cloned())
    }

    #[tracing::instrument(level = "debug", skip(self, configuration))]
    async fn bootstrap(&self, configuration: &Configuration) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        Self::check_usable(&state)?;
        if !state.log.is_empty() || state.snapshot.is_some() || state.hard_state.current_term != 0 {
            return Err(StorageError::io(anyhow::anyhow!("cannot bootstrap a non-pristine store")));
        }

        // The seed configuration is stored as a baseline snapshot at index 0,
        // so the log proper starts at index 1.
        let baseline = Snapshot {
            last_index: 0,
            last_term: 0,
            configuration_index: 0,
            configuration: configuration.clone(),
            data: Vec::new(),
        };
        self.put_snapshot(baseline.clone()).await?;
        state.snapshot = Some(baseline);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.prepare.close();
        // The active segment keeps its contents; recovery finalizes it on
        // the next start.
        state.active = None;
        Ok(())
    }
}

/// Everything recovered from a data directory at open time.
struct LoadedDirectory<D: AppData> {
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    log: BTreeMap<u64, Entry<D>>,
    closed_segments: Vec<ClosedSegment>,
    next_counter: u64,
}

/// Blocking crash-recovery scan of the data directory.
fn load_directory<D: AppData>(dir: &Path) -> Result<LoadedDirectory<D>, StorageError> {
    let hard_state = meta::load(dir)?;

    // Snapshots: orphan metadata is cleaned up by the listing; the newest
    // valid snapshot wins.
    let snap_infos = snapshot::list(dir)?;
    let snapshot = match snap_infos.last() {
        Some(info) => Some(snapshot::load(dir, info)?),
        None => None,
    };
    let snapshot_last_index = snapshot.as_ref().map(|s| s.last_index).unwrap_or(0);

    // Collect segment files.
    let mut closed: Vec<(u64, u64, String)> = Vec::new();
    let mut open: Vec<(u64, String)> = Vec::new();
    for dirent in fs::read_dir(dir).map_err(StorageError::io)? {
        let dirent = dirent.map_err(StorageError::io)?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp") {
            tracing::warn!(file = %name, "removing stray temporary file");
            let _ = fs::remove_file(dir.join(&name));
            continue;
        }
        match segment::parse_filename(&name) {
            Some(segment::SegmentName::Closed { first, last }) => closed.push((first, last, name)),
            Some(segment::SegmentName::Open { counter }) => open.push((counter, name)),
            None => {}
        }
    }
    closed.sort_by_key(|(first, _, _)| *first);
    open.sort_by_key(|(counter, _)| *counter);
    let next_counter = open.iter().map(|(c, _)| c + 1).max().unwrap_or(1);

    // Load and validate closed segments: a gapless cover.
    let mut log: BTreeMap<u64, Entry<D>> = BTreeMap::new();
    let mut closed_segments = Vec::with_capacity(closed.len());
    let mut expect_next: Option<u64> = None;
    for (first, last, filename) in closed {
        if let Some(expected) = expect_next {
            if first != expected {
                return Err(StorageError::corrupt(anyhow::anyhow!(
                    "gap in closed segments: expected first index {expected}, found {first}"
                )));
            }
        } else if snapshot_last_index > 0 && first > snapshot_last_index + 1 {
            return Err(StorageError::corrupt(anyhow::anyhow!(
                "closed segments start at {first}, after the snapshot boundary {snapshot_last_index}"
            )));
        } else if snapshot_last_index == 0 && first != 1 {
            return Err(StorageError::corrupt(anyhow::anyhow!(
                "closed segments start at {first} with no snapshot"
            )));
        }
        let wires = segment::load_closed(&dir.join(&filename), first, last)?;
        for (offset, wire) in wires.into_iter().enumerate() {
            let index = first + offset as u64;
            log.insert(index, wire_to_entry(index, wire)?);
        }
        closed_segments.push(ClosedSegment { first, last, filename });
        expect_next = Some(last + 1);
    }

    // Open segments: repair torn tails, finalize those holding entries,
    // remove the rest.
    let mut last_index = expect_next.map(|n| n - 1).unwrap_or(snapshot_last_index);
    for (_counter, filename) in open {
        let path = dir.join(&filename);
        let (wires, good) = segment::load_open(&path)?;
        if wires.is_empty() {
            tracing::debug!(file = %filename, "removing unused open segment");
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(StorageError::io(e));
                }
            }
            continue;
        }
        let first = last_index + 1;
        let last = last_index + wires.len() as u64;
        for (offset, wire) in wires.into_iter().enumerate() {
            let index = first + offset as u64;
            log.insert(index, wire_to_entry(index, wire)?);
        }

        // Truncate off the torn tail and seal the segment.
        let file = fs::OpenOptions::new().write(true).open(&path).map_err(StorageError::io)?;
        file.set_len(good).map_err(StorageError::io)?;
        file.sync_all().map_err(StorageError::io)?;
        let sealed = segment::closed_filename(first, last);
        fs::rename(&path, dir.join(&sealed)).map_err(StorageError::io)?;
        closed_segments.push(ClosedSegment {
            first,
            last,
            filename: sealed,
        });
        last_index = last;
    }

    meta::sync_dir(dir)?;

    Ok(LoadedDirectory {
        hard_state,
        snapshot,
        log,
        closed_segments,
        next_counter,
    })
}

/// Serialize an entry for the segment codec.
fn entry_to_wire<D: AppData>(entry: &Entry<D>) -> Result<WireEntry, StorageError> {
    let (etype, payload) = match &entry.payload {
        EntryPayload::Command(data) => (
            codec::ENTRY_COMMAND,
            serde_json::to_vec(data).map_err(|e| StorageError::io(anyhow::anyhow!("encode command: {e}")))?,
        ),
        EntryPayload::Barrier => (codec::ENTRY_BARRIER, Vec::new()),
        EntryPayload::Configuration(cfg) => (codec::ENTRY_CONFIGURATION, codec::encode_configuration(cfg)),
    };
    Ok(WireEntry {
        term: entry.term,
        etype,
        payload,
    })
}

/// Rebuild an entry from its stored form.
fn wire_to_entry<D: AppData>(index: u64, wire: WireEntry) -> Result<Entry<D>, StorageError> {
    let payload = match wire.etype {
        codec::ENTRY_COMMAND => EntryPayload::Command(
            serde_json::from_slice(&wire.payload)
                .map_err(|e| StorageError::corrupt(anyhow::anyhow!("decode command at {index}: {e}")))?,
        ),
        codec::ENTRY_BARRIER => EntryPayload::Barrier,
        codec::ENTRY_CONFIGURATION => EntryPayload::Configuration(codec::decode_configuration(&wire.payload)?),
        other => {
            return Err(StorageError::corrupt(anyhow::anyhow!(
                "unknown entry type {other} at index {index}"
            )));
        }
    };
    Ok(Entry {
        term: wire.term,
        index,
        payload,
    })
}
