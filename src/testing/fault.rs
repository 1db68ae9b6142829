//! A fault-injecting storage wrapper.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::membership::Configuration;
use crate::raft::Entry;
use crate::storage::HardState;
use crate::storage::InitialState;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;

/// Wraps any [`RaftStorage`] and injects I/O failures on demand.
pub struct FaultStore<S> {
    inner: Arc<S>,
    fail_appends: AtomicBool,
    fail_hard_state: AtomicBool,
}

impl<S> FaultStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            fail_hard_state: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `append_to_log` fail with an I/O error.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `save_hard_state` fail with an I/O error.
    pub fn fail_hard_state(&self, fail: bool) {
        self.fail_hard_state.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }
}

#[async_trait]
impl<D, R, S> RaftStorage<D, R> for FaultStore<S>
where
    D: AppData,
    R: AppDataResponse,
    S: RaftStorage<D, R>,
{
    async fn get_initial_state(&self) -> Result<InitialState, StorageError> {
        self.inner.get_initial_state().await
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<(), StorageError> {
        if self.fail_hard_state.load(Ordering::SeqCst) {
            return Err(StorageError::io(anyhow::anyhow!("injected hard-state failure")));
        }
        self.inner.save_hard_state(hs).await
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>, StorageError> {
        self.inner.get_log_entries(start, stop).await
    }

    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<D>>, StorageError> {
        self.inner.try_get_log_entry(index).await
    }

    async fn append_to_log(&self, entries: &[Entry<D>]) -> Result<(), StorageError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::io(anyhow::anyhow!("injected append failure")));
        }
        self.inner.append_to_log(entries).await
    }

    async fn truncate_log(&self, from: u64) -> Result<(), StorageError> {
        self.inner.truncate_log(from).await
    }

    async fn apply_entry_to_state_machine(&self, index: u64, data: &D) -> Result<R, StorageError> {
        self.inner.apply_entry_to_state_machine(index, data).await
    }

    async fn replicate_to_state_machine(&self, entries: &[(u64, &D)]) -> Result<(), StorageError> {
        self.inner.replicate_to_state_machine(entries).await
    }

    async fn build_snapshot(&self, trailing: u64) -> Result<Snapshot, StorageError> {
        self.inner.build_snapshot(trailing).await
    }

    async fn install_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.inner.install_snapshot(snapshot).await
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.inner.get_current_snapshot().await
    }

    async fn bootstrap(&self, configuration: &Configuration) -> Result<(), StorageError> {
        self.inner.bootstrap(configuration).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}
