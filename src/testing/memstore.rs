//! An in-memory storage system for demo and testing purposes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::membership::Configuration;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::storage::HardState;
use crate::storage::InitialState;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::testing::TestRequest;
use crate::testing::TestResponse;

#[derive(Default)]
struct MemStoreInner {
    closed: bool,
    hard_state: HardState,
    log: BTreeMap<u64, Entry<TestRequest>>,
    /// The state machine: every applied `(index, command)`.
    sm: Vec<(u64, String)>,
    applied: u64,
    snapshot: Option<Snapshot>,
    /// Configuration persisted by `bootstrap`.
    bootstrap: Option<Configuration>,
}

/// An in-memory [`RaftStorage`] implementation.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(index, command)` pair applied to the state machine.
    pub async fn applied_entries(&self) -> Vec<(u64, String)> {
        self.inner.read().await.sm.clone()
    }

    pub async fn hard_state(&self) -> HardState {
        self.inner.read().await.hard_state.clone()
    }

    pub async fn first_log_index(&self) -> Option<u64> {
        self.inner.read().await.log.keys().next().copied()
    }

    fn active_configuration(inner: &MemStoreInner) -> (u64, Configuration) {
        let from_log = inner.log.iter().rev().find_map(|(index, entry)| match &entry.payload {
            EntryPayload::Configuration(cfg) => Some((*index, cfg.clone())),
            _ => None,
        });
        if let Some(found) = from_log {
            return found;
        }
        if let Some(snapshot) = &inner.snapshot {
            return (snapshot.configuration_index, snapshot.configuration.clone());
        }
        (0, inner.bootstrap.clone().unwrap_or_default())
    }
}

#[async_trait]
impl RaftStorage<TestRequest, TestResponse> for MemStore {
    async fn get_initial_state(&self) -> Result<InitialState, StorageError> {
        let inner = self.inner.read().await;
        let (last_log_index, last_log_term) = match inner.log.values().next_back() {
            Some(entry) => (entry.index, entry.term),
            None => inner.snapshot.as_ref().map(|s| (s.last_index, s.last_term)).unwrap_or((0, 0)),
        };
        let (configuration_index, configuration) = Self::active_configuration(&inner);
        Ok(InitialState {
            last_log_index,
            last_log_term,
            last_applied: inner.applied,
            hard_state: inner.hard_state.clone(),
            configuration,
            configuration_index,
            snapshot_last: inner.snapshot.as_ref().filter(|s| s.last_index > 0).map(|s| (s.last_term, s.last_index)),
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.hard_state = hs.clone();
        Ok(())
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<TestRequest>>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.log.range(start..stop).map(|(_, e)| e.clone()).collect())
    }

    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<TestRequest>>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.log.get(&index).cloned())
    }

    async fn append_to_log(&self, entries: &[Entry<TestRequest>]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(StorageError::shutdown());
        }
        for entry in entries {
            inner.log.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    async fn truncate_log(&self, from: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let _ = inner.log.split_off(&from);
        Ok(())
    }

    async fn apply_entry_to_state_machine(&self, index: u64, data: &TestRequest) -> Result<TestResponse, StorageError> {
        let mut inner = self.inner.write().await;
        inner.sm.push((index, data.data.clone()));
        inner.applied = index;
        Ok(TestResponse { index })
    }

    async fn replicate_to_state_machine(&self, entries: &[(u64, &TestRequest)]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for (index, data) in entries {
            inner.sm.push((*index, data.data.clone()));
            inner.applied = *index;
        }
        Ok(())
    }

    async fn build_snapshot(&self, trailing: u64) -> Result<Snapshot, StorageError> {
        let mut inner = self.inner.write().await;
        let last_index = inner.applied;
        let last_term = inner
            .log
            .get(&last_index)
            .map(|e| e.term)
            .or_else(|| inner.snapshot.as_ref().filter(|s| s.last_index == last_index).map(|s| s.last_term))
            .unwrap_or(0);
        let (configuration_index, configuration) = Self::active_configuration(&inner);
        let data =
            serde_json::to_vec(&inner.sm).map_err(|e| StorageError::io(anyhow::anyhow!("encode snapshot: {e}")))?;
        let snapshot = Snapshot {
            last_index,
            last_term,
            configuration_index,
            configuration,
            data,
        };

        let retain_first = last_index.saturating_sub(trailing) + 1;
        inner.log = inner.log.split_off(&retain_first);
        inner.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn install_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.sm = serde_json::from_slice(&snapshot.data)
            .map_err(|e| StorageError::corrupt(anyhow::anyhow!("decode snapshot: {e}")))?;
        inner.log.clear();
        inner.applied = snapshot.last_index;
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.snapshot.as_ref().filter(|s| s.last_index > 0).cloned())
    }

    async fn bootstrap(&self, configuration: &Configuration) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.log.is_empty() || inner.hard_state.current_term != 0 {
            return Err(StorageError::io(anyhow::anyhow!("cannot bootstrap a non-pristine store")));
        }
        inner.bootstrap = Some(configuration.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        Ok(())
    }
}
