//! The Raft storage interface and data types.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::StorageError;
use crate::membership::Configuration;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
///
/// This is the only consensus state that must be durable besides the log and
/// snapshots: once written, `current_term` never decreases, and within a term
/// at most one vote is ever recorded.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct HardState {
    /// The last recorded term observed by this node.
    pub current_term: u64,
    /// The ID of the node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
}

impl Default for HardState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
        }
    }
}

/// A complete snapshot: the state machine payload plus the metadata pinning
/// it into the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The last log index covered by the snapshot.
    pub last_index: u64,
    /// The term of the entry at `last_index`.
    pub last_term: u64,
    /// The log index at which `configuration` was chosen.
    pub configuration_index: u64,
    /// The cluster configuration as of the snapshot.
    pub configuration: Configuration,
    /// The opaque state machine payload.
    pub data: Vec<u8>,
}

/// The initial state a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The term of the last log entry.
    pub last_log_term: u64,
    /// The index of the last log applied to the state machine.
    ///
    /// The state machine's volatile state is rebuilt by restoring the latest
    /// snapshot, so this equals the snapshot's last index (0 if none).
    pub last_applied: u64,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The active cluster configuration: the one at the highest
    /// configuration entry found, or the bootstrap configuration.
    pub configuration: Configuration,
    /// The log index of `configuration`, 0 for a bootstrap configuration.
    pub configuration_index: u64,
    /// The `(term, index)` of the latest snapshot, if one exists.
    pub snapshot_last: Option<(u64, u64)>,
}

impl InitialState {
    /// The initial state of a pristine node.
    pub fn new_initial() -> Self {
        Self {
            last_log_index: 0,
            last_log_term: 0,
            last_applied: 0,
            hard_state: HardState::default(),
            configuration: Configuration::new(),
            configuration_index: 0,
            snapshot_last: None,
        }
    }
}

/// The application's deterministic state machine.
///
/// Raft guarantees `apply` is invoked with strictly increasing indices,
/// at most once per index, identically on every replica.
#[async_trait]
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Apply a committed command and produce its response.
    async fn apply(&self, index: u64, data: &D) -> anyhow::Result<R>;

    /// Capture the state machine's current state as an opaque payload.
    async fn snapshot(&self) -> anyhow::Result<Vec<u8>>;

    /// Replace the state machine's state with a previously captured payload.
    async fn restore(&self, last_index: u64, data: &[u8]) -> anyhow::Result<()>;
}

/// A trait defining the interface for a Raft storage system.
///
/// This is the durable half of the replica: hard state, the log, and
/// snapshots. The crate ships [`crate::DiskStore`] as its production
/// implementation and an in-memory one under [`crate::testing`].
///
/// Other than `apply_entry_to_state_machine`, an error returned from any of
/// these methods is treated as fatal: the replica stops participating until
/// restarted.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Get the node's state from stable storage, performing crash recovery
    /// as needed.
    async fn get_initial_state(&self) -> Result<InitialState, StorageError>;

    /// Save the node's hard state. Must be durable before this returns.
    async fn save_hard_state(&self, hs: &HardState) -> Result<(), StorageError>;

    /// Get a series of log entries, `[start, stop)`.
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>, StorageError>;

    /// Get a single log entry, if present.
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<D>>, StorageError>;

    /// Append entries to the log. Entries are contiguous and in order; disk
    /// writes complete in raft-index order.
    async fn append_to_log(&self, entries: &[Entry<D>]) -> Result<(), StorageError>;

    /// Delete `from` and every entry above it.
    ///
    /// Runs under the store's write barrier: outstanding appends drain
    /// before any bytes are removed.
    async fn truncate_log(&self, from: u64) -> Result<(), StorageError>;

    /// Apply a single committed command to the state machine, returning the
    /// application's response.
    async fn apply_entry_to_state_machine(&self, index: u64, data: &D) -> Result<R, StorageError>;

    /// Apply a batch of committed commands, as part of replication.
    async fn replicate_to_state_machine(&self, entries: &[(u64, &D)]) -> Result<(), StorageError>;

    /// Snapshot the state machine, persist the snapshot, and prune the log
    /// keeping `trailing` entries behind the snapshot.
    async fn build_snapshot(&self, trailing: u64) -> Result<Snapshot, StorageError>;

    /// Install a snapshot received from the leader: persist it, restore the
    /// state machine from it, and truncate the log through its last index.
    async fn install_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Get the most recent snapshot, if any.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Persist the bootstrap configuration on a pristine node.
    async fn bootstrap(&self, configuration: &Configuration) -> Result<(), StorageError>;

    /// Close the store. Pending requests are failed with `canceled`; later
    /// operations fail with `shutdown`.
    async fn close(&self) -> Result<(), StorageError>;
}
