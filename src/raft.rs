//! Public Raft interface and data types.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::TransferError;
use crate::membership::Configuration;
use crate::membership::ServerRole;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This is the interface to a running Raft node. Applications spawn the node
/// with [`Raft::new`] and then use this handle to submit client requests,
/// feed in RPCs received from peers, change membership, and observe metrics.
///
/// This type is cheap to clone.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// `id` must be stable across restarts of this node, and should be
    /// persisted alongside the node's data directory.
    #[tracing::instrument(level = "debug", skip(config, network, storage), fields(cluster = %config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These are sent by the cluster leader to replicate log entries (§5.3),
    /// and are also used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(leader = rpc.leader_id, term = rpc.term))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a RequestVote RPC to this Raft node.
    ///
    /// These are sent by cluster peers in candidate state to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These are sent by the cluster leader to bring a new or lagging node
    /// up-to-speed (§7). The receiver acknowledges with an AppendEntries
    /// result whose `last_log_index` echoes the snapshot boundary.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(leader = rpc.leader_id, last_index = rpc.last_index))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Submit a TimeoutNow RPC to this Raft node.
    ///
    /// Sent by a leader which is transferring its leadership to this node;
    /// the receiver starts an election immediately, regardless of its timer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn timeout_now(&self, rpc: TimeoutNowRequest) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::TimeoutNow { rpc, tx }, rx).await
    }

    /// Get the ID of the current leader from this Raft node.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Submit a mutating client request to update the state of the system (§5.1).
    ///
    /// The command is appended to the log, committed to the cluster, and
    /// applied to the state machine; the state machine's response is returned.
    /// On a non-leader this fails with [`ClientWriteError::ForwardToLeader`].
    #[tracing::instrument(level = "debug", skip(self, command))]
    pub async fn client_write(&self, command: D) -> Result<ClientWriteResponse<R>, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientWriteRequest { command, tx }, rx).await
    }

    /// Append a content-less barrier entry and wait for it to be applied.
    ///
    /// A barrier flushes the leader's pipeline: when it resolves, every entry
    /// accepted before the barrier has been committed and applied.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn barrier(&self) -> Result<BarrierResponse, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Barrier { tx }, rx).await
    }

    /// Initialize a pristine Raft node with the given cluster configuration.
    ///
    /// Must be called on nodes with an empty log and a zero term. Every member
    /// of the initial cluster should be bootstrapped with the same
    /// configuration; Raft guarantees the first node to win an election
    /// propagates only its own config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, configuration: Configuration) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Initialize { configuration, tx }, rx).await
    }

    /// Add a new server to the cluster, in the spare role.
    ///
    /// The new server receives no entries until it is assigned the standby or
    /// voter role. Resolves once the configuration entry is committed.
    #[tracing::instrument(level = "debug", skip(self, address), fields(target = id))]
    pub async fn add_server(
        &self,
        id: NodeId,
        address: impl Into<String>,
    ) -> Result<ChangeMembershipResponse, ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        let address = address.into();
        self.call_core(RaftMsg::AddServer { id, address, tx }, rx).await
    }

    /// Change the role of an existing server.
    ///
    /// Promoting a server to voter first drives catch-up rounds: the
    /// promotion is committed only once the server has replicated the
    /// leader's log within one election timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(target = id))]
    pub async fn assign_role(
        &self,
        id: NodeId,
        role: ServerRole,
    ) -> Result<ChangeMembershipResponse, ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AssignRole { id, role, tx }, rx).await
    }

    /// Remove a server from the cluster.
    #[tracing::instrument(level = "debug", skip(self), fields(target = id))]
    pub async fn remove_server(&self, id: NodeId) -> Result<ChangeMembershipResponse, ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RemoveServer { id, tx }, rx).await
    }

    /// Transfer leadership to the given voter, or to the most caught-up voter
    /// if `target` is `None`.
    ///
    /// Resolves once the TimeoutNow message has been dispatched to the
    /// target; the actual election proceeds asynchronously.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn transfer_leadership(&self, target: Option<NodeId>) -> Result<(), TransferError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::TransferLeadership { target, tx }, rx).await
    }

    /// Invoke RaftCore by sending a RaftMsg and waiting for the response.
    pub(crate) async fn call_core<T, E>(&self, msg: RaftMsg<D, R>, rx: RaftRespRx<T, E>) -> Result<T, E>
    where E: From<RaftError> {
        if self.inner.tx_api.send(msg).is_err() {
            return Err(RaftError::ShuttingDown.into());
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RaftError::ShuttingDown.into()),
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<std::time::Duration>) -> Wait {
        Wait::new(
            timeout.unwrap_or_else(|| std::time::Duration::from_millis(500)),
            self.inner.rx_metrics.clone(),
        )
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> RaftResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type RaftRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type RaftRespRx<T, E> = oneshot::Receiver<Result<T, E>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: RaftRespTx<AppendEntriesResponse, RaftError>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: RaftRespTx<VoteResponse, RaftError>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: RaftRespTx<AppendEntriesResponse, RaftError>,
    },
    TimeoutNow {
        rpc: TimeoutNowRequest,
        tx: RaftRespTx<(), RaftError>,
    },
    ClientWriteRequest {
        command: D,
        tx: RaftRespTx<ClientWriteResponse<R>, ClientWriteError>,
    },
    Barrier {
        tx: RaftRespTx<BarrierResponse, ClientWriteError>,
    },
    Initialize {
        configuration: Configuration,
        tx: RaftRespTx<(), InitializeError>,
    },
    AddServer {
        id: NodeId,
        address: String,
        tx: RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>,
    },
    AssignRole {
        id: NodeId,
        role: ServerRole,
        tx: RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>,
    },
    RemoveServer {
        id: NodeId,
        tx: RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>,
    },
    TransferLeadership {
        target: Option<NodeId>,
        tx: RaftRespTx<(), TransferError>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the cluster leader to replicate log entries (§5.3), and as
/// a heartbeat (§5.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The index of the entry immediately preceding the new ones.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The new log entries to store; empty for heartbeats.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

/// The response to an `AppendEntriesRequest` and to an
/// `InstallSnapshotRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// The `prev_log_index` the request was rejected on, `0` if accepted.
    pub rejected: u64,
    /// The responding node's last log index, used by the leader to shortcut
    /// the `next_index` search.
    pub last_log_index: u64,
}

impl AppendEntriesResponse {
    pub fn is_success(&self) -> bool {
        self.rejected == 0
    }
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
    /// True when this election was started on behalf of a leadership
    /// transfer; suppresses the receiver-side recent-leader-contact check.
    pub disrupt_leader: bool,
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by the Raft leader to install a snapshot on a follower (§7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The last log index covered by the snapshot.
    pub last_index: u64,
    /// The term of the entry at `last_index`.
    pub last_term: u64,
    /// The log index at which the embedded configuration was chosen.
    pub configuration_index: u64,
    /// The cluster configuration as of the snapshot.
    pub configuration: Configuration,
    /// The opaque state machine snapshot payload.
    pub data: Vec<u8>,
}

/// An RPC sent by a transferring leader to make the target start an election
/// immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's last log index.
    pub last_log_index: u64,
    /// The leader's last log term.
    pub last_log_term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A Raft log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub term: u64,
    pub index: u64,
    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

/// Log entry payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An application command to be applied to the state machine.
    #[serde(bound = "D: AppData")]
    Command(D),
    /// A content-less entry. New leaders append one to commit residual
    /// entries of prior terms; clients use them to flush the pipeline.
    Barrier,
    /// A cluster configuration change.
    Configuration(Configuration),
}

impl<D: AppData> EntryPayload<D> {
    pub fn is_configuration(&self) -> bool {
        matches!(self, EntryPayload::Configuration(_))
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The response to a committed and applied client command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The log index the command was written at.
    pub index: u64,
    /// The state machine's response from applying the command.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

/// The response to a committed barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierResponse {
    /// The log index of the barrier entry.
    pub index: u64,
}

/// The response to a committed membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMembershipResponse {
    /// The log index of the configuration entry.
    pub index: u64,
    /// The configuration that is now committed.
    pub configuration: Configuration,
}
