//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for the Raft network between cluster
/// members.
///
/// The transport may be lossy and reordering; the protocol reconciles via
/// `prev_log_index`/`prev_log_term`. A send failure is non-fatal: the caller
/// logs it and retries on the next replication or heartbeat tick.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a TimeoutNow RPC to the target Raft node, as part of a
    /// leadership transfer.
    async fn timeout_now(&self, target: NodeId, rpc: TimeoutNowRequest) -> Result<()>;
}
