//! Storage failure policy: an I/O error is fatal for the replica.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use diskraft::async_trait::async_trait;
use diskraft::error::ClientWriteError;
use diskraft::error::RaftError;
use diskraft::raft::AppendEntriesRequest;
use diskraft::raft::AppendEntriesResponse;
use diskraft::raft::InstallSnapshotRequest;
use diskraft::raft::TimeoutNowRequest;
use diskraft::raft::VoteRequest;
use diskraft::raft::VoteResponse;
use diskraft::testing::FaultStore;
use diskraft::testing::MemStore;
use diskraft::testing::RaftRouter;
use diskraft::testing::TestRequest;
use diskraft::testing::TestResponse;
use diskraft::NodeId;
use diskraft::Raft;
use diskraft::RaftNetwork;
use diskraft::State;

/// A network for single-node tests: every send fails as unreachable.
struct DownNetwork;

#[async_trait]
impl RaftNetwork<TestRequest> for DownNetwork {
    async fn append_entries(&self, _: NodeId, _: AppendEntriesRequest<TestRequest>) -> Result<AppendEntriesResponse> {
        bail!("no connection")
    }

    async fn install_snapshot(&self, _: NodeId, _: InstallSnapshotRequest) -> Result<AppendEntriesResponse> {
        bail!("no connection")
    }

    async fn vote(&self, _: NodeId, _: VoteRequest) -> Result<VoteResponse> {
        bail!("no connection")
    }

    async fn timeout_now(&self, _: NodeId, _: TimeoutNowRequest) -> Result<()> {
        bail!("no connection")
    }
}

type FaultyRaft = Raft<TestRequest, TestResponse, DownNetwork, FaultStore<MemStore>>;

/// A failed log append surfaces to the client and stops the replica: it
/// transitions to an errored state and ceases participation.
#[tokio::test(flavor = "multi_thread")]
async fn append_failure_is_fatal() -> Result<()> {
    fixtures::setup_logger();
    let store = Arc::new(FaultStore::new(Arc::new(MemStore::new())));
    let raft: FaultyRaft = Raft::new(1, fixtures::default_config(), Arc::new(DownNetwork), store.clone());

    raft.initialize(RaftRouter::voter_configuration(&[1])).await?;
    raft.wait(Some(Duration::from_secs(5))).state(State::Leader, "single node self-elects").await?;
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;

    store.fail_appends(true);
    let err = raft.client_write(TestRequest::new("boom")).await.unwrap_err();
    assert!(matches!(err, ClientWriteError::RaftError(RaftError::Storage(_))));

    // Once a replica has hit a storage error it stops participating.
    raft.wait(Some(Duration::from_secs(5))).state(State::Shutdown, "errored replica stops").await?;
    let err = raft.client_write(TestRequest::new("after")).await.unwrap_err();
    assert!(matches!(
        err,
        ClientWriteError::RaftError(RaftError::ShuttingDown) | ClientWriteError::ForwardToLeader(_)
    ));

    Ok(())
}
