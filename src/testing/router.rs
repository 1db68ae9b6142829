//! An in-process cluster fixture: routes RPCs between `Raft` instances by
//! node id, with per-node isolation for partition tests.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::membership::Configuration;
use crate::membership::ServerRole;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::testing::MemStore;
use crate::testing::TestRequest;
use crate::testing::TestResponse;
use crate::NodeId;
use crate::Raft;
use crate::State;

/// The concrete `Raft` type used by the test suite.
pub type MemRaft = Raft<TestRequest, TestResponse, RouterNetwork, MemStore>;

/// An in-process router acting as the cluster's network.
pub struct RaftRouter {
    config: Arc<Config>,
    nodes: RwLock<BTreeMap<NodeId, (MemRaft, Arc<MemStore>)>>,
    isolated: RwLock<BTreeSet<NodeId>>,
}

/// A per-node handle to the router; RPCs from an isolated node fail just as
/// RPCs towards it do.
pub struct RouterNetwork {
    router: Arc<RaftRouter>,
    owner: NodeId,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(BTreeSet::new()),
        })
    }

    /// Create and spawn a new Raft node backed by a fresh `MemStore`.
    pub fn new_raft_node(self: &Arc<Self>, id: NodeId) -> MemRaft {
        let store = Arc::new(MemStore::new());
        self.new_raft_node_with_store(id, store)
    }

    pub fn new_raft_node_with_store(self: &Arc<Self>, id: NodeId, store: Arc<MemStore>) -> MemRaft {
        let network = Arc::new(RouterNetwork {
            router: self.clone(),
            owner: id,
        });
        let raft = Raft::new(id, self.config.clone(), network, store.clone());
        self.nodes.write().unwrap().insert(id, (raft.clone(), store));
        raft
    }

    pub fn get_raft_handle(&self, id: NodeId) -> Option<MemRaft> {
        self.nodes.read().unwrap().get(&id).map(|(raft, _)| raft.clone())
    }

    pub fn get_store(&self, id: NodeId) -> Option<Arc<MemStore>> {
        self.nodes.read().unwrap().get(&id).map(|(_, store)| store.clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().unwrap().keys().copied().collect()
    }

    /// Cut a node off from the network in both directions.
    pub fn isolate_node(&self, id: NodeId) {
        self.isolated.write().unwrap().insert(id);
    }

    /// Restore a previously isolated node.
    pub fn restore_node(&self, id: NodeId) {
        self.isolated.write().unwrap().remove(&id);
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        let isolated = self.isolated.read().unwrap();
        !isolated.contains(&from) && !isolated.contains(&to)
    }

    fn target(&self, from: NodeId, to: NodeId) -> Result<MemRaft> {
        if !self.reachable(from, to) {
            return Err(anyhow!("no connection between {from} and {to}"));
        }
        self.get_raft_handle(to).ok_or_else(|| anyhow!("no node {to} in the router"))
    }

    /// A voter configuration over the given node ids.
    pub fn voter_configuration(ids: &[NodeId]) -> Configuration {
        let mut configuration = Configuration::new();
        for id in ids {
            configuration.add(*id, format!("node-{id}"), ServerRole::Voter).unwrap();
        }
        configuration
    }

    /// Spawn the given nodes and initialize them all with a voter
    /// configuration, the way every member of a new cluster is bootstrapped
    /// with the same seed config.
    pub async fn new_cluster(self: &Arc<Self>, ids: &[NodeId]) -> Result<()> {
        self.new_cluster_with(Self::voter_configuration(ids)).await
    }

    /// Spawn one node per server in `configuration` and bootstrap them all
    /// with it.
    pub async fn new_cluster_with(self: &Arc<Self>, configuration: Configuration) -> Result<()> {
        for server in &configuration.servers {
            self.new_raft_node(server.id);
        }
        for server in &configuration.servers {
            let raft = self.get_raft_handle(server.id).expect("node just created");
            raft.initialize(configuration.clone()).await?;
        }
        Ok(())
    }

    /// Wait for some node to become leader, and return its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for (id, (raft, _)) in self.nodes.read().unwrap().iter() {
                if raft.metrics().borrow().state == State::Leader {
                    return Ok(*id);
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no leader elected within {timeout:?}"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Shut down every node.
    pub async fn shutdown_all(&self) {
        let rafts: Vec<MemRaft> = self.nodes.read().unwrap().values().map(|(raft, _)| raft.clone()).collect();
        for raft in rafts {
            let _ = raft.shutdown().await;
        }
    }
}

#[async_trait]
impl RaftNetwork<TestRequest> for RouterNetwork {
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<TestRequest>) -> Result<AppendEntriesResponse> {
        let raft = self.router.target(self.owner, target)?;
        Ok(raft.append_entries(rpc).await?)
    }

    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse> {
        let raft = self.router.target(self.owner, target)?;
        Ok(raft.install_snapshot(rpc).await?)
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let raft = self.router.target(self.owner, target)?;
        Ok(raft.vote(rpc).await?)
    }

    async fn timeout_now(&self, target: NodeId, rpc: TimeoutNowRequest) -> Result<()> {
        let raft = self.router.target(self.owner, target)?;
        Ok(raft.timeout_now(rpc).await?)
    }
}
