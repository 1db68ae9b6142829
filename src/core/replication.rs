use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::TimeoutNowRequest;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream to the target peer.
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let stream = ReplicationStream::spawn::<R, N, S>(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.log.last_index(),
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: 0,
            recent_recv: false,
            stream,
        }
    }

    /// Handle an event coming from a replication stream.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::Progress { target, matched } => {
                self.handle_progress(target, matched).await;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(target, term, "observed a higher term, reverting to follower");
                    self.core.update_current_term(term, None);
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                    self.core.save_hard_state().await?;
                }
            }
            ReplicaEvent::Shutdown => {
                tracing::error!("replication stream hit a fatal storage error");
                self.core.set_target_state(State::Shutdown);
            }
        }
        Ok(())
    }

    /// A replication stream reported progress (or mere contact).
    async fn handle_progress(&mut self, target: NodeId, matched: u64) {
        {
            let node = match self.nodes.get_mut(&target) {
                Some(node) => node,
                None => return,
            };
            node.recent_recv = true;
            if matched <= node.matched {
                return;
            }
            node.matched = matched;
        }

        self.check_promotion(target, matched).await;
        self.check_transfer_ready(target, matched);
        self.update_commit_index().await;
    }

    /// If a leadership transfer is waiting for the target to catch up, and it
    /// now has, dispatch the TimeoutNow.
    fn check_transfer_ready(&mut self, target: NodeId, matched: u64) {
        let ready = self
            .transfer
            .as_ref()
            .map(|t| t.target == target && matched == self.core.log.last_index())
            .unwrap_or(false);
        if !ready {
            return;
        }
        let mut transfer = self.transfer.take().unwrap();
        let tx = transfer.tx.take();
        self.transfer = Some(transfer);
        self.send_timeout_now(target);
        if let Some(tx) = tx {
            let _ = tx.send(Ok(()));
        }
    }

    /// Dispatch a TimeoutNow message to the transfer target.
    pub(super) fn send_timeout_now(&self, target: NodeId) {
        let rpc = TimeoutNowRequest {
            term: self.core.current_term,
            last_log_index: self.core.log.last_index(),
            last_log_term: self.core.log.last_term(),
        };
        let network = self.core.network.clone();
        tokio::spawn(async move {
            if let Err(err) = network.timeout_now(target, rpc).await {
                tracing::warn!(error = %err, target, "error sending TimeoutNow to transfer target");
            }
        });
    }
}
