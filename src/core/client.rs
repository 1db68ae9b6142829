use std::sync::Arc;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::RaftResult;
use crate::raft::BarrierResponse;
use crate::raft::ChangeMembershipResponse;
use crate::raft::ClientWriteResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::RaftRespTx;
use crate::replication::ReplicationEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The response channel for a request awaiting commit, keyed by log index in
/// the leader's pending table.
pub(crate) enum Responder<R: AppDataResponse> {
    /// A client command; answered with the state machine's response.
    Client(RaftRespTx<ClientWriteResponse<R>, ClientWriteError>),
    /// A barrier; answered when the apply loop passes it.
    Barrier(RaftRespTx<BarrierResponse, ClientWriteError>),
    /// A membership change; answered when the configuration entry commits.
    Change(RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>),
    /// An internal entry (the leader's step-up barrier).
    None,
}

impl<R: AppDataResponse> Responder<R> {
    /// Fail the request: this node lost (or never had) leadership.
    pub(crate) fn not_leader(self, leader: Option<NodeId>) {
        match self {
            Responder::Client(tx) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(leader)));
            }
            Responder::Barrier(tx) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(leader)));
            }
            Responder::Change(tx) => {
                let _ = tx.send(Err(ChangeMembershipError::NotLeader(leader)));
            }
            Responder::None => {}
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create
    /// when first coming to power, per §8: a barrier in the new term, which
    /// drags residual entries of prior terms over the commit line.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let entry = match self.append_payload_to_log(EntryPayload::Barrier).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(error = %err, "failed to append the leader barrier");
                return Err(err);
            }
        };
        self.awaiting_committed.insert(entry.index, Responder::None);
        self.replicate_entry(entry).await;
        self.core.report_metrics();
        Ok(())
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, command, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        command: D,
        tx: RaftRespTx<ClientWriteResponse<R>, ClientWriteError>,
    ) {
        // A leader which is handing leadership away no longer accepts writes.
        if self.transfer.is_some() {
            let _ = tx.send(Err(ClientWriteError::ForwardToLeader(Some(self.core.id))));
            return;
        }
        let entry = match self.append_payload_to_log(EntryPayload::Command(command)).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.awaiting_committed.insert(entry.index, Responder::Client(tx));
        self.replicate_entry(entry).await;
    }

    /// Handle a barrier request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_barrier_request(&mut self, tx: RaftRespTx<BarrierResponse, ClientWriteError>) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ClientWriteError::ForwardToLeader(Some(self.core.id))));
            return;
        }
        let entry = match self.append_payload_to_log(EntryPayload::Barrier).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.awaiting_committed.insert(entry.index, Responder::Barrier(tx));
        self.replicate_entry(entry).await;
    }

    /// Transform the given payload into an entry, assign it the next index
    /// and the current term, and append it to the in-memory log and to disk.
    ///
    /// The disk write starts on the same tick as the in-memory append; if it
    /// fails the in-memory append is rolled back before returning.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            term: self.core.current_term,
            index: self.core.log.last_index() + 1,
            payload,
        };
        self.core.log.append(entry.clone());
        if let Err(err) = self.core.storage.append_to_log(&[entry.clone()]).await {
            self.core.log.discard(entry.index);
            return Err(self.core.map_fatal_storage_error(err));
        }
        Ok(entry)
    }

    /// Begin replicating the given entry to all replication streams.
    ///
    /// This does not wait for the entry to commit; commitment is observed
    /// asynchronously via replication progress events.
    #[tracing::instrument(level = "trace", skip(self, entry), fields(index = entry.index))]
    pub(super) async fn replicate_entry(&mut self, entry: Entry<D>) {
        let entry = Arc::new(entry);
        for node in self.nodes.values() {
            let _ = node.stream.repl_tx.send(ReplicationEvent::Replicate {
                entry: entry.clone(),
                commit_index: self.core.commit_index,
            });
        }
        // A single-voter cluster commits immediately.
        self.update_commit_index().await;
    }

    /// Recompute the commit index from replication progress and, if it
    /// advanced, apply newly committed entries and answer waiting clients.
    ///
    /// Only entries of the current term commit by counting (§5.4.2): the
    /// leader's step-up barrier carries prior-term entries over the line.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn update_commit_index(&mut self) {
        let mut matches: Vec<u64> = Vec::new();
        for server in self.core.membership.active.voters() {
            if server.id == self.core.id {
                matches.push(self.core.log.last_index());
            } else {
                matches.push(self.nodes.get(&server.id).map(|n| n.matched).unwrap_or(0));
            }
        }
        if matches.is_empty() {
            return;
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.core.membership.active.quorum();
        let candidate = matches[quorum - 1];

        if candidate <= self.core.commit_index {
            return;
        }
        if self.core.log.term_of(candidate) != Some(self.core.current_term) {
            return;
        }

        self.core.commit_index = candidate;
        tracing::trace!(commit_index = candidate, "commit index advanced");

        for node in self.nodes.values() {
            let _ = node.stream.repl_tx.send(ReplicationEvent::UpdateCommitIndex {
                commit_index: self.core.commit_index,
            });
        }

        if let Err(err) = self.leader_apply_committed().await {
            tracing::error!(error = %err, "error applying committed entries");
        }
        self.core.report_metrics();
    }

    /// Apply committed entries, leader-side: route state machine responses
    /// and membership commits back to waiting clients.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn leader_apply_committed(&mut self) -> RaftResult<()> {
        let upto = self.core.commit_index.min(self.core.log.last_index());
        while self.core.last_applied < upto {
            let index = self.core.last_applied + 1;
            let payload = match self.core.log.get(index) {
                Some(e) => e.payload.clone(),
                None => break,
            };
            match payload {
                EntryPayload::Command(data) => {
                    let res = self
                        .core
                        .storage
                        .apply_entry_to_state_machine(index, &data)
                        .await
                        .map_err(|err| self.core.map_fatal_storage_error(err))?;
                    if let Some(Responder::Client(tx)) = self.awaiting_committed.remove(&index) {
                        let _ = tx.send(Ok(ClientWriteResponse { index, data: res }));
                    }
                }
                EntryPayload::Barrier => {
                    if let Some(Responder::Barrier(tx)) = self.awaiting_committed.remove(&index) {
                        let _ = tx.send(Ok(BarrierResponse { index }));
                    }
                }
                EntryPayload::Configuration(cfg) => {
                    self.core.membership.commit_through(index);
                    self.handle_configuration_committed(&cfg);
                    if let Some(Responder::Change(tx)) = self.awaiting_committed.remove(&index) {
                        let _ = tx.send(Ok(ChangeMembershipResponse {
                            index,
                            configuration: cfg,
                        }));
                    }
                }
            }
            self.core.last_applied = index;
        }

        // Drop any other responders whose entries were superseded.
        let stale: Vec<u64> = self
            .awaiting_committed
            .range(..=self.core.last_applied)
            .map(|(i, _)| *i)
            .collect();
        for index in stale {
            if let Some(responder) = self.awaiting_committed.remove(&index) {
                responder.not_leader(Some(self.core.id));
            }
        }

        self.core.report_metrics();
        self.core.trigger_snapshot_if_needed();
        Ok(())
    }

    /// Post-commit housekeeping for a configuration entry.
    fn handle_configuration_committed(&mut self, cfg: &crate::membership::Configuration) {
        // Remove replication streams to servers which are gone or demoted to
        // spare, once they have had the chance to receive this entry.
        let to_remove: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, _)| {
                let server = cfg.get(**id);
                server.map(|s| s.role == crate::membership::ServerRole::Spare).unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect();
        for target in to_remove {
            // Keep the stream of an in-flight promotion alive.
            if self.promotion.as_ref().map(|p| p.target == target).unwrap_or(false) {
                continue;
            }
            if let Some(node) = self.nodes.remove(&target) {
                tracing::debug!(target, "removing replication stream");
                let _ = node.stream.repl_tx.send(ReplicationEvent::Terminate);
            }
        }
        // A leader which is no longer a voter steps down.
        if !cfg.is_voter(self.core.id) {
            tracing::info!("leader is no longer a voter in the committed configuration, stepping down");
            self.core.update_current_leader(super::UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::NonVoter);
        }
    }
}
