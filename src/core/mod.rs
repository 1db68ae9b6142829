//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
pub(crate) use crate::core::client::Responder;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::StorageError;
use crate::log::RaftLog;
use crate::membership::Configuration;
use crate::membership::ServerRole;
use crate::metrics::RaftMetrics;
use crate::progress::CatchUpRound;
use crate::raft::RaftMsg;
use crate::raft::RaftRespTx;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationEvent;
use crate::replication::ReplicationStream;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The active and committed membership configurations.
///
/// A configuration takes effect as soon as its entry is written to the log,
/// even before it commits. If the entry is later truncated away, the replica
/// reverts to the last committed configuration.
pub(crate) struct MembershipState {
    pub committed: Configuration,
    pub committed_index: u64,
    pub active: Configuration,
    pub active_index: u64,
}

impl MembershipState {
    fn new(configuration: Configuration, index: u64) -> Self {
        Self {
            committed: configuration.clone(),
            committed_index: index,
            active: configuration,
            active_index: index,
        }
    }

    /// Is a configuration change in flight (written but not committed)?
    pub(crate) fn is_busy(&self) -> bool {
        self.active_index > self.committed_index
    }

    /// A configuration entry was written at `index`.
    pub(crate) fn activate(&mut self, configuration: Configuration, index: u64) {
        self.active = configuration;
        self.active_index = index;
    }

    /// The log has been committed through `index`.
    pub(crate) fn commit_through(&mut self, index: u64) {
        if self.active_index <= index && self.active_index > self.committed_index {
            self.committed = self.active.clone();
            self.committed_index = self.active_index;
        }
    }

    /// The log was truncated from `index`; revert an uncommitted
    /// configuration if it was dropped.
    pub(crate) fn truncated(&mut self, from: u64) {
        if self.active_index >= from {
            self.active = self.committed.clone();
            self.active_index = self.committed_index;
        }
    }

    /// A snapshot pinned the configuration at `index`.
    pub(crate) fn restore(&mut self, configuration: Configuration, index: u64) {
        self.committed = configuration.clone();
        self.committed_index = index;
        self.active = configuration;
        self.active_index = index;
    }
}

/// The core type implementing the Raft protocol.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's membership configuration.
    membership: MembershipState,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,

    /// The target state of the system.
    target_state: State,

    /// The replica's in-memory copy of the log.
    log: RaftLog<D>,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Initialized to 0 at startup; a restarted node re-learns the commit
    /// index from its leader, or re-establishes it upon becoming leader.
    commit_index: u64,
    /// The index of the highest log entry applied to the state machine.
    last_applied: u64,
    /// The current term. Never decreases once durably written.
    current_term: u64,
    /// The ID of the current cluster leader, if known.
    current_leader: Option<NodeId>,
    /// The candidate voted for in `current_term`, if any.
    voted_for: Option<NodeId>,

    /// The index covered by the latest local snapshot.
    snapshot_index: u64,
    /// True while a snapshot build task is running.
    building_snapshot: bool,
    /// Set when a TimeoutNow was received: the next election campaigns with
    /// `disrupt_leader` set.
    disrupt_leader: bool,

    /// The last time a heartbeat was received from a live leader.
    last_heartbeat: Option<Instant>,
    /// The deadline of the next election timeout.
    next_election_timeout: Option<Instant>,

    tx_snapshot: mpsc::Sender<SnapshotUpdate>,
    rx_snapshot: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_snapshot, rx_snapshot) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            membership: MembershipState::new(Configuration::new(), 0),
            network,
            storage,
            target_state: State::NonVoter,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            snapshot_index: 0,
            building_snapshot: false,
            disrupt_leader: false,
            last_heartbeat: None,
            next_election_timeout: None,
            tx_snapshot,
            rx_snapshot,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");
        let state = match self.storage.get_initial_state().await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = %err, "failed to load initial state");
                let _ = self.storage.close().await;
                return Err(RaftError::Storage(err));
            }
        };
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.last_applied = state.last_applied;
        self.membership = MembershipState::new(state.configuration.clone(), state.configuration_index);

        if let Some((term, index)) = state.snapshot_last {
            self.snapshot_index = index;
            self.log.snapshot_restored(index, term);
        }

        // Rebuild the in-memory log from storage.
        if state.last_log_index > self.log.last_index() {
            let entries = self
                .storage
                .get_log_entries(self.log.last_index() + 1, state.last_log_index + 1)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            for entry in entries {
                // The active configuration is the one at the highest
                // configuration entry written, even if uncommitted.
                if let crate::raft::EntryPayload::Configuration(cfg) = &entry.payload {
                    self.membership.activate(cfg.clone(), entry.index);
                }
                self.log.append(entry);
            }
        }

        self.commit_index = 0;

        // Set the initial role from the recovered membership.
        if self.membership.active.is_voter(self.id) {
            self.set_target_state(State::Follower);
        } else {
            self.set_target_state(State::NonVoter);
        }
        self.report_metrics();

        loop {
            match self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    let _ = self.storage.close().await;
                    self.report_metrics();
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    fn report_metrics(&mut self) {
        let _ = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            last_applied: self.last_applied,
            commit_index: self.commit_index,
            snapshot_index: self.snapshot_index,
            current_leader: self.current_leader,
            configuration: self.membership.active.clone(),
        });
    }

    /// Save the Raft node's current hard state to disk.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = crate::storage::HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the core's target state, ensuring invariants are upheld.
    fn set_target_state(&mut self, target_state: State) {
        if target_state == State::Follower && !self.membership.active.is_voter(self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if unset.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a new value for the next election timeout.
    ///
    /// If `heartbeat == true`, also record that a live leader was heard from.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    /// Observe a higher term: `currentTerm <- term`, vote cleared.
    ///
    /// The universal rule: this is applied before any message-specific logic
    /// in every receive path carrying a term.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage error.
    fn map_fatal_storage_error(&mut self, err: StorageError) -> RaftError {
        tracing::error!(error = %err, id = self.id, "fatal storage error, shutting down");
        self.target_state = State::Shutdown;
        RaftError::Storage(err)
    }

    /// A configuration entry was written to the log (leader or follower):
    /// it takes effect immediately.
    fn activate_membership(&mut self, cfg: &Configuration, index: u64) {
        self.membership.activate(cfg.clone(), index);
        // A node which is no longer a voter stops campaigning; one which
        // became a voter starts.
        match self.target_state {
            State::Follower | State::NonVoter => {
                if self.membership.active.is_voter(self.id) {
                    self.set_target_state(State::Follower);
                } else {
                    self.set_target_state(State::NonVoter);
                }
            }
            _ => {}
        }
    }

    /// Apply committed entries to the state machine, follower-side.
    ///
    /// The FSM observes entries in strictly increasing index order, at most
    /// once per index. Configuration entries update the committed
    /// configuration; barriers are skipped.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn apply_committed_entries(&mut self) -> RaftResult<()> {
        let upto = self.commit_index.min(self.log.last_index());
        if upto <= self.last_applied {
            return Ok(());
        }
        let start = self.last_applied + 1;

        let mut commands: Vec<(u64, D)> = Vec::new();
        for index in start..=upto {
            let entry = match self.log.get(index) {
                Some(e) => e,
                None => break,
            };
            match &entry.payload {
                crate::raft::EntryPayload::Command(data) => commands.push((index, data.clone())),
                crate::raft::EntryPayload::Barrier => {}
                crate::raft::EntryPayload::Configuration(_) => {
                    self.membership.commit_through(index);
                }
            }
        }

        if !commands.is_empty() {
            let refs: Vec<(u64, &D)> = commands.iter().map(|(i, d)| (*i, d)).collect();
            self.storage
                .replicate_to_state_machine(&refs)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
        }
        self.last_applied = upto;
        self.report_metrics();
        self.trigger_snapshot_if_needed();
        Ok(())
    }

    /// Start a snapshot build task if the policy calls for one.
    #[tracing::instrument(level = "trace", skip(self))]
    fn trigger_snapshot_if_needed(&mut self) {
        if self.building_snapshot {
            return;
        }
        let threshold = match &self.config.snapshot_policy {
            SnapshotPolicy::LogsSinceLast(threshold) => *threshold,
            SnapshotPolicy::Never => return,
        };
        if self.last_applied < self.snapshot_index {
            return;
        }
        if self.last_applied - self.snapshot_index < threshold {
            return;
        }

        self.building_snapshot = true;
        let storage = self.storage.clone();
        let trailing = self.config.snapshot_trailing;
        let tx = self.tx_snapshot.clone();
        tokio::spawn(
            async move {
                match storage.build_snapshot(trailing).await {
                    Ok(snapshot) => {
                        let _ = tx.try_send(SnapshotUpdate::Complete {
                            last_index: snapshot.last_index,
                            last_term: snapshot.last_term,
                        });
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "error while building snapshot");
                        let _ = tx.try_send(SnapshotUpdate::Failed);
                    }
                }
            }
            .instrument(tracing::debug_span!("snapshot-build")),
        );
    }

    /// Handle the completion of a snapshot build task.
    fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        self.building_snapshot = false;
        if let SnapshotUpdate::Complete { last_index, last_term } = update {
            self.snapshot_index = last_index;
            self.log.compacted(last_index, last_term, self.config.snapshot_trailing);
            self.report_metrics();
        }
    }

    /// Reject an initialize request: the node is not pristine.
    fn reject_init_with_config(&self, tx: RaftRespTx<(), crate::error::InitializeError>) {
        let _ = tx.send(Err(crate::error::InitializeError::NotAllowed));
    }

    /// Fail a membership change request: this node is not the leader.
    fn reject_config_change_not_leader(
        &self,
        tx: RaftRespTx<crate::raft::ChangeMembershipResponse, crate::error::ChangeMembershipError>,
    ) {
        let _ = tx.send(Err(crate::error::ChangeMembershipError::NotLeader(self.current_leader)));
    }

    /// Fail a transfer request: this node is not the leader.
    fn reject_transfer_not_leader(&self, tx: RaftRespTx<(), crate::error::TransferError>) {
        let _ = tx.send(Err(crate::error::TransferError::NotLeader(self.current_leader)));
    }

    /// Forward a client write request to the leader.
    fn forward_client_write_request(&self, tx: RaftRespTx<crate::raft::ClientWriteResponse<R>, ClientWriteError>) {
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
    }

    /// Forward a barrier request to the leader.
    fn forward_barrier_request(&self, tx: RaftRespTx<crate::raft::BarrierResponse, ClientWriteError>) {
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// An update on a snapshot build task.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    Complete { last_index: u64, last_term: u64 },
    Failed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node replicates entries if asked, but neither votes nor times out.
    /// Standbys, spares, and servers outside the configuration live here.
    NonVoter,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// A pending promotion to voter, driven by catch-up rounds.
pub(self) struct Promotion {
    pub target: NodeId,
    pub round: CatchUpRound,
    pub tx: RaftRespTx<crate::raft::ChangeMembershipResponse, crate::error::ChangeMembershipError>,
}

/// A pending leadership transfer.
pub(self) struct Transfer {
    pub target: NodeId,
    pub tx: Option<RaftRespTx<(), crate::error::TransferError>>,
    pub started: Instant,
}

/// Volatile state specific to the Raft leader.
pub(self) struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// Replication streams to every replicated peer (voters and standbys,
    /// plus spares undergoing promotion).
    pub(super) nodes: BTreeMap<NodeId, ReplicationState<D>>,
    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    /// The clonable sender for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,
    /// Client and admin requests awaiting commit, keyed by log index.
    pub(super) awaiting_committed: BTreeMap<u64, Responder<R>>,
    /// An in-flight promotion to voter, if any.
    pub(super) promotion: Option<Promotion>,
    /// An in-flight leadership transfer, if any.
    pub(super) transfer: Option<Transfer>,
}

/// A struct tracking the state of a replication stream from the perspective
/// of the Raft core.
pub(self) struct ReplicationState<D: AppData> {
    pub matched: u64,
    /// Has the target responded since the last quorum-contact check?
    pub recent_recv: bool,
    pub stream: ReplicationStream<D>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            replication_rx,
            replication_tx,
            awaiting_committed: BTreeMap::new(),
            promotion: None,
            transfer: None,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams to every replicated peer.
        let targets: Vec<NodeId> = self
            .core
            .membership
            .active
            .servers
            .iter()
            .filter(|s| s.id != self.core.id && s.role != ServerRole::Spare)
            .map(|s| s.id)
            .collect();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.disrupt_leader = false;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        // Per §8, commit an initial entry as part of becoming leader: a
        // barrier in the new term, which commits residual entries of prior
        // terms.
        self.commit_initial_leader_entry().await?;

        let quorum_interval = Duration::from_millis(self.core.config.election_timeout_max);
        let mut quorum_check = tokio::time::interval_at(Instant::now() + quorum_interval, quorum_interval);

        loop {
            if !self.core.target_state.is_leader() {
                for node in self.nodes.values() {
                    let _ = node.stream.repl_tx.send(ReplicationEvent::Terminate);
                }
                self.fail_pending_requests();
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries { rpc, tx } => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote { rpc, tx } => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot { rpc, tx } => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::TimeoutNow { rpc, tx } => {
                        let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                    }
                    RaftMsg::ClientWriteRequest { command, tx } => {
                        self.handle_client_write_request(command, tx).await;
                    }
                    RaftMsg::Barrier { tx } => {
                        self.handle_barrier_request(tx).await;
                    }
                    RaftMsg::Initialize { tx, .. } => {
                        self.core.reject_init_with_config(tx);
                    }
                    RaftMsg::AddServer { id, address, tx } => {
                        self.handle_add_server(id, address, tx).await;
                    }
                    RaftMsg::AssignRole { id, role, tx } => {
                        self.handle_assign_role(id, role, tx).await;
                    }
                    RaftMsg::RemoveServer { id, tx } => {
                        self.handle_remove_server(id, tx).await;
                    }
                    RaftMsg::TransferLeadership { target, tx } => {
                        self.handle_transfer_leadership(target, tx).await;
                    }
                },
                Some(event) = self.replication_rx.recv() => {
                    self.handle_replica_event(event).await?;
                }
                Some(update) = self.core.rx_snapshot.recv() => {
                    self.core.update_snapshot_state(update);
                }
                _ = quorum_check.tick() => {
                    self.check_quorum_contact();
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Fail requests still awaiting commit: leadership was lost.
    fn fail_pending_requests(&mut self) {
        let leader = self.core.current_leader;
        for (_, responder) in std::mem::take(&mut self.awaiting_committed) {
            responder.not_leader(leader);
        }
        if let Some(promotion) = self.promotion.take() {
            let _ = promotion.tx.send(Err(crate::error::ChangeMembershipError::NotLeader(leader)));
        }
        if let Some(transfer) = self.transfer.take() {
            if let Some(tx) = transfer.tx {
                let _ = tx.send(Err(crate::error::TransferError::NotLeader(leader)));
            }
        }
    }

    /// Step down if a quorum of voters has not been heard from within the
    /// last election timeout.
    #[tracing::instrument(level = "trace", skip(self))]
    fn check_quorum_contact(&mut self) {
        let mut contacted = 1; // self
        for server in self.core.membership.active.voters() {
            if server.id == self.core.id {
                continue;
            }
            if self.nodes.get(&server.id).map(|n| n.recent_recv).unwrap_or(false) {
                contacted += 1;
            }
        }
        for node in self.nodes.values_mut() {
            node.recent_recv = false;
        }

        if contacted < self.core.membership.active.quorum() {
            tracing::warn!(contacted, "lost contact with a quorum of voters, stepping down");
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }

        // An expired leadership transfer is abandoned.
        let timeout = Duration::from_millis(self.core.config.election_timeout_max);
        let expired = self.transfer.as_ref().map(|t| t.started.elapsed() > timeout).unwrap_or(false);
        if expired {
            if let Some(transfer) = self.transfer.take() {
                if let Some(tx) = transfer.tx {
                    let _ = tx.send(Err(crate::error::TransferError::NotLeader(Some(self.core.id))));
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
pub(self) struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// Votes granted by voters, including ourselves.
    votes_granted: u64,
    /// Votes needed to win: a majority of the voter set.
    votes_needed: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop. Each iteration of the outer loop is a new term.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                self.core.disrupt_leader = false;
                return Ok(());
            }

            self.votes_granted = 1; // We vote for ourselves.
            self.votes_needed = self.core.membership.active.quorum() as u64;

            // Setup new term.
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();
            tracing::debug!(term = self.core.current_term, "campaigning");

            // Send RequestVote RPCs to all voters in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            loop {
                if !self.core.target_state.is_candidate() {
                    self.core.disrupt_leader = false;
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                tokio::select! {
                    // This election timed out; start a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => {
                        self.handle_vote_response(res, peer).await?;
                    }
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow { rpc, tx } => {
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest { tx, .. } => {
                            self.core.forward_client_write_request(tx);
                        }
                        RaftMsg::Barrier { tx } => {
                            self.core.forward_barrier_request(tx);
                        }
                        RaftMsg::Initialize { tx, .. } => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddServer { tx, .. } => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::AssignRole { tx, .. } => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::RemoveServer { tx, .. } => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::TransferLeadership { tx, .. } => {
                            self.core.reject_transfer_not_leader(tx);
                        }
                    },
                    Some(update) = self.core.rx_snapshot.recv() => {
                        self.core.update_snapshot_state(update);
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub(self) struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            // Updated as heartbeats are received.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());
            tokio::select! {
                // No contact from a live leader: campaign.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries { rpc, tx } => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote { rpc, tx } => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot { rpc, tx } => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::TimeoutNow { rpc, tx } => {
                        let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                    }
                    RaftMsg::ClientWriteRequest { tx, .. } => {
                        self.core.forward_client_write_request(tx);
                    }
                    RaftMsg::Barrier { tx } => {
                        self.core.forward_barrier_request(tx);
                    }
                    RaftMsg::Initialize { tx, .. } => {
                        self.core.reject_init_with_config(tx);
                    }
                    RaftMsg::AddServer { tx, .. } => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::AssignRole { tx, .. } => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::RemoveServer { tx, .. } => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::TransferLeadership { tx, .. } => {
                        self.core.reject_transfer_not_leader(tx);
                    }
                },
                Some(update) = self.core.rx_snapshot.recv() => {
                    self.core.update_snapshot_state(update);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in non-voter state.
pub(self) struct NonVoterState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> NonVoterState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the non-voter loop: completely passive, replicating if asked.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "non-voter"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries { rpc, tx } => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote { rpc, tx } => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot { rpc, tx } => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::TimeoutNow { rpc, tx } => {
                        let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                    }
                    RaftMsg::ClientWriteRequest { tx, .. } => {
                        self.core.forward_client_write_request(tx);
                    }
                    RaftMsg::Barrier { tx } => {
                        self.core.forward_barrier_request(tx);
                    }
                    RaftMsg::Initialize { configuration, tx } => {
                        let _ = tx.send(self.handle_init_with_config(configuration).await);
                    }
                    RaftMsg::AddServer { tx, .. } => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::AssignRole { tx, .. } => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::RemoveServer { tx, .. } => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::TransferLeadership { tx, .. } => {
                        self.core.reject_transfer_not_leader(tx);
                    }
                },
                Some(update) = self.core.rx_snapshot.recv() => {
                    self.core.update_snapshot_state(update);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}
