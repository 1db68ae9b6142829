use crate::core::LeaderState;
use crate::core::NonVoterState;
use crate::core::Promotion;
use crate::core::Responder;
use crate::core::State;
use crate::core::Transfer;
use crate::error::ChangeMembershipError;
use crate::error::InitializeError;
use crate::error::TransferError;
use crate::membership::Configuration;
use crate::membership::ServerRole;
use crate::progress::CatchUpRound;
use crate::raft::ChangeMembershipResponse;
use crate::raft::EntryPayload;
use crate::raft::RaftRespTx;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> NonVoterState<'a, D, R, N, S> {
    /// Handle the `initialize` command: bootstrap a pristine node with the
    /// given cluster configuration.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(&mut self, configuration: Configuration) -> Result<(), InitializeError> {
        if self.core.log.last_index() != 0 || self.core.current_term != 0 {
            tracing::error!("rejecting initialize request: node already has state");
            return Err(InitializeError::NotAllowed);
        }
        if configuration.validate().is_err() || !configuration.contains(self.core.id) {
            return Err(InitializeError::InvalidConfiguration);
        }

        self.core
            .storage
            .bootstrap(&configuration)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        self.core.membership = super::MembershipState::new(configuration, 0);

        // A single-voter cluster elects itself on the spot; everyone else
        // becomes a follower and lets the randomized election timer stagger
        // the first campaign. Raft guarantees the first node to win
        // propagates only its own config.
        let is_voter = self.core.membership.active.is_voter(self.core.id);
        if is_voter && self.core.membership.active.voter_count() == 1 {
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else if is_voter {
            self.core.set_target_state(State::Follower);
        } else {
            self.core.set_target_state(State::NonVoter);
        }
        self.core.report_metrics();
        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Check whether a membership change may start now.
    ///
    /// At most one change may be in flight: the previous configuration entry
    /// must be committed and no promotion may be running.
    fn can_change_configuration(&self) -> Result<(), ChangeMembershipError> {
        if self.transfer.is_some() {
            return Err(ChangeMembershipError::NotLeader(Some(self.core.id)));
        }
        if self.core.membership.is_busy() || self.promotion.is_some() {
            return Err(ChangeMembershipError::ConfigurationBusy);
        }
        Ok(())
    }

    /// Add a new server to the cluster in the spare role.
    #[tracing::instrument(level = "debug", skip(self, address, tx), fields(target = id))]
    pub(super) async fn handle_add_server(
        &mut self,
        id: NodeId,
        address: String,
        tx: RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>,
    ) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err));
            return;
        }
        let mut configuration = self.core.membership.active.clone();
        if configuration.add(id, address, ServerRole::Spare).is_err() {
            let _ = tx.send(Err(ChangeMembershipError::BadId(id)));
            return;
        }
        self.append_configuration(configuration, Responder::Change(tx)).await;
    }

    /// Change the role of an existing server.
    ///
    /// Promotion to voter goes through catch-up rounds unless the server is
    /// already fully caught up; every other role change commits directly.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target = id, role = ?role))]
    pub(super) async fn handle_assign_role(
        &mut self,
        id: NodeId,
        role: ServerRole,
        tx: RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>,
    ) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err));
            return;
        }
        let server = match self.core.membership.active.get(id) {
            Some(server) => server.clone(),
            None => {
                let _ = tx.send(Err(ChangeMembershipError::NotFound(id)));
                return;
            }
        };
        if server.role == role {
            let _ = tx.send(Err(ChangeMembershipError::BadRole(id)));
            return;
        }

        // Replication to the target may not exist yet (spares get nothing
        // until promotion begins).
        if id != self.core.id && role != ServerRole::Spare && !self.nodes.contains_key(&id) {
            let state = self.spawn_replication_stream(id);
            self.nodes.insert(id, state);
        }

        let matched = self.nodes.get(&id).map(|n| n.matched).unwrap_or(0);
        let up_to_date = id == self.core.id || matched == self.core.log.last_index();

        if role != ServerRole::Voter || up_to_date {
            let mut configuration = self.core.membership.active.clone();
            configuration.get_mut(id).expect("server presence checked above").role = role;
            self.append_configuration(configuration, Responder::Change(tx)).await;
            return;
        }

        // Promotion to voter with a lagging log: start catch-up rounds. The
        // configuration change is submitted once a round completes within
        // the election timeout.
        tracing::info!(target = id, "starting catch-up rounds for promotion to voter");
        self.promotion = Some(Promotion {
            target: id,
            round: CatchUpRound::first(self.core.log.last_index()),
            tx,
        });
    }

    /// Remove a server from the cluster.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target = id))]
    pub(super) async fn handle_remove_server(
        &mut self,
        id: NodeId,
        tx: RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>,
    ) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err));
            return;
        }
        let mut configuration = self.core.membership.active.clone();
        if configuration.remove(id).is_err() {
            let _ = tx.send(Err(ChangeMembershipError::BadId(id)));
            return;
        }
        self.append_configuration(configuration, Responder::Change(tx)).await;
    }

    /// Append a configuration entry: it takes effect immediately, and the
    /// responder is answered when it commits.
    ///
    /// On storage failure the in-memory entry and the previous configuration
    /// are restored before the request is failed.
    #[tracing::instrument(level = "debug", skip(self, configuration, responder))]
    pub(super) async fn append_configuration(&mut self, configuration: Configuration, responder: Responder<R>) {
        let prev_cfg = self.core.membership.active.clone();
        let prev_index = self.core.membership.active_index;

        let entry = match self.append_payload_to_log(EntryPayload::Configuration(configuration.clone())).await {
            Ok(entry) => entry,
            Err(err) => {
                self.core.membership.activate(prev_cfg, prev_index);
                match responder {
                    Responder::Change(tx) => {
                        let _ = tx.send(Err(ChangeMembershipError::RaftError(err)));
                    }
                    other => other.not_leader(Some(self.core.id)),
                }
                return;
            }
        };

        self.core.membership.activate(configuration.clone(), entry.index);

        // Replication streams follow the configuration: spawn for servers
        // now replicated, flag the rest for removal at commit time.
        for server in configuration.servers.iter() {
            if server.id == self.core.id || server.role == ServerRole::Spare {
                continue;
            }
            if !self.nodes.contains_key(&server.id) {
                let state = self.spawn_replication_stream(server.id);
                self.nodes.insert(server.id, state);
            }
        }

        self.awaiting_committed.insert(entry.index, responder);
        self.replicate_entry(entry).await;
        self.core.report_metrics();
    }

    /// Drive the catch-up rounds of an in-flight promotion.
    ///
    /// Each completed round either commits the promotion (the round finished
    /// within the election timeout, so the promotee will keep up as a voter)
    /// or starts a new round against the leader's current last index.
    pub(super) async fn check_promotion(&mut self, target: NodeId, matched: u64) {
        let round_done = self
            .promotion
            .as_ref()
            .map(|p| p.target == target && p.round.is_completed(matched))
            .unwrap_or(false);
        if !round_done {
            return;
        }

        let promotion = self.promotion.take().expect("promotion presence checked above");
        let window = std::time::Duration::from_millis(self.core.config.election_timeout_min);
        if promotion.round.start.elapsed() <= window {
            tracing::info!(
                target,
                rounds = promotion.round.number,
                "catch-up complete, committing promotion to voter"
            );
            let mut configuration = self.core.membership.active.clone();
            match configuration.get_mut(target) {
                Some(server) => server.role = ServerRole::Voter,
                None => {
                    // The server was removed while catching up.
                    let _ = promotion.tx.send(Err(ChangeMembershipError::NotFound(target)));
                    return;
                }
            }
            self.append_configuration(configuration, Responder::Change(promotion.tx)).await;
        } else {
            tracing::debug!(
                target,
                round = promotion.round.number,
                "catch-up round exceeded the election timeout, starting another"
            );
            self.promotion = Some(Promotion {
                target: promotion.target,
                round: promotion.round.next(self.core.log.last_index()),
                tx: promotion.tx,
            });
        }
    }

    /// Transfer leadership to the given voter, or pick the most caught-up one.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_transfer_leadership(
        &mut self,
        target: Option<NodeId>,
        tx: RaftRespTx<(), TransferError>,
    ) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(TransferError::NotLeader(Some(self.core.id))));
            return;
        }

        let target = match target {
            Some(id) => id,
            None => match self.select_transferee() {
                Some(id) => id,
                None => {
                    let _ = tx.send(Err(TransferError::NotFound));
                    return;
                }
            },
        };

        let valid = target != self.core.id && self.core.membership.active.is_voter(target);
        if !valid {
            let _ = tx.send(Err(TransferError::BadId(target)));
            return;
        }

        let matched = self.nodes.get(&target).map(|n| n.matched).unwrap_or(0);
        if matched == self.core.log.last_index() {
            self.transfer = Some(Transfer {
                target,
                tx: None,
                started: tokio::time::Instant::now(),
            });
            self.send_timeout_now(target);
            let _ = tx.send(Ok(()));
        } else {
            // Wait for the target to catch up; the TimeoutNow goes out on
            // the progress event that closes the gap.
            self.transfer = Some(Transfer {
                target,
                tx: Some(tx),
                started: tokio::time::Instant::now(),
            });
        }
    }

    /// Find a suitable voting follower for an automatic transfer: the most
    /// caught-up voter.
    fn select_transferee(&self) -> Option<NodeId> {
        self.core
            .membership
            .active
            .voters()
            .filter(|s| s.id != self.core.id)
            .map(|s| (self.nodes.get(&s.id).map(|n| n.matched).unwrap_or(0), s.id))
            .max()
            .map(|(_, id)| id)
    }
}
