use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "trace", skip(self, msg), fields(candidate = msg.candidate_id, term = msg.term))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // Stale term: do not honor the request.
        if msg.term < self.current_term {
            tracing::trace!("RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Leader stickiness: a node which is itself a healthy leader, or has
        // heard from one within the minimum election timeout, ignores vote
        // requests, so a partitioned or removed node rejoining with an
        // inflated term cannot disrupt a stable cluster. A leadership
        // transfer sets `disrupt_leader` to bypass this.
        if !msg.disrupt_leader {
            if self.target_state.is_leader() {
                tracing::trace!("rejecting vote request: this node is an established leader");
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
            if let Some(inst) = &self.last_heartbeat {
                let delta = Instant::now().duration_since(*inst);
                if (delta.as_millis() as u64) <= self.config.election_timeout_min {
                    tracing::trace!("rejecting vote request received within election timeout of a leader heartbeat");
                    return Ok(VoteResponse {
                        term: self.current_term,
                        vote_granted: false,
                    });
                }
            }
        }

        // Observing a higher term forces follower state and clears the vote.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Grant only if the candidate's log is at least as up-to-date as
        // ours: higher last term wins, equal terms compare last index.
        let candidate_up_to_date = (msg.last_log_term, msg.last_log_index) >= (self.log.last_term(), self.log.last_index());
        if !candidate_up_to_date {
            tracing::trace!("rejecting vote request as candidate's log is not up-to-date");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        match &self.voted_for {
            // Already voted for this candidate in this term.
            Some(id) if id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // At most one vote per term.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.set_target_state(State::Follower);
                self.update_next_election_timeout(false);
                // The vote must be durable before it is granted.
                self.save_hard_state().await?;
                tracing::trace!(candidate = msg.candidate_id, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }

    /// An RPC invoked by a transferring leader: start an election
    /// immediately, regardless of the timer.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    pub(super) async fn handle_timeout_now_request(&mut self, msg: TimeoutNowRequest) -> RaftResult<()> {
        if msg.term != self.current_term {
            tracing::trace!("ignoring TimeoutNow from a different term");
            return Ok(());
        }
        if !self.membership.active.is_voter(self.id) {
            return Ok(());
        }
        // Only campaign if our log is as complete as the transferring
        // leader's, else the election would be wasted.
        if self.log.last_index() != msg.last_log_index || self.log.last_term() != msg.last_log_term {
            tracing::debug!("ignoring TimeoutNow: log is not caught up with the leader");
            return Ok(());
        }

        tracing::info!("received TimeoutNow, starting election");
        self.disrupt_leader = true;
        self.set_target_state(State::Candidate);
        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Handle a response from a vote request sent to a peer.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // A higher term means this election is lost; revert to follower.
        if res.term > self.core.current_term {
            tracing::debug!(peer_term = res.term, "reverting to follower due to greater term in vote response");
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            return Ok(());
        }

        if res.vote_granted && self.core.membership.active.is_voter(target) {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::debug!("received a majority of votes, transitioning to leader");
                self.core.set_target_state(State::Leader);
            }
        }
        Ok(())
    }

    /// Spawn parallel vote requests to all other voters.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let voters: Vec<NodeId> = self
            .core
            .membership
            .active
            .voters()
            .map(|s| s.id)
            .filter(|id| id != &self.core.id)
            .collect();
        let (tx, rx) = mpsc::channel(voters.len().max(1));
        for member in voters {
            let rpc = VoteRequest {
                term: self.core.current_term,
                candidate_id: self.core.id,
                last_log_index: self.core.log.last_index(),
                last_log_term: self.core.log.last_term(),
                disrupt_leader: self.core.disrupt_leader,
            };
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, peer = member, "error requesting vote from peer");
                        }
                    }
                }
                .instrument(tracing::trace_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }
}
