use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to install a snapshot on a lagging
    /// follower (§7).
    ///
    /// The receiver acknowledges with an AppendEntries result: on success its
    /// `last_log_index` echoes the snapshot boundary so the leader can
    /// advance its progress for this node.
    #[tracing::instrument(
        level = "trace", skip(self, msg),
        fields(term = msg.term, leader_id = msg.leader_id, last_index = msg.last_index),
    )]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        msg: InstallSnapshotRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        if msg.term < self.current_term {
            tracing::trace!("InstallSnapshot RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: msg.last_index,
                last_log_index: self.log.last_index(),
            });
        }

        self.update_next_election_timeout(true);
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
        }
        if self.current_leader != Some(msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
        }
        if self.target_state.is_candidate() || self.target_state.is_leader() {
            self.set_target_state(State::Follower);
        }

        // A snapshot which does not advance us is acknowledged and ignored.
        if msg.last_index <= self.last_applied {
            tracing::debug!(
                last_applied = self.last_applied,
                "snapshot does not advance local state, ignoring"
            );
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: 0,
                last_log_index: msg.last_index,
            });
        }

        let snapshot = Snapshot {
            last_index: msg.last_index,
            last_term: msg.last_term,
            configuration_index: msg.configuration_index,
            configuration: msg.configuration,
            data: msg.data,
        };

        // Persist the snapshot, restore the state machine, and truncate the
        // log through the snapshot boundary. The store's write barrier keeps
        // other disk writes out while this happens.
        self.storage
            .install_snapshot(&snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.log.snapshot_restored(snapshot.last_index, snapshot.last_term);
        self.snapshot_index = snapshot.last_index;
        self.last_applied = snapshot.last_index;
        if snapshot.last_index > self.commit_index {
            self.commit_index = snapshot.last_index;
        }
        self.membership.restore(snapshot.configuration, snapshot.configuration_index);
        if self.target_state.is_follower() || self.target_state.is_non_voter() {
            // Role may have changed with the restored configuration.
            if self.membership.active.is_voter(self.id) {
                self.set_target_state(State::Follower);
            } else {
                self.set_target_state(State::NonVoter);
            }
        }

        self.report_metrics();
        tracing::info!(last_index = snapshot.last_index, "snapshot installed");

        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: snapshot.last_index,
        })
    }
}
