use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::log::PrevCheck;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also
    /// used as heartbeat (§5.2).
    #[tracing::instrument(
        level = "trace", skip(self, msg),
        fields(term = msg.term, leader_id = msg.leader_id, prev_log_index = msg.prev_log_index, leader_commit = msg.leader_commit),
    )]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // A message from a stale term is not honored.
        if msg.term < self.current_term {
            tracing::trace!(rpc_term = msg.term, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: msg.prev_log_index.max(1),
                last_log_index: self.log.last_index(),
            });
        }

        // This is a valid leader for our (possibly new) term.
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

        // Consistency check on (prev_log_index, prev_log_term).
        match self.log.check_prev(msg.prev_log_index, msg.prev_log_term) {
            PrevCheck::Match => {}
            PrevCheck::Missing => {
                self.report_metrics();
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    rejected: msg.prev_log_index,
                    last_log_index: self.log.last_index(),
                });
            }
            PrevCheck::Conflict => {
                // Our entry at prev conflicts with the leader's; drop it and
                // everything above, then ask the leader to back off.
                self.truncate_log(msg.prev_log_index).await?;
                self.report_metrics();
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    rejected: msg.prev_log_index,
                    last_log_index: self.log.last_index(),
                });
            }
        }

        if !msg.entries.is_empty() {
            self.append_log_entries(msg.entries).await?;
        }

        // Only entries the local log actually holds can be committed here.
        let new_commit = msg.leader_commit.min(self.log.last_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed_entries().await?;
        }

        self.report_metrics();
        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: self.log.last_index(),
        })
    }

    /// Reconcile and append a payload of entries from the leader.
    ///
    /// Entries already present with matching terms are skipped; a term
    /// mismatch truncates the local suffix before the new entries are
    /// appended (§5.3).
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: Vec<Entry<D>>) -> RaftResult<()> {
        let snapshot_last = self.log.snapshot_last().index;
        let mut to_append: Vec<Entry<D>> = Vec::with_capacity(entries.len());

        for entry in entries {
            // Entries covered by the snapshot are committed and identical.
            if entry.index <= snapshot_last {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.term_of(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_log(entry.index).await?;
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        if to_append.is_empty() {
            return Ok(());
        }

        let first_new = to_append[0].index;
        debug_assert_eq!(first_new, self.log.last_index() + 1);

        for entry in &to_append {
            self.log.append(entry.clone());
        }
        if let Err(err) = self.storage.append_to_log(&to_append).await {
            // The in-memory append is rolled back on the same tick.
            self.log.discard(first_new);
            return Err(self.map_fatal_storage_error(err));
        }

        // A configuration entry takes effect as soon as it is written.
        let last_cfg = to_append.iter().rev().find_map(|e| match &e.payload {
            EntryPayload::Configuration(cfg) => Some((cfg.clone(), e.index)),
            _ => None,
        });
        if let Some((cfg, index)) = last_cfg {
            tracing::debug!(index, "applying configuration received from leader");
            self.activate_membership(&cfg, index);
        }

        Ok(())
    }

    /// Truncate the log from `index` (inclusive), both in memory and on
    /// disk, reverting an uncommitted configuration if it was dropped.
    pub(super) async fn truncate_log(&mut self, index: u64) -> RaftResult<()> {
        debug_assert!(index > self.commit_index, "committed entries are never truncated");
        self.storage.truncate_log(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.log.truncate(index);
        self.membership.truncated(index);
        Ok(())
    }
}
