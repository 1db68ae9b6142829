//! Replication stream: one task per replicated peer.
//!
//! The stream owns the per-follower [`Progress`] state machine. In `Probe`
//! it sends a single batch per heartbeat until the match point is located;
//! in `Pipeline` it streams batches back-to-back; in `Snapshot` it installs
//! the latest local snapshot and drops back to `Probe`.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;

use crate::config::Config;
use crate::progress::Progress;
use crate::progress::ProgressState;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<ReplicationEvent<D>>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Spawn a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log_index: u64,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat = Duration::from_millis(config.heartbeat_interval);
        let this = ReplicationCore {
            id,
            target,
            term,
            config,
            network,
            storage,
            marker_r: std::marker::PhantomData,
            progress: Progress::new(last_log_index),
            last_log_index,
            commit_index,
            core_tx,
            repl_rx,
            heartbeat: interval(heartbeat),
            closed: false,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("replication", target)));
        Self { repl_tx }
    }
}

/// An event from the Raft core to a replication stream.
pub(crate) enum ReplicationEvent<D: AppData> {
    /// A new entry needs to be replicated.
    Replicate {
        /// The most recent entry appended to the leader's log; its index is
        /// the new `last_log_index`.
        entry: Arc<Entry<D>>,
        /// The index of the highest committed entry.
        commit_index: u64,
    },
    /// The commit index moved.
    UpdateCommitIndex { commit_index: u64 },
    /// Shut the stream down.
    Terminate,
}

/// An event coming from a replication stream to the Raft core.
#[derive(Debug)]
pub(crate) enum ReplicaEvent {
    /// The target responded; `matched` is the highest index known replicated.
    ///
    /// Also sent on rejections with an unchanged `matched`, as proof of
    /// contact for the leader's quorum check.
    Progress { target: NodeId, matched: u64 },
    /// The target answered with a higher term; the leader must step down.
    RevertToFollower { target: NodeId, term: u64 },
    /// A fatal storage error was hit inside the stream.
    Shutdown,
}

/// A task replicating the leader's log to a single target follower.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target follower.
    target: NodeId,
    /// The leader's term; constant for the lifetime of this task.
    term: u64,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,
    marker_r: std::marker::PhantomData<R>,

    /// Per-follower progress: next/match indices and probe/pipeline/snapshot.
    progress: Progress,
    /// The index of the most recent entry appended on the leader.
    last_log_index: u64,
    /// The leader's commit index.
    commit_index: u64,

    core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    repl_rx: mpsc::UnboundedReceiver<ReplicationEvent<D>>,
    heartbeat: Interval,
    closed: bool,
}

/// Outcome of a single RPC exchange with the target.
#[derive(PartialEq)]
enum SendOutcome {
    /// Response received and processed.
    Responded,
    /// Transport failure or timeout; retry on the next tick.
    NoContact,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, target = self.target))]
    async fn main(mut self) {
        // Immediate initial heartbeat, which doubles as the first probe.
        self.send_append_entries().await;

        loop {
            if self.closed {
                tracing::debug!("replication stream closed");
                return;
            }
            match self.progress.state {
                ProgressState::Snapshot => self.replicate_snapshot().await,
                ProgressState::Probe | ProgressState::Pipeline => self.line_rate_loop().await,
            }
        }
    }

    /// Replicate entries (or heartbeats) until closed or a snapshot is needed.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn line_rate_loop(&mut self) {
        loop {
            if self.closed || self.progress.state == ProgressState::Snapshot {
                return;
            }

            // In pipeline state with a backlog, stream batches back-to-back.
            if self.progress.state == ProgressState::Pipeline && self.progress.next_index <= self.last_log_index {
                let outcome = self.send_append_entries().await;
                if outcome == SendOutcome::Responded {
                    continue;
                }
                // Transport trouble: drop to the paced path below.
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.send_append_entries().await;
                }
                event = self.repl_rx.recv() => match event {
                    Some(event) => self.drain_events(event),
                    None => {
                        self.closed = true;
                    }
                }
            }
        }
    }

    /// Send one AppendEntries RPC: a batch from `next_index`, or an empty
    /// heartbeat when the target is caught up.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) -> SendOutcome {
        let next = self.progress.next_index;
        let prev_log_index = next - 1;

        let prev_log_term = match self.term_of(prev_log_index).await {
            Ok(Some(term)) => term,
            Ok(None) => {
                // The entry before `next` is compacted: only a snapshot can
                // bring this follower forward.
                tracing::debug!(prev_log_index, "needed entries are compacted, switching to snapshot");
                self.progress.begin_snapshot();
                return SendOutcome::Responded;
            }
            Err(()) => return SendOutcome::NoContact,
        };

        let entries = if next <= self.last_log_index {
            let stop = (next + self.config.max_payload_entries).min(self.last_log_index + 1);
            let entries = match self.storage.get_log_entries(next, stop).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error = %err, "failed to load log entries for replication");
                    let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                    self.closed = true;
                    return SendOutcome::Responded;
                }
            };
            if entries.first().map(|e| e.index) != Some(next) {
                self.progress.begin_snapshot();
                return SendOutcome::Responded;
            }
            entries
        } else {
            Vec::new()
        };

        let last_sent = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        let ttl = Duration::from_millis(self.config.heartbeat_interval);
        let res = match timeout(ttl, self.network.append_entries(self.target, rpc)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "error sending AppendEntries to target");
                return SendOutcome::NoContact;
            }
            Err(_) => {
                tracing::debug!("timeout sending AppendEntries to target");
                return SendOutcome::NoContact;
            }
        };

        if res.term > self.term {
            let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.closed = true;
            return SendOutcome::Responded;
        }

        if res.is_success() {
            self.progress.update_success(last_sent);
        } else {
            self.progress.update_rejected(res.rejected, res.last_log_index);
        }
        let _ = self.core_tx.send(ReplicaEvent::Progress {
            target: self.target,
            matched: self.progress.match_index,
        });
        SendOutcome::Responded
    }

    /// The term of the given index on the leader, `Ok(None)` if compacted.
    async fn term_of(&mut self, index: u64) -> Result<Option<u64>, ()> {
        if index == 0 {
            return Ok(Some(0));
        }
        match self.storage.try_get_log_entry(index).await {
            Ok(Some(entry)) => Ok(Some(entry.term)),
            Ok(None) => match self.storage.get_current_snapshot().await {
                Ok(Some(snapshot)) if snapshot.last_index == index => Ok(Some(snapshot.last_term)),
                Ok(_) => Ok(None),
                Err(err) => {
                    tracing::error!(error = %err, "failed to read snapshot for replication");
                    let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                    self.closed = true;
                    Err(())
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to read log entry for replication");
                let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                self.closed = true;
                Err(())
            }
        }
    }

    /// Install the latest local snapshot on the target.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshot"))]
    async fn replicate_snapshot(&mut self) {
        let snapshot = match self.storage.get_current_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                // The compaction that made the snapshot necessary has not
                // finished; wait a tick and retry.
                tracing::debug!("no snapshot available yet, waiting");
                self.wait_for_tick().await;
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load snapshot for replication");
                let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                self.closed = true;
                return;
            }
        };

        let last_index = snapshot.last_index;
        let rpc = InstallSnapshotRequest {
            term: self.term,
            leader_id: self.id,
            last_index,
            last_term: snapshot.last_term,
            configuration_index: snapshot.configuration_index,
            configuration: snapshot.configuration,
            data: snapshot.data,
        };

        tracing::info!(target = self.target, last_index, "sending snapshot to target");
        let ttl = Duration::from_millis(self.config.install_snapshot_timeout);
        let res = match timeout(ttl, self.network.install_snapshot(self.target, rpc)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "error sending InstallSnapshot to target");
                self.wait_for_tick().await;
                return;
            }
            Err(_) => {
                tracing::warn!("timeout sending InstallSnapshot to target");
                self.wait_for_tick().await;
                return;
            }
        };

        if res.term > self.term {
            let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.closed = true;
            return;
        }

        if res.is_success() {
            self.progress.snapshot_installed(last_index);
            let _ = self.core_tx.send(ReplicaEvent::Progress {
                target: self.target,
                matched: self.progress.match_index,
            });
        } else {
            self.wait_for_tick().await;
        }
    }

    /// Park until the next heartbeat tick, processing core events meanwhile.
    async fn wait_for_tick(&mut self) {
        tokio::select! {
            _ = self.heartbeat.tick() => {}
            event = self.repl_rx.recv() => match event {
                Some(event) => self.drain_events(event),
                None => {
                    self.closed = true;
                }
            }
        }
    }

    /// Fully drain the channel coming in from the Raft core.
    fn drain_events(&mut self, first: ReplicationEvent<D>) {
        let mut event_opt = Some(first);
        loop {
            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            match event {
                ReplicationEvent::Replicate { entry, commit_index } => {
                    self.last_log_index = entry.index;
                    self.commit_index = commit_index;
                }
                ReplicationEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                ReplicationEvent::Terminate => {
                    self.closed = true;
                    return;
                }
            }
            if let Some(next) = self.repl_rx.recv().now_or_never() {
                event_opt = next;
            }
        }
    }
}
