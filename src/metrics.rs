//! Raft metrics for observability.
//!
//! Metrics are observed via [`crate::Raft::metrics`], which returns a watch
//! channel updated on every externally visible state change. The [`Wait`]
//! helper awaits a condition on the metrics stream with a timeout, which is
//! the backbone of the integration test suite.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::State;
use crate::membership::Configuration;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The index of the highest log entry known to be committed.
    pub commit_index: u64,
    /// The index covered by the latest local snapshot, 0 if none.
    pub snapshot_index: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    /// The active membership configuration.
    pub configuration: Configuration,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::NonVoter,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            snapshot_index: 0,
            current_leader: None,
            configuration: Configuration::new(),
        }
    }
}

/// An error from waiting on a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Waits for a condition on the metrics channel to be satisfied.
pub struct Wait {
    timeout: Duration,
    rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    pub(crate) fn new(timeout: Duration, rx: watch::Receiver<RaftMetrics>) -> Self {
        Self { timeout, rx }
    }

    /// Wait until `predicate` returns true for the observed metrics.
    pub async fn metrics<F>(&self, predicate: F, msg: impl Into<String>) -> Result<RaftMetrics, WaitError>
    where F: Fn(&RaftMetrics) -> bool {
        let msg = msg.into();
        let mut rx = self.rx.clone();
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            {
                let latest = rx.borrow();
                if predicate(&latest) {
                    return Ok(latest.clone());
                }
            }
            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg)),
            }
        }
    }

    /// Wait for the node to reach the given state.
    pub async fn state(&self, want: State, msg: impl Into<String>) -> Result<RaftMetrics, WaitError> {
        let msg = msg.into();
        self.metrics(|m| m.state == want, format!("{} state == {:?}", msg, want)).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, leader: NodeId, msg: impl Into<String>) -> Result<RaftMetrics, WaitError> {
        let msg = msg.into();
        self.metrics(
            |m| m.current_leader == Some(leader),
            format!("{} leader == {}", msg, leader),
        )
        .await
    }

    /// Wait for the log to reach at least the given index.
    pub async fn log_at_least(&self, index: u64, msg: impl Into<String>) -> Result<RaftMetrics, WaitError> {
        let msg = msg.into();
        self.metrics(
            |m| m.last_log_index >= index,
            format!("{} last_log_index >= {}", msg, index),
        )
        .await
    }

    /// Wait for the state machine to have applied at least the given index.
    pub async fn applied_at_least(&self, index: u64, msg: impl Into<String>) -> Result<RaftMetrics, WaitError> {
        let msg = msg.into();
        self.metrics(|m| m.last_applied >= index, format!("{} last_applied >= {}", msg, index)).await
    }

    /// Wait for the current term to reach at least the given value.
    pub async fn term_at_least(&self, term: u64, msg: impl Into<String>) -> Result<RaftMetrics, WaitError> {
        let msg = msg.into();
        self.metrics(
            |m| m.current_term >= term,
            format!("{} current_term >= {}", msg, term),
        )
        .await
    }
}
