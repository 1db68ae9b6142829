//! Error types exposed by this crate.

use std::fmt;

use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the storage layer.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// An error which has come from the network layer.
    #[error("{0}")]
    Network(anyhow::Error),

    /// An internal error indicating that Raft is shutting down.
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// The class of a storage failure.
///
/// `Io` is fatal for the replica: it transitions to an errored state, fails
/// pending client operations, and ceases participation until restarted.
/// `Malformed` and `Corrupt` abort startup. `Canceled` and `Shutdown` are the
/// benign results of closing the store while requests were in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// A durable storage failure.
    Io,
    /// An unsupported on-disk format.
    Malformed,
    /// A checksum mismatch or implausible length.
    Corrupt,
    /// The request was dropped by shutdown.
    Canceled,
    /// The operation was submitted after close.
    Shutdown,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageErrorKind::Io => "io error",
            StorageErrorKind::Malformed => "malformed",
            StorageErrorKind::Corrupt => "corrupt",
            StorageErrorKind::Canceled => "canceled",
            StorageErrorKind::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An error from the durable storage layer.
#[derive(Debug, thiserror::Error)]
#[error("storage {kind}: {source}")]
pub struct StorageError {
    kind: StorageErrorKind,
    source: anyhow::Error,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn io(source: impl Into<anyhow::Error>) -> Self {
        Self::new(StorageErrorKind::Io, source)
    }

    pub fn malformed(source: impl Into<anyhow::Error>) -> Self {
        Self::new(StorageErrorKind::Malformed, source)
    }

    pub fn corrupt(source: impl Into<anyhow::Error>) -> Self {
        Self::new(StorageErrorKind::Corrupt, source)
    }

    pub fn canceled() -> Self {
        Self::new(StorageErrorKind::Canceled, anyhow::anyhow!("request canceled by close"))
    }

    pub fn shutdown() -> Self {
        Self::new(StorageErrorKind::Shutdown, anyhow::anyhow!("store is closed"))
    }

    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::io(e)
    }
}

/// An error related to a `client_write` or `barrier` request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientWriteError {
    /// An internal error.
    #[error("{0}")]
    RaftError(#[from] RaftError),

    /// The request must be forwarded to the cluster leader, if known.
    ///
    /// Returned on non-leaders and on a leader which is transferring its
    /// leadership away.
    #[error("this node is not the raft leader")]
    ForwardToLeader(Option<NodeId>),
}

/// An error related to a membership change request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChangeMembershipError {
    /// An internal error.
    #[error("{0}")]
    RaftError(#[from] RaftError),

    /// The node the request was sent to is not the leader.
    #[error("this node is not the raft leader")]
    NotLeader(Option<NodeId>),

    /// The given server ID is unknown, zero, or refers to this node where
    /// that is not allowed.
    #[error("bad server id: {0}")]
    BadId(NodeId),

    /// The target role is invalid or the server already has it.
    #[error("bad role for server {0}")]
    BadRole(NodeId),

    /// Another membership change is in flight or not yet committed.
    #[error("a configuration change is already in progress")]
    ConfigurationBusy,

    /// No server with the given ID exists in the configuration.
    #[error("no server has id {0}")]
    NotFound(NodeId),
}

/// An error related to a leadership transfer request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransferError {
    /// An internal error.
    #[error("{0}")]
    RaftError(#[from] RaftError),

    /// The node the request was sent to is not the leader, or a transfer is
    /// already in progress.
    #[error("this node is not the raft leader")]
    NotLeader(Option<NodeId>),

    /// The target is this node itself or is not a voter.
    #[error("bad transfer target: {0}")]
    BadId(NodeId),

    /// No suitable voter could be found.
    #[error("there is no other voting server")]
    NotFound,
}

/// The set of errors which may take place when initializing a pristine node.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error.
    #[error("{0}")]
    RaftError(#[from] RaftError),

    /// The node already has log entries or a non-zero term.
    #[error("the node is already initialized")]
    NotAllowed,

    /// The given configuration is invalid (duplicate or zero IDs, or it does
    /// not contain this node).
    #[error("invalid bootstrap configuration")]
    InvalidConfiguration,
}

/// Error variants related to configuration validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Election timeout min must be strictly less than max.
    #[error("election timeout min must be less than max")]
    InvalidElectionTimeoutMinMax,

    /// Heartbeat interval must be positive and at most half the minimum
    /// election timeout.
    #[error("heartbeat interval must be positive and at most election_timeout_min / 2")]
    InvalidHeartbeatInterval,

    /// max_payload_entries must be greater than zero.
    #[error("max_payload_entries must be greater than zero")]
    MaxPayloadEntriesTooSmall,

    /// snapshot_trailing must be greater than zero.
    #[error("snapshot_trailing must be greater than zero")]
    SnapshotTrailingTooSmall,
}
