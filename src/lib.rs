//! An embeddable Raft consensus library with a built-in durable log.
//!
//! Applications provide two things: a deterministic [`StateMachine`] which
//! applies committed commands, and a [`RaftNetwork`] implementation which
//! carries RPCs between cluster members. In exchange the crate guarantees
//! that committed commands are applied in identical order on every
//! non-faulty replica, across crashes, partitions and membership changes.
//!
//! The crate ships with two [`RaftStorage`] implementations: [`DiskStore`],
//! a production store built on segmented append-only files plus a paired
//! snapshot store, and an in-memory store under [`testing`] for tests.

pub mod config;
mod core;
pub mod error;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod progress;
pub mod raft;
mod raft_types;
mod replication;
pub mod storage;
pub mod store;
pub mod testing;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::State;
pub use crate::error::ChangeMembershipError;
pub use crate::error::ClientWriteError;
pub use crate::error::ConfigError;
pub use crate::error::InitializeError;
pub use crate::error::RaftError;
pub use crate::error::StorageError;
pub use crate::error::StorageErrorKind;
pub use crate::membership::Configuration;
pub use crate::membership::Server;
pub use crate::membership::ServerRole;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::storage::RaftStorage;
pub use crate::storage::StateMachine;
pub use crate::store::DiskStore;
pub use crate::store::DiskStoreOptions;

/// A Raft node's ID.
///
/// IDs are chosen by the application and must be positive; `0` is reserved as
/// the "no server" sentinel on the wire and on disk.
pub type NodeId = u64;

/// A trait defining application specific command data.
///
/// Applications present their command type as-is to Raft; it is serialized
/// only at the storage and transport boundaries, so the state machine works
/// with the concrete type throughout.
pub trait AppData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// Responses are produced by the state machine when a committed command is
/// applied, and are routed back to the `client_write` caller on the leader.
pub trait AppDataResponse: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}
