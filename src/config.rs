//! Raft runtime configuration.

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default threshold for when to take a snapshot.
pub const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default number of log entries kept past a snapshot.
pub const DEFAULT_SNAPSHOT_TRAILING: u64 = 1024;
/// Default timeout for an InstallSnapshot RPC, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 1000;

/// Log compaction policy.
///
/// This governs when the replica will snapshot its state machine and prune
/// the log behind the snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be taken once the log has grown the specified number
    /// of entries since the last snapshot.
    LogsSinceLast(u64),
    /// Never snapshot automatically.
    Never,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)
    }
}

/// The runtime configuration for a Raft node.
///
/// When tuning these values, remember the inequality from the Raft spec:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. Keep the election timeout high
/// enough that network latency will not cause spurious elections, but low
/// enough that a real leader crash does not cause prolonged downtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    ///
    /// This does not influence the protocol in any way, but is useful for
    /// observability.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The interval in milliseconds at which leaders send heartbeats.
    ///
    /// Must not exceed half of `election_timeout_min`, else a healthy leader
    /// could fail to suppress elections on its followers.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per AppendEntries payload.
    pub max_payload_entries: u64,
    /// The snapshot policy.
    pub snapshot_policy: SnapshotPolicy,
    /// How many log entries to keep behind a snapshot.
    ///
    /// Retaining a tail of already-snapshotted entries lets slightly lagging
    /// followers catch up from the log instead of receiving a full snapshot.
    pub snapshot_trailing: u64,
    /// The timeout in milliseconds for sending an InstallSnapshot RPC.
    pub install_snapshot_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            snapshot_policy: None,
            snapshot_trailing: None,
            install_snapshot_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder which validates the resulting runtime config.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    snapshot_trailing: Option<u64>,
    install_snapshot_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_trailing`.
    pub fn snapshot_trailing(mut self, val: u64) -> Self {
        self.snapshot_trailing = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval == 0 || heartbeat_interval > election_timeout_min / 2 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let snapshot_policy = self.snapshot_policy.unwrap_or_default();
        let snapshot_trailing = self.snapshot_trailing.unwrap_or(DEFAULT_SNAPSHOT_TRAILING);
        if snapshot_trailing == 0 {
            return Err(ConfigError::SnapshotTrailingTooSmall);
        }
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            snapshot_policy,
            snapshot_trailing,
            install_snapshot_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0").validate().unwrap();

        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.max_payload_entries, DEFAULT_MAX_PAYLOAD_ENTRIES);
        assert_eq!(cfg.snapshot_trailing, DEFAULT_SNAPSHOT_TRAILING);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
    }

    #[test]
    fn test_rand_election_timeout_stays_in_range() {
        let cfg = Config::build("cluster0").validate().unwrap();
        for _ in 0..1000 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min);
            assert!(t < cfg.election_timeout_max);
        }
    }

    #[test]
    fn test_invalid_election_timeout_produces_expected_error() {
        let res = Config::build("cluster0")
            .election_timeout_min(1000)
            .election_timeout_max(700)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn test_heartbeat_must_leave_election_headroom() {
        let res = Config::build("cluster0")
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(80)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidHeartbeatInterval);
    }
}
