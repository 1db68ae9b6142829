//! Cluster membership configuration.
//!
//! A configuration is an ordered list of servers, each with an id, an address
//! opaque to the core, and a role. Only voters count towards election and
//! commit quorums; standbys replicate the log without voting; spares receive
//! nothing until promoted. Membership changes are single-server: one add,
//! remove, or role change at a time.

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// The role a server plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    /// Participates in elections and commit quorums.
    Voter,
    /// Replicates the log but does not vote.
    Standby,
    /// A cold spare: known to the cluster, not replicated to until promoted.
    Spare,
}

impl ServerRole {
    /// The stable numeric code used on disk and on the wire.
    pub fn code(&self) -> u8 {
        match self {
            ServerRole::Voter => 0,
            ServerRole::Standby => 1,
            ServerRole::Spare => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ServerRole::Voter),
            1 => Some(ServerRole::Standby),
            2 => Some(ServerRole::Spare),
            _ => None,
        }
    }
}

/// A single server in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: NodeId,
    pub address: String,
    pub role: ServerRole,
}

/// The membership configuration of the cluster.
///
/// Configurations supersede each other by log index: the active configuration
/// is the one at the highest configuration entry written, even if it is not
/// yet committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// All members of the cluster, in insertion order.
    pub servers: Vec<Server>,
}

impl Configuration {
    pub fn new() -> Self {
        Self { servers: Vec::new() }
    }

    /// Number of servers in the configuration.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Add a server. Fails if the id is zero or already present.
    pub fn add(&mut self, id: NodeId, address: impl Into<String>, role: ServerRole) -> Result<(), ConfigurationInvalid> {
        if id == 0 {
            return Err(ConfigurationInvalid::ZeroId);
        }
        if self.contains(id) {
            return Err(ConfigurationInvalid::DuplicateId(id));
        }
        self.servers.push(Server {
            id,
            address: address.into(),
            role,
        });
        Ok(())
    }

    /// Remove the server with the given id, if present.
    pub fn remove(&mut self, id: NodeId) -> Result<(), ConfigurationInvalid> {
        let pos = self.servers.iter().position(|s| s.id == id).ok_or(ConfigurationInvalid::UnknownId(id))?;
        self.servers.remove(pos);
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Iterate over the voting members.
    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.role == ServerRole::Voter)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.get(id).map(|s| s.role == ServerRole::Voter).unwrap_or(false)
    }

    /// The number of votes needed to win an election or commit an entry:
    /// a majority of the voter set.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Check structural invariants: ids unique and nonzero.
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        for (i, s) in self.servers.iter().enumerate() {
            if s.id == 0 {
                return Err(ConfigurationInvalid::ZeroId);
            }
            if self.servers[..i].iter().any(|o| o.id == s.id) {
                return Err(ConfigurationInvalid::DuplicateId(s.id));
            }
        }
        Ok(())
    }
}

/// A structural problem with a configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationInvalid {
    #[error("server id must not be zero")]
    ZeroId,
    #[error("server id {0} appears more than once")]
    DuplicateId(NodeId),
    #[error("no server has id {0}")]
    UnknownId(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_voters() -> Configuration {
        let mut c = Configuration::new();
        c.add(1, "n1", ServerRole::Voter).unwrap();
        c.add(2, "n2", ServerRole::Voter).unwrap();
        c.add(3, "n3", ServerRole::Voter).unwrap();
        c
    }

    #[test]
    fn test_quorum_counts_voters_only() {
        let mut c = three_voters();
        assert_eq!(c.quorum(), 2);

        c.add(4, "n4", ServerRole::Spare).unwrap();
        c.add(5, "n5", ServerRole::Standby).unwrap();
        assert_eq!(c.voter_count(), 3);
        assert_eq!(c.quorum(), 2);

        c.get_mut(4).unwrap().role = ServerRole::Voter;
        assert_eq!(c.voter_count(), 4);
        assert_eq!(c.quorum(), 3);
    }

    #[test]
    fn test_add_rejects_duplicate_and_zero_ids() {
        let mut c = three_voters();
        assert_eq!(c.add(0, "n0", ServerRole::Voter), Err(ConfigurationInvalid::ZeroId));
        assert_eq!(c.add(2, "again", ServerRole::Spare), Err(ConfigurationInvalid::DuplicateId(2)));
    }

    #[test]
    fn test_remove_unknown_id() {
        let mut c = three_voters();
        assert_eq!(c.remove(9), Err(ConfigurationInvalid::UnknownId(9)));
        c.remove(2).unwrap();
        assert!(!c.contains(2));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_role_codes_round_trip() {
        for role in [ServerRole::Voter, ServerRole::Standby, ServerRole::Spare] {
            assert_eq!(ServerRole::from_code(role.code()), Some(role));
        }
        assert_eq!(ServerRole::from_code(9), None);
    }
}
