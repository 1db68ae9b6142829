use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a raft log entry.
///
/// A term and an index identify a log entry globally: two logs holding an
/// entry with the same `LogId` are identical at and before that entry.
#[derive(Debug, Default, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}
