//! Test fixtures: an in-memory store, a fault-injecting wrapper, and an
//! in-process cluster router.
//!
//! These live in the crate proper (rather than under `#[cfg(test)]`) so the
//! integration test suite and downstream applications can reuse them.

mod fault;
mod memstore;
mod router;

use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::storage::StateMachine;
use crate::AppData;
use crate::AppDataResponse;

pub use fault::FaultStore;
pub use memstore::MemStore;
pub use router::MemRaft;
pub use router::RaftRouter;
pub use router::RouterNetwork;

/// The client request type used throughout the test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequest {
    pub data: String,
}

impl TestRequest {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl AppData for TestRequest {}

/// The response type produced by the test state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResponse {
    /// The log index the command was applied at.
    pub index: u64,
}

impl AppDataResponse for TestResponse {}

/// A deterministic state machine which records every applied command.
#[derive(Debug, Default)]
pub struct TestStateMachine {
    applied: Mutex<Vec<(u64, String)>>,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(index, command)` pair applied so far, in order.
    pub fn applied(&self) -> Vec<(u64, String)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn last_applied(&self) -> u64 {
        self.applied.lock().unwrap().last().map(|(i, _)| *i).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl StateMachine<TestRequest, TestResponse> for TestStateMachine {
    async fn apply(&self, index: u64, data: &TestRequest) -> anyhow::Result<TestResponse> {
        let mut applied = self.applied.lock().unwrap();
        if let Some((last, _)) = applied.last() {
            anyhow::ensure!(index > *last, "apply out of order: {index} after {last}");
        }
        applied.push((index, data.data.clone()));
        Ok(TestResponse { index })
    }

    async fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let applied = self.applied.lock().unwrap();
        Ok(serde_json::to_vec(&*applied)?)
    }

    async fn restore(&self, _last_index: u64, data: &[u8]) -> anyhow::Result<()> {
        let restored: Vec<(u64, String)> = serde_json::from_slice(data)?;
        *self.applied.lock().unwrap() = restored;
        Ok(())
    }
}
