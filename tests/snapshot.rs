//! Snapshot install on a lagging follower.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use diskraft::testing::RaftRouter;
use diskraft::testing::TestRequest;
use diskraft::Config;
use diskraft::SnapshotPolicy;

/// A follower cut off while the leader compacts its log is brought back via
/// InstallSnapshot: its log restarts past the snapshot boundary and its
/// state machine equals the leader's.
#[tokio::test(flavor = "multi_thread")]
async fn lagging_follower_receives_snapshot() -> Result<()> {
    fixtures::setup_logger();
    let config = Arc::new(
        Config::build("test")
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(40))
            .snapshot_trailing(10)
            .validate()?,
    );
    let router = RaftRouter::new(config);
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let raft = router.get_raft_handle(leader).unwrap();
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;

    router.isolate_node(3);

    for i in 0..60u64 {
        raft.client_write(TestRequest::new(format!("cmd-{i}"))).await?;
    }
    // The policy fires once 40 entries accumulate past the last snapshot.
    let leader_metrics = raft
        .wait(Some(Duration::from_secs(10)))
        .metrics(|m| m.snapshot_index > 0, "leader took a snapshot")
        .await?;
    assert!(leader_metrics.snapshot_index > 1);

    router.restore_node(3);

    let n3 = router.get_raft_handle(3).unwrap();
    let m3 = n3
        .wait(Some(Duration::from_secs(10)))
        .applied_at_least(leader_metrics.last_applied, "node 3 caught up")
        .await?;
    assert!(m3.snapshot_index > 0, "node 3 should have installed a snapshot");

    // State machine safety: identical applied sequences.
    let leader_applied = router.get_store(leader).unwrap().applied_entries().await;
    let n3_applied = router.get_store(3).unwrap().applied_entries().await;
    assert_eq!(n3_applied, leader_applied);

    // The follower's log was reset to start past the snapshot boundary.
    let first = router.get_store(3).unwrap().first_log_index().await;
    assert!(first.map(|f| f > 1).unwrap_or(true), "log should not start at 1, got {first:?}");

    router.shutdown_all().await;
    Ok(())
}
