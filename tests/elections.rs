//! Leader failover and convergence.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use diskraft::testing::RaftRouter;
use diskraft::testing::TestRequest;
use diskraft::State;

/// Kill (isolate) the leader; a new one takes over at a higher term, the old
/// one steps down on rejoining, and the logs converge identically.
#[tokio::test(flavor = "multi_thread")]
async fn leader_failover_and_rejoin() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1, 2, 3]).await?;

    let old_leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let old_raft = router.get_raft_handle(old_leader).unwrap();
    old_raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;
    let old_term = old_raft.metrics().borrow().current_term;

    old_raft.client_write(TestRequest::new("before-failover")).await?;

    router.isolate_node(old_leader);

    // One of the survivors takes over at a higher term.
    let new_leader = wait_for_other_leader(&router, old_leader, Duration::from_secs(10)).await?;
    let new_raft = router.get_raft_handle(new_leader).unwrap();
    let new_term = new_raft.metrics().borrow().current_term;
    assert!(new_term > old_term);

    new_raft.client_write(TestRequest::new("after-failover")).await?;

    // The deposed leader rejoins and steps down.
    router.restore_node(old_leader);
    old_raft
        .wait(Some(Duration::from_secs(10)))
        .metrics(
            |m| m.state != State::Leader && m.current_term >= new_term,
            "old leader steps down",
        )
        .await?;

    // All state machines converge on the same sequence.
    let last = new_raft.metrics().borrow().last_applied;
    let reference = router.get_store(new_leader).unwrap().applied_entries().await;
    let data: Vec<&str> = reference.iter().map(|(_, d)| d.as_str()).collect();
    assert!(data.contains(&"before-failover"));
    assert!(data.contains(&"after-failover"));

    for id in [1, 2, 3] {
        let node = router.get_raft_handle(id).unwrap();
        node.wait(Some(Duration::from_secs(10))).applied_at_least(last, format!("node {id} converged")).await?;
        assert_eq!(router.get_store(id).unwrap().applied_entries().await, reference);
    }

    // Exactly one node leads once the dust settles.
    let leaders: Vec<u64> = [1, 2, 3]
        .into_iter()
        .filter(|id| {
            let raft = router.get_raft_handle(*id).unwrap();
            raft.metrics().borrow().state == State::Leader
        })
        .collect();
    assert_eq!(leaders.len(), 1);

    router.shutdown_all().await;
    Ok(())
}

async fn wait_for_other_leader(router: &Arc<RaftRouter>, not: u64, timeout: Duration) -> Result<u64> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for id in router.node_ids() {
            if id == not {
                continue;
            }
            let raft = router.get_raft_handle(id).unwrap();
            if raft.metrics().borrow().state == State::Leader {
                return Ok(id);
            }
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no replacement leader elected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
