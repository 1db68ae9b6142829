//! Higher-term step-down: any message with a greater term forces follower
//! state, clears the vote, and fails pending client requests.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use diskraft::error::ClientWriteError;
use diskraft::raft::AppendEntriesRequest;
use diskraft::testing::RaftRouter;
use diskraft::testing::TestRequest;
use diskraft::Config;
use diskraft::State;

#[tokio::test(flavor = "multi_thread")]
async fn higher_term_forces_step_down() -> Result<()> {
    // Slow timers keep the cluster quiet while we assert on the stepped-down
    // node's state.
    fixtures::setup_logger();
    let config = Arc::new(
        Config::build("test")
            .election_timeout_min(1000)
            .election_timeout_max(2000)
            .heartbeat_interval(100)
            .validate()?,
    );
    let router = RaftRouter::new(config);
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let raft = router.get_raft_handle(leader).unwrap();
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;
    let term = raft.metrics().borrow().current_term;

    // Cut the leader off so the pending write below cannot commit.
    router.isolate_node(leader);
    let pending = {
        let raft = raft.clone();
        tokio::spawn(async move { raft.client_write(TestRequest::new("never-commits")).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Any message carrying a higher term does it; here an AppendEntries from
    // a phantom leader.
    let res = raft
        .append_entries(AppendEntriesRequest {
            term: term + 1,
            leader_id: 99,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        })
        .await?;
    assert_eq!(res.term, term + 1);

    // The pending request fails with not-leader.
    let err = pending.await?.unwrap_err();
    assert!(matches!(err, ClientWriteError::ForwardToLeader(_)));

    // New state: follower at the higher term, vote cleared.
    let metrics = raft.metrics().borrow().clone();
    assert_eq!(metrics.state, State::Follower);
    assert_eq!(metrics.current_term, term + 1);
    assert_eq!(metrics.current_leader, Some(99));

    let hs = router.get_store(leader).unwrap().hard_state().await;
    assert_eq!(hs.current_term, term + 1);
    assert_eq!(hs.voted_for, None);

    // Further writes are refused outright.
    let err = raft.client_write(TestRequest::new("still-nope")).await.unwrap_err();
    assert!(matches!(err, ClientWriteError::ForwardToLeader(_)));

    router.shutdown_all().await;
    Ok(())
}
