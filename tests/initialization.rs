//! Cluster formation and the basic client write path.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use diskraft::testing::RaftRouter;
use diskraft::testing::TestRequest;

/// Basic lifecycle of a three node cluster.
///
/// - brings three voters online with the same bootstrap configuration;
/// - a leader is elected well within the bound;
/// - the leader's step-up barrier lands at index 1;
/// - a client command lands at index 2, and every node's state machine
///   observes it there with `commit_index == 2`.
#[tokio::test(flavor = "multi_thread")]
async fn three_node_happy_path() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let raft = router.get_raft_handle(leader).unwrap();
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier committed").await?;

    let resp = raft.client_write(TestRequest::new("hello")).await?;
    assert_eq!(resp.index, 2);

    for id in [1, 2, 3] {
        let node = router.get_raft_handle(id).unwrap();
        let metrics = node
            .wait(Some(Duration::from_secs(5)))
            .applied_at_least(2, format!("node {id} applied the command"))
            .await?;
        assert_eq!(metrics.commit_index, 2);
        assert_eq!(metrics.last_applied, 2);

        let store = router.get_store(id).unwrap();
        assert_eq!(store.applied_entries().await, vec![(2, "hello".to_string())]);
    }

    router.shutdown_all().await;
    Ok(())
}

/// A single-voter cluster elects itself immediately and commits without any
/// peers.
#[tokio::test(flavor = "multi_thread")]
async fn single_node_cluster() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(5)).await?;
    assert_eq!(leader, 1);

    let raft = router.get_raft_handle(1).unwrap();
    for i in 0..10 {
        let resp = raft.client_write(TestRequest::new(format!("cmd-{i}"))).await?;
        assert_eq!(resp.index, i + 2);
    }
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(11, "all commands applied").await?;

    router.shutdown_all().await;
    Ok(())
}

/// Initializing twice, or on a node with state, is refused.
#[tokio::test(flavor = "multi_thread")]
async fn double_initialize_is_rejected() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1]).await?;
    router.wait_for_leader(Duration::from_secs(5)).await?;

    let raft = router.get_raft_handle(1).unwrap();
    let res = raft.initialize(RaftRouter::voter_configuration(&[1])).await;
    assert!(res.is_err());

    router.shutdown_all().await;
    Ok(())
}
