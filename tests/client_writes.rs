//! Client write and barrier behavior.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use diskraft::error::ClientWriteError;
use diskraft::testing::RaftRouter;
use diskraft::testing::TestRequest;

/// A barrier resolves only after everything accepted before it has been
/// committed and applied.
#[tokio::test(flavor = "multi_thread")]
async fn barrier_flushes_the_pipeline() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let raft = router.get_raft_handle(leader).unwrap();
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;

    raft.client_write(TestRequest::new("a")).await?;
    raft.client_write(TestRequest::new("b")).await?;

    let resp = raft.barrier().await?;
    assert_eq!(resp.index, 4);

    // The barrier implies both commands are applied on the leader.
    let store = router.get_store(leader).unwrap();
    assert_eq!(
        store.applied_entries().await,
        vec![(2, "a".to_string()), (3, "b".to_string())]
    );

    router.shutdown_all().await;
    Ok(())
}

/// Writes sent to a follower are bounced towards the leader.
#[tokio::test(flavor = "multi_thread")]
async fn follower_forwards_to_leader() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let follower = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();
    let raft = router.get_raft_handle(follower).unwrap();

    // Give the follower a heartbeat so it knows who leads.
    raft.wait(Some(Duration::from_secs(5))).current_leader(leader, "follower sees leader").await?;

    let err = raft.client_write(TestRequest::new("nope")).await.unwrap_err();
    match err {
        ClientWriteError::ForwardToLeader(hint) => assert_eq!(hint, Some(leader)),
        other => panic!("expected ForwardToLeader, got {other:?}"),
    }

    router.shutdown_all().await;
    Ok(())
}

/// Writes are applied in index order on every node, at most once.
#[tokio::test(flavor = "multi_thread")]
async fn writes_apply_in_total_order() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let raft = router.get_raft_handle(leader).unwrap();
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;

    let n = 50u64;
    for i in 0..n {
        raft.client_write(TestRequest::new(format!("cmd-{i}"))).await?;
    }
    let last = n + 1;

    let reference = {
        let node = router.get_raft_handle(1).unwrap();
        node.wait(Some(Duration::from_secs(10))).applied_at_least(last, "node 1 caught up").await?;
        router.get_store(1).unwrap().applied_entries().await
    };
    assert_eq!(reference.len(), n as usize);
    // Strictly increasing indices, values in submission order.
    for (pos, (index, data)) in reference.iter().enumerate() {
        assert_eq!(*index, pos as u64 + 2);
        assert_eq!(data, &format!("cmd-{pos}"));
    }

    for id in [2, 3] {
        let node = router.get_raft_handle(id).unwrap();
        node.wait(Some(Duration::from_secs(10))).applied_at_least(last, format!("node {id} caught up")).await?;
        assert_eq!(router.get_store(id).unwrap().applied_entries().await, reference);
    }

    router.shutdown_all().await;
    Ok(())
}
