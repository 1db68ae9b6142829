//! Leadership transfer via TimeoutNow.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use diskraft::testing::RaftRouter;
use diskraft::testing::TestRequest;
use diskraft::State;

/// Transfer to an explicit, caught-up target: TimeoutNow goes out at once
/// and the target wins the disruptive election.
#[tokio::test(flavor = "multi_thread")]
async fn transfer_to_explicit_target() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let raft = router.get_raft_handle(leader).unwrap();
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;
    raft.client_write(TestRequest::new("payload")).await?;

    let target = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();
    raft.transfer_leadership(Some(target)).await?;

    let traft = router.get_raft_handle(target).unwrap();
    traft
        .wait(Some(Duration::from_secs(10)))
        .state(State::Leader, "transfer target takes over")
        .await?;

    // The old leader acknowledges the new one.
    raft.wait(Some(Duration::from_secs(10)))
        .metrics(|m| m.state == State::Follower, "old leader steps down")
        .await?;

    router.shutdown_all().await;
    Ok(())
}

/// With no explicit target the most caught-up voter is chosen.
#[tokio::test(flavor = "multi_thread")]
async fn transfer_picks_a_target_automatically() -> Result<()> {
    fixtures::setup_logger();
    let router = RaftRouter::new(fixtures::default_config());
    router.new_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    let raft = router.get_raft_handle(leader).unwrap();
    raft.wait(Some(Duration::from_secs(5))).applied_at_least(1, "leader barrier").await?;

    raft.transfer_leadership(None).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let new_leader = router.wait_for_leader(Duration::from_secs(10)).await?;
        if new_leader != leader {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "leadership never moved");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    router.shutdown_all().await;
    Ok(())
}
