//! Log-engine scenarios: election safety, agreement, catch-up, failover,
//! persistence, and snapshot installation.

use std::time::Duration;

use bytes::Bytes;
use shoal::test_utils::RaftCluster;
use tokio::time::sleep;

fn cmd(i: u64) -> Bytes {
    Bytes::from(format!("cmd-{i}"))
}

#[tokio::test]
async fn initial_election_elects_exactly_one_leader() {
    let cluster = RaftCluster::new(3, None);
    let leader = cluster.check_one_leader().await;
    let (term_before, _) = cluster.node(leader).state();

    // A quiet network should not force new elections.
    sleep(Duration::from_millis(600)).await;
    cluster.check_one_leader().await;
    let (term_after, _) = cluster.node(leader).state();
    assert!(term_after >= term_before);
}

#[tokio::test]
async fn basic_agreement_commits_in_order() {
    let cluster = RaftCluster::new(3, None);
    cluster.check_one_leader().await;

    let mut last = 0;
    for i in 0..5 {
        let index = cluster.one(cmd(i)).await;
        assert!(index > last, "indices must increase: {index} after {last}");
        last = index;
    }
    cluster.assert_consistent();
}

#[tokio::test]
async fn disconnected_follower_catches_up() {
    let cluster = RaftCluster::new(3, None);
    let leader = cluster.check_one_leader().await;
    let follower = (leader + 1) % 3;

    cluster.disconnect(follower);
    let mut high = 0;
    for i in 0..10 {
        high = cluster.one(cmd(i)).await;
    }
    assert!(cluster.applied_up_to(follower) < high);

    cluster.reconnect(follower);
    sleep(Duration::from_secs(2)).await;
    assert!(
        cluster.applied_up_to(follower) >= high,
        "follower stuck at {} of {high}",
        cluster.applied_up_to(follower)
    );
    cluster.assert_consistent();
}

#[tokio::test]
async fn leader_crash_preserves_committed_entries() {
    let mut cluster = RaftCluster::new(5, None);
    let leader = cluster.check_one_leader().await;

    for i in 0..3 {
        cluster.one(cmd(i)).await;
    }
    cluster.crash(leader);

    cluster.check_one_leader().await;
    for i in 3..6 {
        cluster.one(cmd(i)).await;
    }

    cluster.restart(leader);
    sleep(Duration::from_secs(1)).await;
    cluster.one(cmd(6)).await;
    cluster.assert_consistent();
}

#[tokio::test]
async fn state_survives_a_full_restart() {
    let mut cluster = RaftCluster::new(3, None);
    cluster.check_one_leader().await;

    let mut high = 0;
    for i in 0..5 {
        high = cluster.one(cmd(i)).await;
    }

    for i in 0..3 {
        cluster.crash(i);
    }
    for i in 0..3 {
        cluster.restart(i);
    }

    cluster.check_one_leader().await;
    let index = cluster.one(cmd(100)).await;
    assert!(index > high, "restart lost committed entries");
    cluster.assert_consistent();
}

#[tokio::test]
async fn lagging_follower_converges_via_snapshot() {
    // Compact every 10 applies; a follower missing 40+ entries can only be
    // repaired by an InstallSnapshot.
    let cluster = RaftCluster::new(3, Some(10));
    let leader = cluster.check_one_leader().await;
    let follower = (leader + 1) % 3;

    for i in 0..10 {
        cluster.one(cmd(i)).await;
    }
    cluster.disconnect(follower);

    let mut high = 0;
    for i in 10..50 {
        high = cluster.one(cmd(i)).await;
    }

    cluster.reconnect(follower);
    sleep(Duration::from_secs(3)).await;
    assert!(
        cluster.applied_up_to(follower) >= high,
        "follower stuck at {} of {high}",
        cluster.applied_up_to(follower)
    );
    cluster.assert_consistent();
}
