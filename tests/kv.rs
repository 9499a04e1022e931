//! Single-group KV scenarios: the client protocol end to end.

use std::sync::Arc;
use std::time::Duration;

use shoal::test_utils::KvCluster;
use tokio::time::sleep;

#[tokio::test]
async fn put_append_get_basic() {
    let cluster = KvCluster::new(3, None);
    let clerk = cluster.clerk();

    clerk.put("a", "1").await;
    clerk.append("a", "2").await;
    assert_eq!(clerk.get("a").await, "12");
    assert_eq!(clerk.get("never-written").await, "");
}

#[tokio::test]
async fn values_survive_leader_crash() {
    let mut cluster = KvCluster::new(5, None);
    let clerk = cluster.clerk();

    for i in 0..5 {
        clerk.append("journal", &format!("[{i}]")).await;
    }
    let leader = cluster.leader_index().await.expect("no leader");
    cluster.crash(leader);

    for i in 5..10 {
        clerk.append("journal", &format!("[{i}]")).await;
    }
    let expected: String = (0..10).map(|i| format!("[{i}]")).collect();
    assert_eq!(clerk.get("journal").await, expected);

    cluster.restart(leader);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(clerk.get("journal").await, expected);
}

#[tokio::test]
async fn unreliable_network_applies_each_op_exactly_once() {
    let cluster = KvCluster::new(3, None);
    cluster.net.set_loss(0.2);

    let mut tasks = Vec::new();
    for c in 0..5 {
        let clerk = Arc::new(cluster.clerk());
        tasks.push(tokio::spawn(async move {
            let key = format!("client-{c}");
            for i in 0..20 {
                clerk.append(&key, &format!("({c},{i})")).await;
            }
        }));
    }
    for task in tasks {
        task.await.expect("client task panicked");
    }

    cluster.net.set_loss(0.0);
    let clerk = cluster.clerk();
    for c in 0..5 {
        let expected: String = (0..20).map(|i| format!("({c},{i})")).collect();
        assert_eq!(
            clerk.get(&format!("client-{c}")).await,
            expected,
            "client {c} lost or duplicated an append"
        );
    }
}

#[tokio::test]
async fn snapshots_keep_raft_state_bounded() {
    let mut cluster = KvCluster::new(3, Some(1000));
    let clerk = cluster.clerk();

    let filler = "x".repeat(40);
    for i in 0..100 {
        clerk.put(&format!("key-{i}"), &filler).await;
    }
    sleep(Duration::from_millis(500)).await;
    for i in 0..3 {
        assert!(
            cluster.state_size(i) < 8 * 1000,
            "replica {i} raft state never compacted: {}",
            cluster.state_size(i)
        );
    }

    // A restarted replica comes back from its snapshot.
    cluster.crash(0);
    cluster.restart(0);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(clerk.get("key-7").await, filler);
}
