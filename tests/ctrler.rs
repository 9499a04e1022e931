//! Shard controller scenarios: numbering, balance, determinism, and the
//! query/join/leave/move laws.

use std::collections::HashMap;

use shoal::config::Config;
use shoal::test_utils::CtrlCluster;
use shoal::{Gid, NSHARDS};

fn servers_for(gid: Gid) -> HashMap<Gid, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(gid, (0..3).map(|i| format!("g{gid}-{i}")).collect());
    map
}

fn counts(config: &Config) -> HashMap<Gid, usize> {
    let mut counts: HashMap<Gid, usize> = config.groups.keys().map(|g| (*g, 0)).collect();
    for gid in &config.shards {
        if let Some(c) = counts.get_mut(gid) {
            *c += 1;
        }
    }
    counts
}

fn assert_balanced(config: &Config) {
    assert!(
        config.shards.iter().all(|g| config.groups.contains_key(g)),
        "unassigned shard in {:?}",
        config.shards
    );
    let counts = counts(config);
    let min = counts.values().min().copied().unwrap_or(0);
    let max = counts.values().max().copied().unwrap_or(0);
    assert!(max - min <= 1, "unbalanced: {counts:?}");
}

#[tokio::test]
async fn query_returns_the_same_config_twice() {
    let cluster = CtrlCluster::new(3);
    let clerk = cluster.clerk();

    clerk.join(servers_for(1)).await;
    let first = clerk.query(Some(1)).await;
    let second = clerk.query(Some(1)).await;
    assert_eq!(first, second);
    assert_eq!(first.num, 1);

    let latest = clerk.query(None).await;
    assert!(latest.num >= 1);
}

#[tokio::test]
async fn join_assigns_all_shards_to_the_first_group() {
    let cluster = CtrlCluster::new(3);
    let clerk = cluster.clerk();

    clerk.join(servers_for(1)).await;
    let config = clerk.query(None).await;
    assert_eq!(config.shards, [1; NSHARDS]);
}

#[tokio::test]
async fn join_then_leave_differs_only_in_num() {
    let cluster = CtrlCluster::new(3);
    let clerk = cluster.clerk();

    clerk.join(servers_for(1)).await;
    let before = clerk.query(None).await;

    clerk.join(servers_for(2)).await;
    clerk.leave(vec![2]).await;
    let after = clerk.query(None).await;

    assert_eq!(before.shards, after.shards);
    assert_eq!(before.groups, after.groups);
    assert_eq!(after.num, before.num + 2);
}

#[tokio::test]
async fn successive_joins_stay_balanced() {
    let cluster = CtrlCluster::new(3);
    let clerk = cluster.clerk();

    for gid in 1..=4 {
        clerk.join(servers_for(gid)).await;
        let config = clerk.query(None).await;
        assert_eq!(config.num, gid);
        assert_balanced(&config);
    }

    clerk.leave(vec![2, 3]).await;
    let config = clerk.query(None).await;
    assert!(!config.groups.contains_key(&2));
    assert!(!config.groups.contains_key(&3));
    assert_balanced(&config);
}

#[tokio::test]
async fn move_pins_one_shard_and_nothing_else() {
    let cluster = CtrlCluster::new(3);
    let clerk = cluster.clerk();

    clerk.join(servers_for(1)).await;
    clerk.join(servers_for(2)).await;
    let before = clerk.query(None).await;

    clerk.move_shard(3, 1).await;
    let after = clerk.query(None).await;
    assert_eq!(after.num, before.num + 1);
    assert_eq!(after.shards[3], 1);
    for shard in 0..NSHARDS {
        if shard != 3 {
            assert_eq!(after.shards[shard], before.shards[shard]);
        }
    }
}

#[tokio::test]
async fn survives_a_replica_crash() {
    let mut cluster = CtrlCluster::new(3);
    let clerk = cluster.clerk();

    clerk.join(servers_for(1)).await;
    cluster.crash(0);

    clerk.join(servers_for(2)).await;
    let config = clerk.query(None).await;
    assert!(config.groups.contains_key(&1));
    assert!(config.groups.contains_key(&2));
    assert_balanced(&config);

    cluster.restart(0);
    let again = clerk.query(Some(config.num)).await;
    assert_eq!(again, config);
}
