//! Runs the whole system in one process: a controller cluster, two replica
//! groups, and a clerk driving reads and writes across a reconfiguration.
//!
//! ```sh
//! RUST_LOG=shoal=info cargo run --bin local-cluster
//! ```

use std::time::Duration;

use anyhow::Result;
use shoal::test_utils::ShardSystem;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let system = ShardSystem::new(2, 3, Some(8 * 1024));
    let clerk = system.clerk();

    info!("joining group 100");
    system.join(100).await;

    for i in 0..20 {
        clerk.put(&format!("key-{i}"), &format!("v{i}")).await;
    }
    info!("wrote 20 keys to group 100");

    info!("joining group 101; shards rebalance while writes continue");
    system.join(101).await;
    for i in 0..20 {
        clerk.append(&format!("key-{i}"), "+more").await;
    }

    // Let migrations settle, then retire the first group entirely.
    sleep(Duration::from_secs(1)).await;
    info!("group 100 leaving; its shards migrate to 101");
    system.leave(100).await;
    sleep(Duration::from_secs(1)).await;

    for i in 0..20 {
        let value = clerk.get(&format!("key-{i}")).await;
        assert_eq!(value, format!("v{i}+more"));
    }
    info!("all 20 keys intact after two reconfigurations");
    Ok(())
}
