mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::FleetRouter;
use pretty_assertions::assert_eq;

/// Unhealthy-node purge.
///
/// - 3 nodes, one replica of `orders` on each.
/// - disconnect node 3 and leave it down past the failure window.
/// - the purge controller drops it from `active_nodes` and from every
///   member set; the remaining nodes keep serving.
/// - when the node comes back it notices it was purged and winds its
///   zombie replicas down.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unhealthy_node_is_purged() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let fleets = router.activated_cluster(config.clone(), &["z1", "z2", "z3"]).await?;

    fleets[0].add_consensus_group("orders".into(), 3, vec![]).await?;
    router.wait_hosting("orders", 3, Duration::from_secs(5), "replicas to spread").await?;

    tracing::info!("--- disconnecting node 3");
    router.isolate_node(3).await;

    let nodes = router
        .wait_active_count(&fleets[0], 2, Duration::from_secs(5), "the purge controller to drop node 3")
        .await?;
    assert!(nodes.values().flatten().all(|&node| node != 3), "node 3 still listed in {:?}", nodes);

    // The surviving majority keeps serving.
    let written = fleets[0].command("orders", b"still-on").await?;
    assert_eq!(written, b"still-on");

    tracing::info!("--- reconnecting node 3");
    router.restore_node(3).await;

    // The reconnected node observes it was purged and stops its replica.
    let hosting = router.wait_hosting("orders", 2, Duration::from_secs(5), "the zombie replica to stop").await?;
    assert!(!hosting.contains(&3), "node 3 still hosts a replica");

    // Purged is not banned: the node may activate again.
    fleets[2].activate("z3".into()).await?;
    router.wait_active_count(&fleets[0], 3, Duration::from_secs(5), "node 3 to rejoin").await?;

    Ok(())
}
