mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::FleetRouter;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use raft_fleet::error::ActivateError;
use raft_fleet::error::DeactivateError;

/// Single-node activation.
///
/// - bring up one node and activate it in zone z1; it founds the cluster
///   group on its own.
/// - `active_nodes` reports {z1: [1]}.
/// - activating twice is rejected, deactivating works exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_activation() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let node = router.new_fleet_node(1, config.clone()).await;

    node.activate("z1".into()).await?;
    assert_eq!(btreemap! { "z1".to_string() => vec![1] }, node.active_nodes().await?);

    match node.activate("z2".into()).await {
        Err(ActivateError::NotInactive) => {}
        other => panic!("expected NotInactive, got {:?}", other),
    }
    // The failed second activation must not have moved the node.
    assert_eq!(btreemap! { "z1".to_string() => vec![1] }, node.active_nodes().await?);

    node.deactivate().await?;
    match node.deactivate().await {
        Err(DeactivateError::Inactive) => {}
        other => panic!("expected Inactive, got {:?}", other),
    }

    node.shutdown().await?;
    Ok(())
}

/// Activation state is visible through the metrics channel.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn activation_is_visible_in_metrics() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let node = router.new_fleet_node(1, config.clone()).await;

    assert_eq!(node.metrics().borrow().active_zone, None);

    node.activate("z1".into()).await?;
    let metrics = node.wait(Some(Duration::from_secs(1))).active_in("z1", "node activates").await?;
    // Founding the cluster group leaves its replica on this node.
    assert!(metrics.hosted.iter().any(|group| group.as_str() == "fleet.cluster"));
    assert_eq!(metrics.cluster_leader, Some(1));

    node.shutdown().await?;
    Ok(())
}

/// A later node joins the cluster founded by the first.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_node_joins_existing_cluster() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let first = router.new_fleet_node(1, config.clone()).await;
    first.activate("z1".into()).await?;

    let second = router.new_fleet_node(2, config.clone()).await;
    second.activate("z2".into()).await?;

    let expected = btreemap! {
        "z1".to_string() => vec![1],
        "z2".to_string() => vec![2],
    };
    assert_eq!(expected, first.active_nodes().await?);
    assert_eq!(expected, second.active_nodes().await?);
    // Both nodes agree on the cluster-group leadership.
    assert_eq!(second.whereis_leader("fleet.cluster").await, Some(1));

    Ok(())
}
