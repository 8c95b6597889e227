mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::FleetRouter;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use raft_fleet::error::AddGroupError;
use raft_fleet::error::RemoveGroupError;

/// Add and remove consensus groups.
///
/// - 3 nodes in 3 zones.
/// - `add_consensus_group(orders, 3)` registers the group and spreads one
///   replica to every node.
/// - a duplicate add is rejected and leaves the registration untouched.
/// - commands and queries round-trip through the group's leader.
/// - `remove_consensus_group` unregisters the group, replicas are wound
///   down, and the tombstone does not block re-registration.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_and_remove_groups() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let fleets = router.activated_cluster(config.clone(), &["z1", "z2", "z3"]).await?;
    let (a, b, c) = (&fleets[0], &fleets[1], &fleets[2]);

    assert!(a.consensus_groups().await?.is_empty());

    a.add_consensus_group("orders".into(), 3, vec![]).await?;
    assert_eq!(btreemap! { "orders".to_string() => 3 }, b.consensus_groups().await?);

    match b.add_consensus_group("orders".into(), 5, vec![]).await {
        Err(AddGroupError::AlreadyAdded(name)) => assert_eq!(name, "orders"),
        other => panic!("expected AlreadyAdded, got {:?}", other),
    }
    assert_eq!(btreemap! { "orders".to_string() => 3 }, c.consensus_groups().await?);

    router.wait_hosting("orders", 3, Duration::from_secs(5), "replicas to spread").await?;

    let written = b.command("orders", b"v1").await?;
    assert_eq!(written, b"v1");
    let read = c.query("orders", b"").await?;
    assert_eq!(read, b"v1");

    a.remove_consensus_group("orders".into()).await?;
    assert!(b.consensus_groups().await?.is_empty());
    router.wait_hosting("orders", 0, Duration::from_secs(5), "replicas to stop").await?;

    match c.remove_consensus_group("orders".into()).await {
        Err(RemoveGroupError::NotFound(name)) => assert_eq!(name, "orders"),
        other => panic!("expected NotFound, got {:?}", other),
    }

    // A fresh registration consumes the tombstone.
    a.add_consensus_group("orders".into(), 2, vec![]).await?;
    assert_eq!(btreemap! { "orders".to_string() => 2 }, a.consensus_groups().await?);

    Ok(())
}

/// The cluster group's own name is not available to users.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_group_name_is_reserved() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let node = router.new_fleet_node(1, config.clone()).await;
    node.activate("z1".into()).await?;

    match node.add_consensus_group("fleet.cluster".into(), 3, vec![]).await {
        Err(AddGroupError::Reserved(_)) => {}
        other => panic!("expected Reserved, got {:?}", other),
    }
    match node.remove_consensus_group("fleet.cluster".into()).await {
        Err(RemoveGroupError::Reserved(_)) => {}
        other => panic!("expected Reserved, got {:?}", other),
    }
    match node.add_consensus_group("g".into(), 0, vec![]).await {
        Err(AddGroupError::InvalidReplicaCount) => {}
        other => panic!("expected InvalidReplicaCount, got {:?}", other),
    }

    Ok(())
}
