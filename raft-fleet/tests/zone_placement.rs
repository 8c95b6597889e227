mod fixtures;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use fixtures::FleetRouter;
use maplit::btreemap;
use maplit::btreeset;
use raft_fleet::placement::lrw_members;
use raft_fleet::NodeId;
use raft_fleet::ZoneId;

/// Zone-aware placement.
///
/// - 6 nodes in 3 zones, two per zone.
/// - a 3-replica group converges onto exactly the rendezvous placement,
///   which spreads one replica per zone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicas_spread_one_per_zone() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let fleets = router.activated_cluster(config.clone(), &["z1", "z2", "z3", "z1", "z2", "z3"]).await?;

    fleets[0].add_consensus_group("orders".into(), 3, vec![]).await?;

    let zones: BTreeMap<ZoneId, BTreeSet<NodeId>> = btreemap! {
        "z1".to_string() => btreeset![1, 4],
        "z2".to_string() => btreeset![2, 5],
        "z3".to_string() => btreeset![3, 6],
    };
    let expected: BTreeSet<NodeId> = lrw_members(&zones, "orders", 3).into_iter().collect();

    // Wait for the fleet to converge onto exactly the computed placement;
    // in between, bootstrap and handover may run extra replicas.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let hosting: BTreeSet<NodeId> = router.hosting("orders").await.into_iter().collect();
        if hosting == expected {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("placement never converged: hosting {:?}, want {:?}", hosting, expected));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let zone_of = |node: NodeId| match node {
        1 | 4 => "z1",
        2 | 5 => "z2",
        _ => "z3",
    };
    let spread: BTreeSet<&str> = expected.iter().map(|&node| zone_of(node)).collect();
    assert_eq!(spread.len(), 3, "placement {:?} landed two replicas in one zone", expected);

    Ok(())
}
