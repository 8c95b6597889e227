mod fixtures;

use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Result;
use fixtures::FleetRouter;
use pretty_assertions::assert_eq;

/// Leader failover.
///
/// - 3 nodes, one replica of `orders` on each.
/// - cut the current leader off.
/// - a command through a surviving node still succeeds, within the
///   worst-case retry latency, against the newly elected leader.
/// - the leader lookup settles on a surviving node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config()?;
    let router = FleetRouter::new();
    let fleets = router.activated_cluster(config.clone(), &["z1", "z2", "z3"]).await?;

    fleets[0].add_consensus_group("orders".into(), 3, vec![]).await?;
    router.wait_hosting("orders", 3, Duration::from_secs(5), "replicas to spread").await?;

    let leader =
        router.wait_leader(&fleets[1], "orders", |_| true, Duration::from_secs(5), "initial leader").await?;
    let via = fleets
        .iter()
        .find(|fleet| fleet.metrics().borrow().id != leader)
        .cloned()
        .ok_or_else(|| anyhow!("no surviving node to dispatch through"))?;

    // Warm the survivor's leader cache so the failover path starts from a
    // stale entry, the way production callers would.
    via.command("orders", b"before").await?;

    tracing::info!(leader, "--- isolating the leader");
    router.isolate_node(leader).await;

    let started = Instant::now();
    let out = via.command("orders", b"after").await?;
    assert_eq!(out, b"after");
    // timeout * (retry + 1) + retry_interval * retry, with slack for the
    // discovery probes.
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "failover took {:?}, beyond the retry budget",
        started.elapsed()
    );

    let new_leader = router
        .wait_leader(&via, "orders", |node| node != leader, Duration::from_secs(5), "a new leader to be reported")
        .await?;
    assert_ne!(new_leader, leader);

    // The replicated value survived the failover.
    let read = via.query("orders", b"").await?;
    assert_eq!(read, b"after");

    Ok(())
}
