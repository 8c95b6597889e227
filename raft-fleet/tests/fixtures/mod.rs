//! Fixtures for testing the fleet.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use memengine::MemEngine;
use memengine::MemMachineFactory;
use memengine::MemNet;
use raft_fleet::async_trait::async_trait;
use raft_fleet::error::RpcError;
use raft_fleet::BootstrapOutcome;
use raft_fleet::BootstrapRequest;
use raft_fleet::Config;
use raft_fleet::Fleet;
use raft_fleet::FleetNetwork;
use raft_fleet::NodeId;
use raft_fleet::ReplicaRef;
use raft_fleet::ZoneId;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete fleet type used during testing.
pub type MemFleet = Fleet<MemEngine, FleetRouter>;

static INIT_TRACING: Once = Once::new();

/// Initialize the tracing system, once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::Layer::default()
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
            .with_ansi(false);
        let subscriber = tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).expect("error setting global tracing subscriber");
    });
}

/// A cluster config with every interval shortened for tests.
pub fn test_config() -> Result<Arc<Config>> {
    let config = Config::build("test".into())
        .balancing_interval(100)
        .leader_cache_refresh_interval(200)
        .node_purge_reconnect_interval(100)
        .node_purge_failure_time_window(400)
        .node_purge_threshold_failing_members(0)
        .tombstone_ttl(60 * 1000)
        .rpc_timeout(200)
        .rpc_retry(3)
        .rpc_retry_interval(100)
        .validate()?;
    Ok(Arc::new(config))
}

/// A type which emulates the inter-node control plane and implements the
/// `FleetNetwork` trait.
pub struct FleetRouter {
    /// The substrate shared by all in-process engines.
    net: Arc<MemNet>,
    /// The table of all fleet nodes currently known to this router.
    routing_table: RwLock<BTreeMap<NodeId, MemFleet>>,
}

impl FleetRouter {
    /// Create a new instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            net: MemNet::new(),
            routing_table: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn net(&self) -> &Arc<MemNet> {
        &self.net
    }

    /// Create and register a new fleet node bearing the given ID.
    pub async fn new_fleet_node(self: &Arc<Self>, id: NodeId, config: Arc<Config>) -> MemFleet {
        let engine = Arc::new(MemEngine::new(id, self.net.clone()));
        let fleet = Fleet::new(id, config, engine, self.clone(), Arc::new(MemMachineFactory));
        let mut rt = self.routing_table.write().await;
        rt.insert(id, fleet.clone());
        fleet
    }

    /// Create `zones.len()` nodes with ids `1..`, activate each in its
    /// zone, and return the handles in id order.
    pub async fn activated_cluster(self: &Arc<Self>, config: Arc<Config>, zones: &[&str]) -> Result<Vec<MemFleet>> {
        let mut fleets = Vec::with_capacity(zones.len());
        for (i, zone) in zones.iter().enumerate() {
            let id = i as NodeId + 1;
            let fleet = self.new_fleet_node(id, config.clone()).await;
            fleet.activate(ZoneId::from(*zone)).await?;
            fleets.push(fleet);
        }
        Ok(fleets)
    }

    /// Cut the node off from the rest of the cluster.
    pub async fn isolate_node(&self, id: NodeId) {
        self.net.isolate(id).await;
    }

    /// Reconnect a previously isolated node.
    pub async fn restore_node(&self, id: NodeId) {
        self.net.restore(id).await;
    }

    /// The registered nodes currently hosting a replica of `group`.
    pub async fn hosting(&self, group: &str) -> Vec<NodeId> {
        let ids: Vec<NodeId> = self.routing_table.read().await.keys().copied().collect();
        let mut hosting = Vec::new();
        for id in ids {
            if self.net.hosts(id, group).await {
                hosting.push(id);
            }
        }
        hosting
    }

    /// Poll until `group` runs on exactly `expect` nodes.
    pub async fn wait_hosting(&self, group: &str, expect: usize, timeout: Duration, msg: &str) -> Result<Vec<NodeId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let hosting = self.hosting(group).await;
            if hosting.len() == expect {
                return Ok(hosting);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "timeout waiting for {}: '{}' runs on {:?}, want {} hosts",
                    msg,
                    group,
                    hosting,
                    expect
                ));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll `active_nodes` through `via` until `expect` nodes remain.
    pub async fn wait_active_count(
        &self,
        via: &MemFleet,
        expect: usize,
        timeout: Duration,
        msg: &str,
    ) -> Result<BTreeMap<ZoneId, Vec<NodeId>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(nodes) = via.active_nodes().await {
                let count: usize = nodes.values().map(|zone| zone.len()).sum();
                if count == expect {
                    return Ok(nodes);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("timeout waiting for {}: want {} active nodes", msg, expect));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll `whereis_leader` through `via` until `pred` accepts the answer.
    pub async fn wait_leader<F>(
        &self,
        via: &MemFleet,
        group: &str,
        pred: F,
        timeout: Duration,
        msg: &str,
    ) -> Result<NodeId>
    where
        F: Fn(NodeId) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = via.whereis_leader(group).await {
                if pred(leader) {
                    return Ok(leader);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("timeout waiting for {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl FleetNetwork for FleetRouter {
    async fn peers(&self) -> Vec<NodeId> {
        self.routing_table.read().await.keys().copied().collect()
    }

    async fn probe_leader(&self, target: NodeId, group: &str) -> Result<Option<ReplicaRef>, RpcError> {
        if self.net.is_isolated(target).await {
            return Err(RpcError::Transport(format!("node {} is unreachable", target)));
        }
        if !self.routing_table.read().await.contains_key(&target) {
            return Err(RpcError::Transport(format!("node {} is not connected", target)));
        }
        Ok(self.net.probe_leader(target, group).await)
    }

    async fn bootstrap_group(&self, target: NodeId, req: BootstrapRequest) -> Result<BootstrapOutcome, RpcError> {
        if self.net.is_isolated(target).await {
            return Err(RpcError::Transport(format!("node {} is unreachable", target)));
        }
        let fleet = self
            .routing_table
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or_else(|| RpcError::Transport(format!("node {} is not connected", target)))?;
        fleet.bootstrap_group(req).await.map_err(|err| RpcError::Transport(format!("remote bootstrap failed: {}", err)))
    }

    async fn ping(&self, target: NodeId) -> Result<(), RpcError> {
        if self.net.is_isolated(target).await {
            return Err(RpcError::Transport(format!("node {} is unreachable", target)));
        }
        if !self.routing_table.read().await.contains_key(&target) {
            return Err(RpcError::Transport(format!("node {} is not connected", target)));
        }
        Ok(())
    }

    async fn probe_replica(&self, target: NodeId, group: &str) -> Result<(), RpcError> {
        if self.net.is_isolated(target).await {
            return Err(RpcError::Transport(format!("node {} is unreachable", target)));
        }
        if self.net.hosts(target, group).await {
            Ok(())
        } else {
            Err(RpcError::Transport(format!("no replica of '{}' on node {}", group, target)))
        }
    }
}
