//! The per-node manager task.
//!
//! One `FleetCore` runs per node. It owns the node's activation state and
//! the registry of replicas actually running here, and it is the only
//! writer of both. Rebalancing, leader cache refresh and unhealthy-node
//! purging all happen on periodic ticks inside its main loop, so the
//! in-process replica topology converges on whatever the cluster group
//! last decided.

mod balance;
mod bootstrap;
mod purge;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::dispatch::CallOptions;
use crate::dispatch::Dispatcher;
use crate::engine::FleetNetwork;
use crate::engine::MachineFactory;
use crate::engine::RaftEngine;
use crate::engine::ReplicaRef;
use crate::engine::ReplicaSpec;
use crate::engine::ReplicatedMachine;
use crate::engine::StartMode;
use crate::error::ActivateError;
use crate::error::DeactivateError;
use crate::error::FleetError;
use crate::error::FleetResult;
use crate::error::RemoveGroupError;
use crate::fleet::FleetMsg;
use crate::metrics::FleetMetrics;
use crate::now_millis;
use crate::state::ClusterMachine;
use crate::state::FleetCommand;
use crate::state::FleetQuery;
use crate::state::FleetResponse;
use crate::GroupName;
use crate::NodeId;
use crate::ZoneId;

pub(crate) struct FleetCore<E: RaftEngine, N: FleetNetwork> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The external Raft engine running this node's replicas.
    engine: Arc<E>,
    /// The inter-node control plane.
    network: Arc<N>,
    /// Routes commands and queries to group leaders.
    dispatcher: Arc<Dispatcher<E, N>>,
    /// Builds the state machines hosted inside user groups.
    machines: Arc<dyn MachineFactory>,

    /// The consensus groups with a replica running on this node. Owned
    /// exclusively by this task.
    registry: BTreeMap<GroupName, ReplicaRef>,
    /// The zone this node is active in, if any.
    active_zone: Option<ZoneId>,
    /// Completed balancing passes since startup.
    balancing_rounds: u64,

    rx_api: mpsc::UnboundedReceiver<(FleetMsg, Span)>,
    tx_metrics: watch::Sender<FleetMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<E: RaftEngine, N: FleetNetwork> FleetCore<E, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        engine: Arc<E>,
        network: Arc<N>,
        dispatcher: Arc<Dispatcher<E, N>>,
        machines: Arc<dyn MachineFactory>,
        rx_api: mpsc::UnboundedReceiver<(FleetMsg, Span)>,
        tx_metrics: watch::Sender<FleetMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<FleetResult<()>> {
        let this = Self {
            id,
            config,
            engine,
            network,
            dispatcher,
            machines,
            registry: BTreeMap::new(),
            active_zone: None,
            balancing_rounds: 0,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the manager task.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> FleetResult<()> {
        tracing::debug!("fleet manager is initializing");

        let mut balancing = interval(Duration::from_millis(self.config.balancing_interval));
        balancing.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = interval(Duration::from_millis(self.config.leader_cache_refresh_interval));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = interval(Duration::from_millis(self.config.node_purge_reconnect_interval));
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some((msg, span)) = self.rx_api.recv() => {
                    self.handle_msg(msg).instrument(span).await;
                }
                _ = balancing.tick() => {
                    self.balancing_pass().await;
                    self.report_metrics();
                }
                _ = refresh.tick() => self.refresh_cache_pass().await,
                _ = purge.tick() => self.purge_pass().await,
                _ = &mut self.rx_shutdown => {
                    self.shutdown_replicas().await;
                    tracing::info!("fleet manager has shut down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: FleetMsg) {
        match msg {
            FleetMsg::Activate { zone, tx } => {
                let res = self.handle_activate(zone).await;
                self.report_metrics();
                let _ = tx.send(res);
            }
            FleetMsg::Deactivate { tx } => {
                let res = self.handle_deactivate().await;
                self.report_metrics();
                let _ = tx.send(res);
            }
            FleetMsg::AddGroup {
                name,
                n_replica,
                rv_config,
                tx,
            } => {
                let res = self.handle_add_group(name, n_replica, rv_config).await;
                self.report_metrics();
                let _ = tx.send(res);
            }
            FleetMsg::RemoveGroup { name, tx } => {
                let res = self.handle_remove_group(name).await;
                let _ = tx.send(res);
            }
            FleetMsg::Bootstrap { req, tx } => {
                let res = self.serve_bootstrap(req).await;
                self.report_metrics();
                let _ = tx.send(res);
            }
        }
    }

    /// Join the cluster as an active node of `zone`.
    ///
    /// The first node of a cluster finds no cluster group to talk to and
    /// founds it: the cluster group replica is started locally and seeded
    /// with its own row before the activation command is committed.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_activate(&mut self, zone: ZoneId) -> Result<(), ActivateError> {
        if self.active_zone.is_some() {
            return Err(ActivateError::NotInactive);
        }
        if self.dispatcher.locate_cluster_leader().await.is_none() {
            tracing::info!(zone = %zone, "no cluster group found, founding one on this node");
            self.found_cluster_group().await?;
        }
        let opts = self.call_options();
        let command = FleetCommand::Activate {
            node: self.id,
            zone: zone.clone(),
        };
        self.dispatcher.cluster_command(&command, &opts).await.map_err(ActivateError::Fleet)?;
        self.active_zone = Some(zone);
        Ok(())
    }

    /// Leave the cluster. Local replicas are kept running until other
    /// Managers take over their placements; the balancing loop winds them
    /// down with the usual quorum guard.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_deactivate(&mut self) -> Result<(), DeactivateError> {
        if self.active_zone.is_none() {
            return Err(DeactivateError::Inactive);
        }
        let opts = self.call_options();
        let command = FleetCommand::Deactivate { node: self.id };
        self.dispatcher.cluster_command(&command, &opts).await.map_err(DeactivateError::Fleet)?;
        self.active_zone = None;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_remove_group(&mut self, name: GroupName) -> Result<(), RemoveGroupError> {
        if name == self.config.cluster_group {
            return Err(RemoveGroupError::Reserved(name));
        }
        let opts = self.call_options();
        let command = FleetCommand::RemoveGroup {
            name: name.clone(),
            now: now_millis(),
        };
        match self.dispatcher.cluster_command(&command, &opts).await.map_err(RemoveGroupError::Fleet)? {
            FleetResponse::Done => Ok(()),
            FleetResponse::NotFound => Err(RemoveGroupError::NotFound(name)),
            other => Err(RemoveGroupError::Fleet(unexpected_response(&other))),
        }
    }

    /// Start the very first replica of the cluster group on this node and
    /// seed the replicated state with the cluster group's own row.
    async fn found_cluster_group(&mut self) -> FleetResult<()> {
        let cluster = self.config.cluster_group.clone();
        let machine = Box::new(ClusterMachine::new(cluster.clone()));
        let spec = self.replica_spec(&cluster, Vec::new(), StartMode::Initial);
        let replica = match self.engine.start_replica(spec, machine).await {
            Ok(replica) => replica,
            Err(err) => return Err(FleetError::Engine(anyhow::Error::new(err))),
        };
        self.registry.insert(cluster.clone(), replica.clone());
        self.dispatcher.cache().set(&cluster, replica);

        let opts = self.call_options();
        let add = FleetCommand::AddGroup {
            name: cluster.clone(),
            n_replica: self.config.cluster_group_replicas,
            rv_config: Vec::new(),
            leader_hint: Some(self.id),
        };
        // AlreadyAdded here means this node rejoined an existing cluster
        // whose state survived in the engine; both responses are fine.
        self.dispatcher.cluster_command(&add, &opts).await?;
        let up = FleetCommand::ReportMemberUp {
            name: cluster.clone(),
            node: self.id,
        };
        self.dispatcher.cluster_command(&up, &opts).await?;
        let lead = FleetCommand::ReportLeader {
            name: cluster,
            node: self.id,
        };
        self.dispatcher.cluster_command(&lead, &opts).await?;
        Ok(())
    }

    /// Re-resolve every leader cache entry. The refresher is opportunistic:
    /// failures leave entries alone rather than blocking.
    async fn refresh_cache_pass(&self) {
        for (group, current) in self.dispatcher.cache().entries() {
            if group == self.config.cluster_group {
                match self.network.probe_leader(current.node, &group).await {
                    Ok(Some(found)) => {
                        if found != current {
                            self.dispatcher.cache().set(&group, found);
                        }
                    }
                    Ok(None) | Err(_) => self.dispatcher.cache().unset(&group),
                }
                continue;
            }
            let mut opts = self.call_options();
            opts.retry = 0;
            let query = FleetQuery::LeaderHint { name: group.clone() };
            match self.dispatcher.cluster_query(&query, &opts).await {
                Ok(FleetResponse::Leader(Some(node))) => {
                    if node != current.node {
                        self.dispatcher.cache().set(&group, ReplicaRef { group: group.clone(), node });
                    }
                }
                Ok(FleetResponse::Leader(None)) | Ok(FleetResponse::NotFound) => {
                    self.dispatcher.cache().unset(&group);
                }
                Ok(other) => {
                    tracing::warn!(group = %group, ?other, "unexpected response to leader hint query");
                }
                Err(err) => {
                    tracing::debug!(group = %group, error = %err, "leader cache refresh skipped");
                }
            }
        }
    }

    async fn shutdown_replicas(&mut self) {
        let hosted: Vec<GroupName> = self.registry.keys().cloned().collect();
        for group in hosted {
            if let Err(err) = self.engine.stop_replica(&group).await {
                tracing::warn!(group = %group, error = %err, "failed to stop replica during shutdown");
            }
        }
        self.registry.clear();
    }

    fn call_options(&self) -> CallOptions {
        CallOptions::from_config(&self.config)
    }

    /// The worst-case latency of one fully retried call, used as the
    /// deadline of nested RPCs.
    fn rpc_budget(&self) -> Duration {
        let retries = u64::from(self.config.rpc_retry);
        Duration::from_millis(self.config.rpc_timeout * (retries + 1) + self.config.rpc_retry_interval * retries)
    }

    fn replica_spec(&self, group: &str, rv_config: Vec<u8>, mode: StartMode) -> ReplicaSpec {
        ReplicaSpec {
            group: group.to_string(),
            rv_config,
            persistence_dir: self.config.persistence_dir_parent.as_ref().map(|parent| parent.join(group)),
            mode,
        }
    }

    fn user_machine(&self, group: &str) -> Box<dyn ReplicatedMachine> {
        if group == self.config.cluster_group {
            Box::new(ClusterMachine::new(self.config.cluster_group.clone()))
        } else {
            self.machines.create(group)
        }
    }

    fn report_metrics(&self) {
        let metrics = FleetMetrics {
            id: self.id,
            active_zone: self.active_zone.clone(),
            hosted: self.registry.keys().cloned().collect(),
            cluster_leader: self.dispatcher.cache().get(&self.config.cluster_group).map(|r| r.node),
            balancing_rounds: self.balancing_rounds,
        };
        if let Err(err) = self.tx_metrics.send(metrics) {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }
}

/// A response variant the caller had no branch for; points at a version
/// skew between proposer and applier.
fn unexpected_response(response: &FleetResponse) -> FleetError {
    FleetError::Engine(anyhow::anyhow!("unexpected cluster state response: {:?}", response))
}
