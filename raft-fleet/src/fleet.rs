//! Public fleet interface and data types.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::cache::LeaderCache;
use crate::config::Config;
use crate::core::FleetCore;
use crate::dispatch::CallOptions;
use crate::dispatch::Dispatcher;
use crate::engine::BootstrapOutcome;
use crate::engine::BootstrapRequest;
use crate::engine::FleetNetwork;
use crate::engine::MachineFactory;
use crate::engine::RaftEngine;
use crate::error::ActivateError;
use crate::error::AddGroupError;
use crate::error::DeactivateError;
use crate::error::FleetError;
use crate::error::FleetResult;
use crate::error::RemoveGroupError;
use crate::metrics::FleetMetrics;
use crate::metrics::Wait;
use crate::state::FleetQuery;
use crate::state::FleetResponse;
use crate::GroupName;
use crate::NodeId;
use crate::ZoneId;

struct FleetInner<E: RaftEngine, N: FleetNetwork> {
    tx_api: mpsc::UnboundedSender<(FleetMsg, Span)>,
    rx_metrics: watch::Receiver<FleetMetrics>,
    core_handle: Mutex<Option<JoinHandle<FleetResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    dispatcher: Arc<Dispatcher<E, N>>,
    config: Arc<Config>,
}

/// A node's handle onto the fleet.
///
/// One `Fleet` is created per node and wraps the node's manager task, the
/// leader cache, and the routing layer. The handle implements `Clone` and
/// should be cloned liberally; clones are cheap and share everything.
///
/// Commands and queries against consensus groups go straight through the
/// routing layer; operations that touch this node's activation state or
/// replica registry are serialized through the manager task.
pub struct Fleet<E: RaftEngine, N: FleetNetwork> {
    inner: Arc<FleetInner<E, N>>,
}

impl<E: RaftEngine, N: FleetNetwork> Fleet<E, N> {
    /// Create and spawn a new fleet node.
    ///
    /// ### `id`
    /// The stable ID of this node within the cluster. Restarts of the node
    /// must present the same ID.
    ///
    /// ### `engine`
    /// The external Raft engine hosting this node's replicas.
    ///
    /// ### `network`
    /// The inter-node control plane used for leader probes, bootstrap
    /// delegation and health checks.
    ///
    /// ### `machines`
    /// Builds the replicated state machine of each user group; the fleet
    /// itself never looks inside them.
    #[tracing::instrument(level="trace", skip(config, engine, network, machines), fields(cluster=%config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        engine: Arc<E>,
        network: Arc<N>,
        machines: Arc<dyn MachineFactory>,
    ) -> Self {
        let cache = Arc::new(LeaderCache::default());
        let dispatcher = Arc::new(Dispatcher::new(id, config.clone(), engine.clone(), network.clone(), cache));
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(FleetMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = FleetCore::spawn(
            id,
            config.clone(),
            engine,
            network,
            dispatcher.clone(),
            machines,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = FleetInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            dispatcher,
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Mark this node active in `zone` and start hosting replicas.
    ///
    /// Call after the node is connected to the cluster. The first node to
    /// activate founds the cluster group.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn activate(&self, zone: ZoneId) -> Result<(), ActivateError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((FleetMsg::Activate { zone, tx }, span))
            .map_err(|_| ActivateError::Fleet(FleetError::ShuttingDown))?;

        rx.await.map_err(|_| ActivateError::Fleet(FleetError::ShuttingDown)).and_then(|res| res)
    }

    /// Withdraw this node from the cluster.
    ///
    /// Replicated state loses the node immediately; replicas still running
    /// here are handed over by the balancing loop.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn deactivate(&self) -> Result<(), DeactivateError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((FleetMsg::Deactivate { tx }, span))
            .map_err(|_| DeactivateError::Fleet(FleetError::ShuttingDown))?;

        rx.await.map_err(|_| DeactivateError::Fleet(FleetError::ShuttingDown)).and_then(|res| res)
    }

    /// Register a new consensus group and bootstrap its first replica.
    #[tracing::instrument(level = "debug", skip(self, rv_config))]
    pub async fn add_consensus_group(
        &self,
        name: GroupName,
        n_replica: u8,
        rv_config: Vec<u8>,
    ) -> Result<(), AddGroupError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((
                FleetMsg::AddGroup {
                    name,
                    n_replica,
                    rv_config,
                    tx,
                },
                span,
            ))
            .map_err(|_| AddGroupError::Fleet(FleetError::ShuttingDown))?;

        rx.await.map_err(|_| AddGroupError::Fleet(FleetError::ShuttingDown)).and_then(|res| res)
    }

    /// Remove a consensus group. Managers stop its replicas on their next
    /// balancing pass; the name stays tombstoned for a while.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_consensus_group(&self, name: GroupName) -> Result<(), RemoveGroupError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((FleetMsg::RemoveGroup { name, tx }, span))
            .map_err(|_| RemoveGroupError::Fleet(FleetError::ShuttingDown))?;

        rx.await.map_err(|_| RemoveGroupError::Fleet(FleetError::ShuttingDown)).and_then(|res| res)
    }

    /// Serve a bootstrap request from a peer.
    ///
    /// Transport implementations route incoming
    /// [`FleetNetwork::bootstrap_group`] RPCs here.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn bootstrap_group(&self, req: BootstrapRequest) -> FleetResult<BootstrapOutcome> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((FleetMsg::Bootstrap { req, tx }, span))
            .map_err(|_| FleetError::ShuttingDown)?;

        rx.await.map_err(|_| FleetError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a command to a consensus group with the configured defaults.
    pub async fn command(&self, group: &str, arg: &[u8]) -> FleetResult<Vec<u8>> {
        self.command_with(group, arg, self.inner.dispatcher.default_options()).await
    }

    /// Submit a command with explicit timeout/retry options.
    #[tracing::instrument(level = "debug", skip(self, arg, opts))]
    pub async fn command_with(&self, group: &str, arg: &[u8], opts: CallOptions) -> FleetResult<Vec<u8>> {
        self.inner.dispatcher.command(group, arg, &opts).await
    }

    /// Submit a linearizable query to a consensus group with the
    /// configured defaults.
    pub async fn query(&self, group: &str, arg: &[u8]) -> FleetResult<Vec<u8>> {
        self.query_with(group, arg, self.inner.dispatcher.default_options()).await
    }

    /// Submit a linearizable query with explicit timeout/retry options.
    #[tracing::instrument(level = "debug", skip(self, arg, opts))]
    pub async fn query_with(&self, group: &str, arg: &[u8], opts: CallOptions) -> FleetResult<Vec<u8>> {
        self.inner.dispatcher.query(group, arg, &opts).await
    }

    /// The zone map of currently active nodes.
    pub async fn active_nodes(&self) -> FleetResult<BTreeMap<ZoneId, Vec<NodeId>>> {
        let opts = self.inner.dispatcher.default_options();
        match self.inner.dispatcher.cluster_query(&FleetQuery::ActiveNodes, &opts).await? {
            FleetResponse::Nodes(nodes) => Ok(nodes),
            other => Err(FleetError::Engine(anyhow::anyhow!("unexpected cluster state response: {:?}", other))),
        }
    }

    /// Registered user groups and their replica counts.
    pub async fn consensus_groups(&self) -> FleetResult<BTreeMap<GroupName, u8>> {
        let opts = self.inner.dispatcher.default_options();
        match self.inner.dispatcher.cluster_query(&FleetQuery::ConsensusGroups, &opts).await? {
            FleetResponse::Groups(groups) => Ok(groups),
            other => Err(FleetError::Engine(anyhow::anyhow!("unexpected cluster state response: {:?}", other))),
        }
    }

    /// The node currently believed to lead `group`, if any.
    ///
    /// Based on the replicated leader hint plus a live probe fallback; a
    /// caller must still be prepared for the answer to be stale by the
    /// time it acts on it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn whereis_leader(&self, group: &str) -> Option<NodeId> {
        if group == self.inner.config.cluster_group {
            return self.inner.dispatcher.locate_cluster_leader().await.map(|replica| replica.node);
        }
        let opts = self.inner.dispatcher.default_options();
        let query = FleetQuery::LeaderHint { name: group.to_string() };
        match self.inner.dispatcher.cluster_query(&query, &opts).await {
            Ok(FleetResponse::Leader(Some(node))) => Some(node),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(group, error = %err, "leader lookup failed");
                None
            }
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<FleetMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this fleet node, stopping its local replicas.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<E: RaftEngine, N: FleetNetwork> Clone for Fleet<E, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ActivateResponseTx = oneshot::Sender<Result<(), ActivateError>>;
pub(crate) type DeactivateResponseTx = oneshot::Sender<Result<(), DeactivateError>>;
pub(crate) type AddGroupResponseTx = oneshot::Sender<Result<(), AddGroupError>>;
pub(crate) type RemoveGroupResponseTx = oneshot::Sender<Result<(), RemoveGroupError>>;
pub(crate) type BootstrapResponseTx = oneshot::Sender<FleetResult<BootstrapOutcome>>;

/// A message coming from the fleet API.
pub(crate) enum FleetMsg {
    Activate {
        zone: ZoneId,
        tx: ActivateResponseTx,
    },
    Deactivate {
        tx: DeactivateResponseTx,
    },
    AddGroup {
        name: GroupName,
        n_replica: u8,
        rv_config: Vec<u8>,
        tx: AddGroupResponseTx,
    },
    RemoveGroup {
        name: GroupName,
        tx: RemoveGroupResponseTx,
    },
    Bootstrap {
        req: BootstrapRequest,
        tx: BootstrapResponseTx,
    },
}
