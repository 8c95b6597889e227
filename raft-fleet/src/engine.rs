//! Interfaces to the external Raft engine and the inter-node transport.
//!
//! The log replication and election machinery is deliberately a black box:
//! this crate only asks an engine to start and stop replicas and to submit
//! commands and queries against them. Likewise the inter-node control
//! plane (leader probes, bootstrap delegation, connectivity checks) is a
//! trait so that tests can run a whole fleet inside one process.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;
use crate::error::RpcError;
use crate::CommandRef;
use crate::GroupName;
use crate::NodeId;

/// A handle to a running replica.
///
/// The identity that matters is the (group, node) pair; an engine never
/// runs two replicas of the same group on one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRef {
    /// The consensus group this replica belongs to.
    pub group: GroupName,
    /// The node the replica runs on.
    pub node: NodeId,
}

/// The Raft role a replica currently plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Candidate,
}

/// A point-in-time status report of a local replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub role: ReplicaRole,
    /// Index of the last log entry applied to the replica's state machine.
    pub last_applied: u64,
}

/// Whether a new replica forms a pristine group or joins an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// The first replica of the group; it elects itself.
    Initial,
    /// An additional replica; it syncs from the current members.
    Join,
}

/// Everything an engine needs to start one replica.
#[derive(Clone, Debug)]
pub struct ReplicaSpec {
    pub group: GroupName,
    /// Opaque engine configuration (election timeout, heartbeat period,
    /// snapshot cadence); forwarded verbatim.
    pub rv_config: Vec<u8>,
    /// Where the replica persists its log and snapshots, when persistence
    /// is configured.
    pub persistence_dir: Option<PathBuf>,
    pub mode: StartMode,
}

/// The state machine replicated inside one consensus group.
///
/// The engine linearizes calls: `apply` runs on exactly one thread per
/// replica, in log order.
pub trait ReplicatedMachine: Send + 'static {
    /// Apply a committed command and produce its response.
    fn apply(&mut self, arg: &[u8]) -> Vec<u8>;

    /// Answer a linearizable read.
    fn query(&self, arg: &[u8]) -> Vec<u8>;
}

/// Builds the state machines hosted inside user groups.
///
/// The fleet treats the replicated value of a user group as opaque; this
/// factory is how the embedding application injects its machine per group.
pub trait MachineFactory: Send + Sync + 'static {
    fn create(&self, group: &str) -> Box<dyn ReplicatedMachine>;
}

/// The external Raft engine.
///
/// One instance exists per node. Targets of `command` and `query` may be
/// replicas on other nodes; the engine owns that transport.
#[async_trait]
pub trait RaftEngine: Send + Sync + 'static {
    /// Start a replica of `spec.group` on this node, hosting `machine`.
    async fn start_replica(
        &self,
        spec: ReplicaSpec,
        machine: Box<dyn ReplicatedMachine>,
    ) -> Result<ReplicaRef, EngineError>;

    /// Stop the local replica of `group`. Stopping a group with no local
    /// replica is not an error.
    async fn stop_replica(&self, group: &str) -> Result<(), EngineError>;

    /// Submit a command to `target`, to be applied once.
    ///
    /// `reference` makes the submission idempotent: resubmitting with the
    /// same reference must return the recorded response without applying
    /// the command again.
    async fn command(
        &self,
        target: &ReplicaRef,
        arg: &[u8],
        reference: CommandRef,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError>;

    /// Submit a linearizable read to `target`.
    async fn query(&self, target: &ReplicaRef, arg: &[u8], timeout: Duration) -> Result<Vec<u8>, RpcError>;

    /// Report the status of the local replica of `group`, if one runs here.
    async fn status(&self, group: &str) -> Option<ReplicaStatus>;
}

/// A request to start the first replica of a freshly registered group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub group: GroupName,
}

/// The reply to a [`BootstrapRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BootstrapOutcome {
    /// The cluster-group leader started the first replica itself.
    LeaderStarted,
    /// The leader handed bootstrap over to the placement head.
    LeaderDelegatedTo(NodeId),
    /// A replica process for the group already exists on the bootstrap
    /// node; the caller must roll the registration back.
    ProcessExists,
}

/// The inter-node control plane.
///
/// Every RPC names its target node; the (node, group) pair is resolved to
/// a concrete endpoint by the transport, the way registered process names
/// are resolved on remote VMs.
#[async_trait]
pub trait FleetNetwork: Send + Sync + 'static {
    /// The nodes currently connected to this one, excluding itself.
    async fn peers(&self) -> Vec<NodeId>;

    /// Ask `target` who leads `group`, according to its local replica.
    async fn probe_leader(&self, target: NodeId, group: &str) -> Result<Option<ReplicaRef>, RpcError>;

    /// Ask `target` to bootstrap the first replica of a new group.
    async fn bootstrap_group(&self, target: NodeId, req: BootstrapRequest) -> Result<BootstrapOutcome, RpcError>;

    /// Test connectivity to `target`, attempting a reconnect on failure.
    async fn ping(&self, target: NodeId) -> Result<(), RpcError>;

    /// Probe the responsiveness of the replica of `group` on `target`.
    async fn probe_replica(&self, target: NodeId, group: &str) -> Result<(), RpcError>;
}
