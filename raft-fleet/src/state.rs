//! The replicated state of the cluster group.
//!
//! Every mutation of the fleet's membership and placement policy is a
//! [`FleetCommand`] linearized by the cluster group's Raft log and applied
//! here. Commands are total, deterministic functions over the current
//! state: anything time-dependent carries the proposer's clock reading in
//! the command itself, and rejections are ordinary response values rather
//! than applier failures.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::engine::ReplicatedMachine;
use crate::placement::lrw_members;
use crate::GroupName;
use crate::NodeId;
use crate::ZoneId;

/// A registered consensus group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// The desired replica count, `1..=255`.
    pub n_replica: u8,
    /// Opaque configuration forwarded to the Raft engine when starting a
    /// replica of this group.
    pub rv_config: Vec<u8>,
    /// The last leader reported for this group. Always a member, or `None`.
    pub leader_node: Option<NodeId>,
    /// Nodes currently hosting a replica, as reported by their Managers.
    /// Never larger than `n_replica`.
    pub members: BTreeSet<NodeId>,
}

/// Health bookkeeping of one node, maintained by the purge controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// When the node was first observed failing, in proposer wall-clock
    /// milliseconds.
    pub first_failure_at: u64,
    /// How many of the node's replicas were unresponsive at the last probe.
    pub failing_members: u32,
}

/// The replicated cluster state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Active nodes, keyed by their availability zone. A node appears in at
    /// most one zone.
    pub nodes_per_zone: BTreeMap<ZoneId, BTreeSet<NodeId>>,
    /// All registered consensus groups, including the cluster group's own
    /// row.
    pub groups: BTreeMap<GroupName, GroupRecord>,
    /// Recently removed group names and their removal timestamps. Disjoint
    /// from `groups`; entries age out after a configured TTL.
    pub recently_removed: BTreeMap<GroupName, u64>,
    /// Nodes currently observed as failing.
    pub node_failures: BTreeMap<NodeId, FailureRecord>,
}

/// A command against the replicated cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FleetCommand {
    /// Add `node` to `zone`, moving it if it was active in another zone.
    Activate { node: NodeId, zone: ZoneId },
    /// Remove `node` from its zone and drop its failure record. Member
    /// sets are left alone; Managers rebalance afterwards.
    Deactivate { node: NodeId },
    /// Register a group. Consumes a tombstone of the same name if present.
    AddGroup {
        name: GroupName,
        n_replica: u8,
        rv_config: Vec<u8>,
        leader_hint: Option<NodeId>,
    },
    /// Move a group from the registry to the tombstone set.
    RemoveGroup { name: GroupName, now: u64 },
    /// A Manager started a replica of `name` on `node`.
    ReportMemberUp { name: GroupName, node: NodeId },
    /// A Manager stopped (or lost) the replica of `name` on `node`.
    ReportMemberDown { name: GroupName, node: NodeId },
    /// A Manager observed `node` leading `name`.
    ReportLeader { name: GroupName, node: NodeId },
    /// The purge controller observed `node` with unresponsive replicas.
    RecordNodeFailure { node: NodeId, failing_members: u32, now: u64 },
    /// The purge controller observed `node` healthy again.
    ClearNodeFailure { node: NodeId },
    /// Remove `node` from its zone and from every member set.
    PurgeNode { node: NodeId },
    /// Drop tombstones older than `ttl` at proposer time `now`.
    ExpireTombstones { now: u64, ttl: u64 },
}

/// A read-only query against the replicated cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FleetQuery {
    /// The zone map of active nodes.
    ActiveNodes,
    /// Registered user groups and their replica counts.
    ConsensusGroups,
    /// Where replicas of `name` should currently be placed. Derived from
    /// the zone map, not stored.
    DesiredPlacement { name: GroupName },
    /// The last reported leader of `name`.
    LeaderHint { name: GroupName },
    /// The whole replicated state, for Manager reconciliation.
    Snapshot,
}

/// The response to a [`FleetCommand`] or [`FleetQuery`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FleetResponse {
    /// The command was applied.
    Done,
    /// `AddGroup` hit a live group of the same name.
    AlreadyAdded,
    /// The named group is not registered.
    NotFound,
    /// Reply to `ActiveNodes`.
    Nodes(BTreeMap<ZoneId, Vec<NodeId>>),
    /// Reply to `ConsensusGroups`.
    Groups(BTreeMap<GroupName, u8>),
    /// Reply to `DesiredPlacement`.
    Placement(Vec<NodeId>),
    /// Reply to `LeaderHint`.
    Leader(Option<NodeId>),
    /// Reply to `Snapshot`.
    Snapshot(ClusterState),
    /// The applier received a payload it could not decode.
    Invalid,
}

impl ClusterState {
    /// Apply a command, returning its response.
    pub fn apply(&mut self, command: FleetCommand) -> FleetResponse {
        match command {
            FleetCommand::Activate { node, zone } => {
                self.drop_from_zones(node);
                self.nodes_per_zone.entry(zone).or_insert_with(BTreeSet::new).insert(node);
                FleetResponse::Done
            }
            FleetCommand::Deactivate { node } => {
                self.drop_from_zones(node);
                self.node_failures.remove(&node);
                FleetResponse::Done
            }
            FleetCommand::AddGroup {
                name,
                n_replica,
                rv_config,
                leader_hint,
            } => {
                if self.groups.contains_key(&name) {
                    return FleetResponse::AlreadyAdded;
                }
                self.recently_removed.remove(&name);
                self.groups.insert(name, GroupRecord {
                    n_replica,
                    rv_config,
                    leader_node: leader_hint,
                    members: BTreeSet::new(),
                });
                FleetResponse::Done
            }
            FleetCommand::RemoveGroup { name, now } => {
                if self.groups.remove(&name).is_none() {
                    return FleetResponse::NotFound;
                }
                self.recently_removed.insert(name, now);
                FleetResponse::Done
            }
            FleetCommand::ReportMemberUp { name, node } => {
                if let Some(group) = self.groups.get_mut(&name) {
                    if group.members.contains(&node) || group.members.len() < usize::from(group.n_replica) {
                        group.members.insert(node);
                    }
                }
                FleetResponse::Done
            }
            FleetCommand::ReportMemberDown { name, node } => {
                if let Some(group) = self.groups.get_mut(&name) {
                    group.members.remove(&node);
                    if group.leader_node == Some(node) {
                        group.leader_node = None;
                    }
                }
                FleetResponse::Done
            }
            FleetCommand::ReportLeader { name, node } => {
                if let Some(group) = self.groups.get_mut(&name) {
                    if group.members.contains(&node) {
                        group.leader_node = Some(node);
                    }
                }
                FleetResponse::Done
            }
            FleetCommand::RecordNodeFailure {
                node,
                failing_members,
                now,
            } => {
                let record = self.node_failures.entry(node).or_insert(FailureRecord {
                    first_failure_at: now,
                    failing_members,
                });
                record.failing_members = failing_members;
                FleetResponse::Done
            }
            FleetCommand::ClearNodeFailure { node } => {
                self.node_failures.remove(&node);
                FleetResponse::Done
            }
            FleetCommand::PurgeNode { node } => {
                self.drop_from_zones(node);
                for group in self.groups.values_mut() {
                    group.members.remove(&node);
                    if group.leader_node == Some(node) {
                        group.leader_node = None;
                    }
                }
                self.node_failures.remove(&node);
                FleetResponse::Done
            }
            FleetCommand::ExpireTombstones { now, ttl } => {
                self.recently_removed.retain(|_, removed_at| now.saturating_sub(*removed_at) < ttl);
                FleetResponse::Done
            }
        }
    }

    /// Answer a query. `reserved` is the cluster group's own name, hidden
    /// from the user-facing group listing.
    pub fn answer(&self, query: &FleetQuery, reserved: &str) -> FleetResponse {
        match query {
            FleetQuery::ActiveNodes => FleetResponse::Nodes(
                self.nodes_per_zone
                    .iter()
                    .map(|(zone, nodes)| (zone.clone(), nodes.iter().copied().collect()))
                    .collect(),
            ),
            FleetQuery::ConsensusGroups => FleetResponse::Groups(
                self.groups
                    .iter()
                    .filter(|(name, _)| name.as_str() != reserved)
                    .map(|(name, group)| (name.clone(), group.n_replica))
                    .collect(),
            ),
            FleetQuery::DesiredPlacement { name } => match self.groups.get(name) {
                Some(group) => FleetResponse::Placement(lrw_members(
                    &self.nodes_per_zone,
                    name,
                    usize::from(group.n_replica),
                )),
                None => FleetResponse::NotFound,
            },
            FleetQuery::LeaderHint { name } => match self.groups.get(name) {
                Some(group) => FleetResponse::Leader(group.leader_node),
                None => FleetResponse::NotFound,
            },
            FleetQuery::Snapshot => FleetResponse::Snapshot(self.clone()),
        }
    }

    fn drop_from_zones(&mut self, node: NodeId) {
        for nodes in self.nodes_per_zone.values_mut() {
            nodes.remove(&node);
        }
        self.nodes_per_zone.retain(|_, nodes| !nodes.is_empty());
    }
}

/// Adapter exposing [`ClusterState`] through the engine's byte-oriented
/// applier interface. Hosted by the cluster group's replicas.
pub struct ClusterMachine {
    state: ClusterState,
    reserved: GroupName,
}

impl ClusterMachine {
    /// Create an empty machine. `reserved` is the cluster group's own name.
    pub fn new(reserved: GroupName) -> Self {
        Self {
            state: ClusterState::default(),
            reserved,
        }
    }

    /// The current state, for engine-side snapshotting.
    pub fn state(&self) -> &ClusterState {
        &self.state
    }
}

impl ReplicatedMachine for ClusterMachine {
    fn apply(&mut self, arg: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<FleetCommand>(arg) {
            Ok(command) => self.state.apply(command),
            Err(err) => {
                tracing::error!(error=%err, "undecodable command reached the cluster state applier");
                FleetResponse::Invalid
            }
        };
        serde_json::to_vec(&response).unwrap_or_default()
    }

    fn query(&self, arg: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<FleetQuery>(arg) {
            Ok(query) => self.state.answer(&query, &self.reserved),
            Err(err) => {
                tracing::error!(error=%err, "undecodable query reached the cluster state applier");
                FleetResponse::Invalid
            }
        };
        serde_json::to_vec(&response).unwrap_or_default()
    }
}
