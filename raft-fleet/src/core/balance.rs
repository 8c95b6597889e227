//! The periodic reconciliation pass.
//!
//! Each tick diffs the replicated placement decisions against the replicas
//! actually running on this node, then starts and stops local replicas to
//! close the gap. Stopping is conservative: while the cluster still has
//! enough active nodes for a full replica set, a surplus replica is only
//! wound down once the replacement placement has reported in, so a group
//! never drops below quorum because two Managers moved at once.

use crate::engine::FleetNetwork;
use crate::engine::RaftEngine;
use crate::engine::ReplicaRef;
use crate::engine::ReplicaRole;
use crate::engine::StartMode;
use crate::error::EngineError;
use crate::placement::lrw_members;
use crate::state::ClusterState;
use crate::state::FleetCommand;
use crate::state::FleetQuery;
use crate::state::FleetResponse;
use crate::state::GroupRecord;
use crate::GroupName;
use crate::NodeId;

use super::FleetCore;

impl<E: RaftEngine, N: FleetNetwork> FleetCore<E, N> {
    /// One reconciliation pass; a no-op for a node that is inactive and
    /// hosts nothing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn balancing_pass(&mut self) {
        if self.active_zone.is_none() && self.registry.is_empty() {
            return;
        }
        let opts = self.call_options();
        let snapshot = match self.dispatcher.cluster_query(&FleetQuery::Snapshot, &opts).await {
            Ok(FleetResponse::Snapshot(snapshot)) => snapshot,
            Ok(other) => {
                tracing::warn!(?other, "unexpected response to snapshot query, skipping balancing pass");
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "cluster group unreachable, skipping balancing pass");
                return;
            }
        };

        // A node that believes itself active but is gone from every zone
        // was purged while it was away.
        if self.active_zone.is_some() {
            let zoned = snapshot.nodes_per_zone.values().any(|nodes| nodes.contains(&self.id));
            if !zoned {
                tracing::warn!("this node was purged from the cluster, marking it inactive");
                self.active_zone = None;
            }
        }

        self.stop_orphans(&snapshot).await;
        self.reconcile_groups(&snapshot).await;
        self.refresh_leader_reports(&snapshot).await;
        self.balancing_rounds += 1;
    }

    /// Stop replicas of groups that no longer exist in the cluster state.
    async fn stop_orphans(&mut self, snapshot: &ClusterState) {
        let orphans: Vec<GroupName> =
            self.registry.keys().filter(|group| !snapshot.groups.contains_key(*group)).cloned().collect();
        for group in orphans {
            tracing::info!(group = %group, "group was removed, stopping local replica");
            self.stop_local_replica(&group).await;
        }
    }

    async fn reconcile_groups(&mut self, snapshot: &ClusterState) {
        let total_active: usize = snapshot.nodes_per_zone.values().map(|nodes| nodes.len()).sum();
        for (name, record) in &snapshot.groups {
            let desired = lrw_members(&snapshot.nodes_per_zone, name, usize::from(record.n_replica));
            let hosts_here = self.registry.contains_key(name);
            let wanted_here = desired.contains(&self.id);
            let member_here = record.members.contains(&self.id);
            if wanted_here && !hosts_here {
                self.start_local_replica(name, record).await;
            } else if !wanted_here && hosts_here {
                self.maybe_stop_local_replica(name, record, &desired, total_active).await;
            } else if wanted_here && !member_here {
                // An earlier up-report was swallowed while the member set
                // was full; repeat it until a slot frees.
                self.report_member_up(name).await;
            } else if !wanted_here && !hosts_here && member_here {
                // Stale membership left over from a crash or restart.
                self.report_member_down(name).await;
            }
        }
    }

    async fn start_local_replica(&mut self, name: &GroupName, record: &GroupRecord) {
        // A member set that died out entirely needs a fresh formation, not
        // a join against nobody.
        let mode = if record.members.is_empty() { StartMode::Initial } else { StartMode::Join };
        let spec = self.replica_spec(name, record.rv_config.clone(), mode);
        let machine = self.user_machine(name);
        let replica = match self.engine.start_replica(spec, machine).await {
            Ok(replica) => replica,
            Err(EngineError::ProcessExists(_)) => {
                // The engine kept a replica we lost track of; adopt it.
                ReplicaRef { group: name.clone(), node: self.id }
            }
            Err(err) => {
                tracing::warn!(group = %name, error = %err, "failed to start replica");
                return;
            }
        };
        tracing::info!(group = %name, mode = ?mode, "started local replica");
        self.registry.insert(name.clone(), replica);
        self.report_member_up(name).await;
    }

    async fn report_member_up(&mut self, name: &GroupName) {
        let opts = self.call_options();
        let up = FleetCommand::ReportMemberUp {
            name: name.clone(),
            node: self.id,
        };
        if let Err(err) = self.dispatcher.cluster_command(&up, &opts).await {
            tracing::warn!(group = %name, error = %err, "failed to report member up");
        }
    }

    async fn report_member_down(&mut self, name: &GroupName) {
        let opts = self.call_options();
        let down = FleetCommand::ReportMemberDown {
            name: name.clone(),
            node: self.id,
        };
        if let Err(err) = self.dispatcher.cluster_command(&down, &opts).await {
            tracing::warn!(group = %name, error = %err, "failed to report member down");
        }
    }

    async fn maybe_stop_local_replica(
        &mut self,
        name: &GroupName,
        record: &GroupRecord,
        desired: &[NodeId],
        total_active: usize,
    ) {
        if total_active >= usize::from(record.n_replica) {
            // The member set caps at n_replica, so a departing replica can
            // never wait for the whole new placement to report in: its own
            // entry occupies a slot. A quorum of replacements is enough to
            // hand over without dropping below majority.
            let replacements = desired
                .iter()
                .copied()
                .filter(|&node| node != self.id && record.members.contains(&node))
                .count();
            let quorum = usize::from(record.n_replica) / 2 + 1;
            if replacements < quorum.min(desired.len()) {
                tracing::debug!(group = %name, "deferring replica stop until the new placement has reported in");
                return;
            }
        }
        tracing::info!(group = %name, "placement moved away from this node, stopping local replica");
        self.stop_local_replica(name).await;
        self.report_member_down(name).await;
    }

    pub(super) async fn stop_local_replica(&mut self, name: &GroupName) {
        if let Err(err) = self.engine.stop_replica(name).await {
            tracing::warn!(group = %name, error = %err, "failed to stop replica");
        }
        self.registry.remove(name);
        // Our own cache entry may point at the replica we just stopped.
        if let Some(cached) = self.dispatcher.cache().get(name) {
            if cached.node == self.id {
                self.dispatcher.cache().unset(name);
            }
        }
    }

    /// Tell the cluster group about leaderships observed locally, so the
    /// replicated leader hints stay fresh after elections.
    async fn refresh_leader_reports(&mut self, snapshot: &ClusterState) {
        let opts = self.call_options();
        let hosted: Vec<GroupName> = self.registry.keys().cloned().collect();
        for name in hosted {
            let record = match snapshot.groups.get(&name) {
                Some(record) => record,
                None => continue,
            };
            let status = match self.engine.status(&name).await {
                Some(status) => status,
                None => continue,
            };
            if status.role == ReplicaRole::Leader && record.leader_node != Some(self.id) {
                let report = FleetCommand::ReportLeader {
                    name: name.clone(),
                    node: self.id,
                };
                if let Err(err) = self.dispatcher.cluster_command(&report, &opts).await {
                    tracing::debug!(group = %name, error = %err, "failed to report leadership");
                }
            }
        }
    }
}
