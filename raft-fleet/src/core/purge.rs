//! The unhealthy-node purge controller.
//!
//! Runs on whichever node currently leads the cluster group; everyone else
//! skips the tick. Each round probes every active node, updates the
//! replicated failure records, and purges nodes that have stayed unhealthy
//! for the configured window. Managers observe the purge through their
//! next snapshot and rebalance the orphaned placements naturally.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::engine::FleetNetwork;
use crate::engine::RaftEngine;
use crate::engine::ReplicaRole;
use crate::now_millis;
use crate::state::FleetCommand;
use crate::state::FleetQuery;
use crate::state::FleetResponse;
use crate::GroupName;
use crate::NodeId;

use super::FleetCore;

impl<E: RaftEngine, N: FleetNetwork> FleetCore<E, N> {
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn purge_pass(&mut self) {
        match self.engine.status(&self.config.cluster_group).await {
            Some(status) if status.role == ReplicaRole::Leader => {}
            _ => return,
        }
        let opts = self.call_options();
        let snapshot = match self.dispatcher.cluster_query(&FleetQuery::Snapshot, &opts).await {
            Ok(FleetResponse::Snapshot(snapshot)) => snapshot,
            Ok(other) => {
                tracing::warn!(?other, "unexpected response to snapshot query, skipping purge pass");
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "cluster group unreachable, skipping purge pass");
                return;
            }
        };
        let now = now_millis();
        let threshold = self.config.node_purge_threshold_failing_members;

        // Which groups believe each node hosts one of their replicas.
        let mut replicas_of: BTreeMap<NodeId, Vec<GroupName>> = BTreeMap::new();
        for (name, record) in &snapshot.groups {
            for node in &record.members {
                replicas_of.entry(*node).or_insert_with(Vec::new).push(name.clone());
            }
        }
        let zoned: BTreeSet<NodeId> = snapshot.nodes_per_zone.values().flatten().copied().collect();

        for node in &zoned {
            let node = *node;
            if node == self.id {
                continue;
            }
            let replicas = replicas_of.get(&node).cloned().unwrap_or_default();
            let failing = if self.network.ping(node).await.is_ok() {
                let mut count = 0u32;
                for group in &replicas {
                    if self.network.probe_replica(node, group).await.is_err() {
                        count += 1;
                    }
                }
                count
            } else {
                // A disconnected node counts as failing wholesale, replicas
                // or not.
                (replicas.len() as u32).max(threshold.saturating_add(1))
            };

            if failing > threshold {
                tracing::warn!(node, failing, "node is unhealthy");
                let record = FleetCommand::RecordNodeFailure {
                    node,
                    failing_members: failing,
                    now,
                };
                if let Err(err) = self.dispatcher.cluster_command(&record, &opts).await {
                    tracing::warn!(node, error = %err, "failed to record node failure");
                }
            } else if snapshot.node_failures.contains_key(&node) {
                tracing::info!(node, "node recovered, clearing its failure record");
                let clear = FleetCommand::ClearNodeFailure { node };
                if let Err(err) = self.dispatcher.cluster_command(&clear, &opts).await {
                    tracing::warn!(node, error = %err, "failed to clear node failure");
                }
            }
        }

        // Purge nodes that stayed unhealthy for the whole window.
        for (node, record) in &snapshot.node_failures {
            if now.saturating_sub(record.first_failure_at) >= self.config.node_purge_failure_time_window {
                tracing::warn!(node = *node, "purging node after sustained failure");
                let purge = FleetCommand::PurgeNode { node: *node };
                if let Err(err) = self.dispatcher.cluster_command(&purge, &opts).await {
                    tracing::warn!(node = *node, error = %err, "failed to purge node");
                }
            }
        }

        // Member entries pointing outside every zone belong to nodes that
        // deactivated or vanished; purge them right away.
        for node in replicas_of.keys() {
            if !zoned.contains(node) {
                let purge = FleetCommand::PurgeNode { node: *node };
                if let Err(err) = self.dispatcher.cluster_command(&purge, &opts).await {
                    tracing::warn!(node = *node, error = %err, "failed to purge unzoned member");
                }
            }
        }

        let expire = FleetCommand::ExpireTombstones {
            now,
            ttl: self.config.tombstone_ttl,
        };
        if let Err(err) = self.dispatcher.cluster_command(&expire, &opts).await {
            tracing::debug!(error = %err, "failed to expire tombstones");
        }
    }
}
