//! Registration and first-replica bootstrap of new consensus groups.
//!
//! Registering a group is two linearized steps: commit `AddGroup` against
//! the cluster state, then get the first replica running so the group has
//! a leader to elect. The second step is the cluster-group leader's job;
//! when a persistence directory is configured the leader may instead
//! delegate to the node the group's data is placed on. If bootstrap fails
//! the registration is rolled back before the error surfaces, so callers
//! never observe a group that exists on paper only.

use anyhow::anyhow;

use crate::engine::BootstrapOutcome;
use crate::engine::BootstrapRequest;
use crate::engine::FleetNetwork;
use crate::engine::RaftEngine;
use crate::engine::StartMode;
use crate::error::AddGroupError;
use crate::error::EngineError;
use crate::error::FleetError;
use crate::error::FleetResult;
use crate::now_millis;
use crate::placement::lrw_members;
use crate::state::FleetCommand;
use crate::state::FleetQuery;
use crate::state::FleetResponse;
use crate::GroupName;

use super::unexpected_response;
use super::FleetCore;

impl<E: RaftEngine, N: FleetNetwork> FleetCore<E, N> {
    #[tracing::instrument(level = "debug", skip(self, rv_config))]
    pub(super) async fn handle_add_group(
        &mut self,
        name: GroupName,
        n_replica: u8,
        rv_config: Vec<u8>,
    ) -> Result<(), AddGroupError> {
        if name == self.config.cluster_group {
            return Err(AddGroupError::Reserved(name));
        }
        if n_replica == 0 {
            return Err(AddGroupError::InvalidReplicaCount);
        }
        let opts = self.call_options();
        let command = FleetCommand::AddGroup {
            name: name.clone(),
            n_replica,
            rv_config,
            leader_hint: None,
        };
        match self.dispatcher.cluster_command(&command, &opts).await.map_err(AddGroupError::Fleet)? {
            FleetResponse::Done => {}
            FleetResponse::AlreadyAdded => return Err(AddGroupError::AlreadyAdded(name)),
            other => return Err(AddGroupError::Fleet(unexpected_response(&other))),
        }

        match self.bootstrap_first_replica(&name).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Compensating action: withdraw the registration so a
                // failed add leaves no group behind. If the rollback
                // itself fails the original error still wins.
                let rollback = FleetCommand::RemoveGroup {
                    name: name.clone(),
                    now: now_millis(),
                };
                if let Err(rollback_err) = self.dispatcher.cluster_command(&rollback, &opts).await {
                    tracing::error!(group = %name, error = %rollback_err, "rollback of add_consensus_group failed");
                }
                Err(err)
            }
        }
    }

    /// Route the first-replica bootstrap through the cluster-group leader.
    async fn bootstrap_first_replica(&mut self, name: &GroupName) -> Result<(), AddGroupError> {
        let leader = self
            .dispatcher
            .locate_cluster_leader()
            .await
            .ok_or_else(|| FleetError::NoLeader(self.config.cluster_group.clone()))?;
        let req = BootstrapRequest { group: name.clone() };
        let outcome = if leader.node == self.id {
            self.serve_bootstrap(req).await.map_err(AddGroupError::Fleet)?
        } else {
            let deadline = self.rpc_budget();
            match tokio::time::timeout(deadline, self.network.bootstrap_group(leader.node, req)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    return Err(AddGroupError::Fleet(FleetError::Engine(anyhow!(
                        "bootstrap rpc to node {} failed: {}",
                        leader.node,
                        err
                    ))))
                }
                Err(_) => {
                    return Err(AddGroupError::Fleet(FleetError::Engine(anyhow!(
                        "bootstrap rpc to node {} timed out",
                        leader.node
                    ))))
                }
            }
        };
        match outcome {
            BootstrapOutcome::LeaderStarted => Ok(()),
            BootstrapOutcome::LeaderDelegatedTo(node) => {
                tracing::debug!(group = %name, node, "first replica started by delegation");
                Ok(())
            }
            BootstrapOutcome::ProcessExists => Err(AddGroupError::ProcessExists(name.clone())),
        }
    }

    /// Serve a bootstrap request on this node.
    ///
    /// Runs on the cluster-group leader, or on the node a leader delegated
    /// to. Without persistence the leader starts the first replica right
    /// here; with persistence configured the replica must come up where
    /// the group's data directory is placed, which is the placement head.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn serve_bootstrap(&mut self, req: BootstrapRequest) -> FleetResult<BootstrapOutcome> {
        let opts = self.call_options();
        let snapshot = match self.dispatcher.cluster_query(&FleetQuery::Snapshot, &opts).await? {
            FleetResponse::Snapshot(snapshot) => snapshot,
            other => return Err(unexpected_response(&other)),
        };
        let record = snapshot
            .groups
            .get(&req.group)
            .cloned()
            .ok_or_else(|| FleetError::Engine(anyhow!("consensus group '{}' is not registered", req.group)))?;

        let target = match self.config.persistence_dir_parent {
            Some(_) => {
                let placement = lrw_members(&snapshot.nodes_per_zone, &req.group, usize::from(record.n_replica));
                placement.first().copied().unwrap_or(self.id)
            }
            None => self.id,
        };

        if target == self.id {
            let spec = self.replica_spec(&req.group, record.rv_config, StartMode::Initial);
            let machine = self.user_machine(&req.group);
            match self.engine.start_replica(spec, machine).await {
                Ok(replica) => {
                    self.registry.insert(req.group.clone(), replica);
                    let up = FleetCommand::ReportMemberUp {
                        name: req.group.clone(),
                        node: self.id,
                    };
                    self.dispatcher.cluster_command(&up, &opts).await?;
                    let lead = FleetCommand::ReportLeader {
                        name: req.group.clone(),
                        node: self.id,
                    };
                    self.dispatcher.cluster_command(&lead, &opts).await?;
                    Ok(BootstrapOutcome::LeaderStarted)
                }
                Err(EngineError::ProcessExists(_)) => Ok(BootstrapOutcome::ProcessExists),
                Err(EngineError::Other(err)) => Err(FleetError::Engine(err)),
            }
        } else {
            let deadline = self.rpc_budget();
            match tokio::time::timeout(deadline, self.network.bootstrap_group(target, req)).await {
                Ok(Ok(BootstrapOutcome::ProcessExists)) => Ok(BootstrapOutcome::ProcessExists),
                Ok(Ok(_)) => Ok(BootstrapOutcome::LeaderDelegatedTo(target)),
                Ok(Err(err)) => Err(FleetError::Engine(anyhow!("bootstrap delegation to node {} failed: {}", target, err))),
                Err(_) => Err(FleetError::Engine(anyhow!("bootstrap delegation to node {} timed out", target))),
            }
        }
    }
}
