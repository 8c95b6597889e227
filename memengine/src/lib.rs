//! An in-memory implementation of the `raft_fleet::RaftEngine` trait.
//!
//! A [`MemNet`] stands in for a whole cluster's worth of Raft machinery
//! inside one process: each group has a single shared state machine, a
//! single applier (the net's lock), and a deterministic leader, the
//! lowest-id member that is not isolated. Node isolation simulates
//! network partitions: RPCs between an isolated node and anyone else fail
//! with a transport fault, which is exactly what the fleet's retry and
//! purge logic need to see.
//!
//! Replica state survives `stop_replica`, the way a real engine's log and
//! snapshots survive a process stop, so a group restarted after losing all
//! of its members comes back with its data.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use raft_fleet::error::EngineError;
use raft_fleet::error::RpcError;
use raft_fleet::CommandRef;
use raft_fleet::GroupName;
use raft_fleet::MachineFactory;
use raft_fleet::NodeId;
use raft_fleet::RaftEngine;
use raft_fleet::ReplicaRef;
use raft_fleet::ReplicaRole;
use raft_fleet::ReplicaSpec;
use raft_fleet::ReplicaStatus;
use raft_fleet::ReplicatedMachine;

/// The replicated state of one in-memory consensus group.
struct GroupShared {
    /// Nodes currently registered as replicas.
    members: BTreeSet<NodeId>,
    /// The group's single shared state machine.
    machine: Box<dyn ReplicatedMachine>,
    /// Responses of already-applied commands, keyed by their idempotency
    /// reference.
    applied: HashMap<CommandRef, Vec<u8>>,
    /// Applied log length.
    last_applied: u64,
}

struct NetInner {
    groups: BTreeMap<GroupName, GroupShared>,
    isolated: BTreeSet<NodeId>,
}

/// The process-shared substrate behind every [`MemEngine`].
pub struct MemNet {
    inner: Mutex<NetInner>,
}

impl Default for MemNet {
    fn default() -> Self {
        Self {
            inner: Mutex::new(NetInner {
                groups: BTreeMap::new(),
                isolated: BTreeSet::new(),
            }),
        }
    }
}

impl MemNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cut `node` off from every other node.
    pub async fn isolate(&self, node: NodeId) {
        self.inner.lock().await.isolated.insert(node);
        tracing::info!(node, "isolated node");
    }

    /// Reconnect a previously isolated node.
    pub async fn restore(&self, node: NodeId) {
        self.inner.lock().await.isolated.remove(&node);
        tracing::info!(node, "restored node");
    }

    pub async fn is_isolated(&self, node: NodeId) -> bool {
        self.inner.lock().await.isolated.contains(&node)
    }

    /// Whether `node` currently runs a replica of `group`.
    pub async fn hosts(&self, node: NodeId, group: &str) -> bool {
        let guard = self.inner.lock().await;
        guard.groups.get(group).map(|shared| shared.members.contains(&node)).unwrap_or(false)
    }

    /// Answer a who-is-leader probe the way `target`'s local replica
    /// would: `None` when no replica runs there.
    pub async fn probe_leader(&self, target: NodeId, group: &str) -> Option<ReplicaRef> {
        let guard = self.inner.lock().await;
        let shared = guard.groups.get(group)?;
        if !shared.members.contains(&target) {
            return None;
        }
        elected(&shared.members, &guard.isolated).map(|node| ReplicaRef {
            group: group.to_string(),
            node,
        })
    }
}

/// The deterministic election rule: the lowest-id reachable member leads.
fn elected(members: &BTreeSet<NodeId>, isolated: &BTreeSet<NodeId>) -> Option<NodeId> {
    members.iter().copied().find(|node| !isolated.contains(node))
}

/// One node's view of the in-memory Raft engine.
pub struct MemEngine {
    id: NodeId,
    net: Arc<MemNet>,
}

impl MemEngine {
    pub fn new(id: NodeId, net: Arc<MemNet>) -> Self {
        Self { id, net }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn unreachable(&self, isolated: &BTreeSet<NodeId>, target: NodeId) -> bool {
        target != self.id && (isolated.contains(&self.id) || isolated.contains(&target))
    }
}

#[async_trait]
impl RaftEngine for MemEngine {
    async fn start_replica(
        &self,
        spec: ReplicaSpec,
        machine: Box<dyn ReplicatedMachine>,
    ) -> Result<ReplicaRef, EngineError> {
        let mut guard = self.net.inner.lock().await;
        match guard.groups.entry(spec.group.clone()) {
            Entry::Occupied(mut occupied) => {
                let shared = occupied.get_mut();
                if shared.members.contains(&self.id) {
                    return Err(EngineError::ProcessExists(spec.group));
                }
                // Joining (or re-forming) an existing group keeps its
                // machine: real engines sync the newcomer from a snapshot.
                shared.members.insert(self.id);
            }
            Entry::Vacant(vacant) => {
                let mut members = BTreeSet::new();
                members.insert(self.id);
                vacant.insert(GroupShared {
                    members,
                    machine,
                    applied: HashMap::new(),
                    last_applied: 0,
                });
            }
        }
        tracing::debug!(group = %spec.group, node = self.id, mode = ?spec.mode, "started replica");
        Ok(ReplicaRef {
            group: spec.group,
            node: self.id,
        })
    }

    async fn stop_replica(&self, group: &str) -> Result<(), EngineError> {
        let mut guard = self.net.inner.lock().await;
        if let Some(shared) = guard.groups.get_mut(group) {
            shared.members.remove(&self.id);
            tracing::debug!(group, node = self.id, "stopped replica");
        }
        Ok(())
    }

    async fn command(
        &self,
        target: &ReplicaRef,
        arg: &[u8],
        reference: CommandRef,
        _timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let mut guard = self.net.inner.lock().await;
        let inner = &mut *guard;
        if self.unreachable(&inner.isolated, target.node) {
            return Err(RpcError::Transport(format!("node {} is unreachable", target.node)));
        }
        let isolated = &inner.isolated;
        let shared = match inner.groups.get_mut(&target.group) {
            Some(shared) if shared.members.contains(&target.node) => shared,
            _ => return Err(RpcError::Transport(format!("no replica of '{}' on node {}", target.group, target.node))),
        };
        let leader = elected(&shared.members, isolated);
        if leader != Some(target.node) {
            return Err(RpcError::NotLeader {
                hint: leader.map(|node| ReplicaRef {
                    group: target.group.clone(),
                    node,
                }),
            });
        }
        if let Some(cached) = shared.applied.get(&reference) {
            return Ok(cached.clone());
        }
        let response = shared.machine.apply(arg);
        shared.last_applied += 1;
        shared.applied.insert(reference, response.clone());
        Ok(response)
    }

    async fn query(&self, target: &ReplicaRef, arg: &[u8], _timeout: Duration) -> Result<Vec<u8>, RpcError> {
        let guard = self.net.inner.lock().await;
        if self.unreachable(&guard.isolated, target.node) {
            return Err(RpcError::Transport(format!("node {} is unreachable", target.node)));
        }
        let shared = match guard.groups.get(&target.group) {
            Some(shared) if shared.members.contains(&target.node) => shared,
            _ => return Err(RpcError::Transport(format!("no replica of '{}' on node {}", target.group, target.node))),
        };
        // Linearizable reads are answered by the leader only.
        let leader = elected(&shared.members, &guard.isolated);
        if leader != Some(target.node) {
            return Err(RpcError::NotLeader {
                hint: leader.map(|node| ReplicaRef {
                    group: target.group.clone(),
                    node,
                }),
            });
        }
        Ok(shared.machine.query(arg))
    }

    async fn status(&self, group: &str) -> Option<ReplicaStatus> {
        let guard = self.net.inner.lock().await;
        let shared = guard.groups.get(group)?;
        if !shared.members.contains(&self.id) {
            return None;
        }
        let role = if elected(&shared.members, &guard.isolated) == Some(self.id) {
            ReplicaRole::Leader
        } else {
            ReplicaRole::Follower
        };
        Some(ReplicaStatus {
            role,
            last_applied: shared.last_applied,
        })
    }
}

/// A replicated register: `apply` overwrites the value, `query` reads it.
#[derive(Default)]
pub struct MemMachine {
    value: Vec<u8>,
}

impl ReplicatedMachine for MemMachine {
    fn apply(&mut self, arg: &[u8]) -> Vec<u8> {
        self.value = arg.to_vec();
        self.value.clone()
    }

    fn query(&self, _arg: &[u8]) -> Vec<u8> {
        self.value.clone()
    }
}

/// Hands every user group a fresh [`MemMachine`].
pub struct MemMachineFactory;

impl MachineFactory for MemMachineFactory {
    fn create(&self, _group: &str) -> Box<dyn ReplicatedMachine> {
        Box::new(MemMachine::default())
    }
}
