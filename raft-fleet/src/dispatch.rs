//! Leader resolution and bounded-retry dispatch of commands and queries.
//!
//! Every request against a consensus group goes through the same protocol:
//! take the cached leader handle, or discover one; attempt the RPC; on a
//! transport fault evict the cache entry, sleep, and try again until the
//! retry budget is gone. Application-level rejections arrive inside
//! successful payloads and never burn retries.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;

use crate::cache::LeaderCache;
use crate::config::Config;
use crate::engine::FleetNetwork;
use crate::engine::RaftEngine;
use crate::engine::ReplicaRef;
use crate::error::FleetError;
use crate::error::FleetResult;
use crate::error::RpcError;
use crate::state::FleetCommand;
use crate::state::FleetQuery;
use crate::state::FleetResponse;
use crate::CommandRef;
use crate::NodeId;

/// Per-call overrides of the retry protocol.
#[derive(Clone, Copy, Debug)]
pub struct CallOptions {
    /// Deadline of a single RPC attempt.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retry: u32,
    /// Sleep between attempts.
    pub retry_interval: Duration,
}

impl CallOptions {
    /// The configured defaults (500 ms / 3 / 1000 ms unless overridden).
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_millis(config.rpc_timeout),
            retry: config.rpc_retry,
            retry_interval: Duration::from_millis(config.rpc_retry_interval),
        }
    }
}

/// One request, borrowed from the caller for the duration of the retries.
enum Op<'a> {
    Command { arg: &'a [u8], reference: CommandRef },
    Query { arg: &'a [u8] },
}

/// Routes commands and queries to group leaders on behalf of one node.
///
/// Shared between the public [`Fleet`](crate::Fleet) handle and the node's
/// manager task; cheap to call concurrently.
pub struct Dispatcher<E: RaftEngine, N: FleetNetwork> {
    id: NodeId,
    config: Arc<Config>,
    engine: Arc<E>,
    network: Arc<N>,
    cache: Arc<LeaderCache>,
    next_ref: AtomicU64,
}

impl<E: RaftEngine, N: FleetNetwork> Dispatcher<E, N> {
    pub fn new(id: NodeId, config: Arc<Config>, engine: Arc<E>, network: Arc<N>, cache: Arc<LeaderCache>) -> Self {
        Self {
            id,
            config,
            engine,
            network,
            cache,
            next_ref: AtomicU64::new(1),
        }
    }

    /// The node this dispatcher runs on.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The leader cache this dispatcher consults.
    pub fn cache(&self) -> &LeaderCache {
        &self.cache
    }

    /// The configured default call options.
    pub fn default_options(&self) -> CallOptions {
        CallOptions::from_config(&self.config)
    }

    /// Allocate an idempotency reference, unique within this node's
    /// lifetime and prefixed with the node id to avoid cross-node clashes.
    pub fn next_reference(&self) -> CommandRef {
        (self.id << 40) | self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit an opaque command to `group`, retrying per `opts`.
    #[tracing::instrument(level = "debug", skip(self, arg, opts))]
    pub async fn command(&self, group: &str, arg: &[u8], opts: &CallOptions) -> FleetResult<Vec<u8>> {
        let reference = self.next_reference();
        self.call_with_retry(group, Op::Command { arg, reference }, opts).await
    }

    /// Submit an opaque linearizable query to `group`, retrying per `opts`.
    #[tracing::instrument(level = "debug", skip(self, arg, opts))]
    pub async fn query(&self, group: &str, arg: &[u8], opts: &CallOptions) -> FleetResult<Vec<u8>> {
        self.call_with_retry(group, Op::Query { arg }, opts).await
    }

    /// Submit a [`FleetCommand`] to the cluster group.
    pub async fn cluster_command(&self, command: &FleetCommand, opts: &CallOptions) -> FleetResult<FleetResponse> {
        let arg = serde_json::to_vec(command)?;
        let reference = self.next_reference();
        let raw = self
            .call_with_retry(self.config.cluster_group.as_str(), Op::Command { arg: &arg, reference }, opts)
            .await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Submit a [`FleetQuery`] to the cluster group.
    pub async fn cluster_query(&self, query: &FleetQuery, opts: &CallOptions) -> FleetResult<FleetResponse> {
        let arg = serde_json::to_vec(query)?;
        let raw = self.call_with_retry(self.config.cluster_group.as_str(), Op::Query { arg: &arg }, opts).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Find the current cluster-group leader without burning a retry
    /// budget: one cache hit or one broadcast probe.
    pub async fn locate_cluster_leader(&self) -> Option<ReplicaRef> {
        let group = self.config.cluster_group.clone();
        if let Some(target) = self.cache.get(&group) {
            return Some(target);
        }
        self.broadcast_probe(&group).await
    }

    /// The retry loop: cache, discovery, RPC, eviction.
    async fn call_with_retry(&self, group: &str, op: Op<'_>, opts: &CallOptions) -> FleetResult<Vec<u8>> {
        let mut tries_left = opts.retry.saturating_add(1);
        loop {
            let target = match self.cache.get(group) {
                Some(target) => target,
                None => match self.discover(group).await {
                    Some(target) => target,
                    None => {
                        tries_left -= 1;
                        if tries_left == 0 {
                            return Err(FleetError::NoLeader(group.to_string()));
                        }
                        tokio::time::sleep(opts.retry_interval).await;
                        continue;
                    }
                },
            };
            match self.try_rpc(&target, &op, opts.timeout).await {
                Ok(value) => return Ok(value),
                Err(RpcError::NotLeader { hint }) => {
                    tracing::debug!(group, node = target.node, "cached replica is not the leader");
                    self.cache.unset(group);
                    tries_left -= 1;
                    if tries_left == 0 {
                        return Err(FleetError::NoLeader(group.to_string()));
                    }
                    if let Some(hint) = hint {
                        // A fresh hint costs nothing to follow right away.
                        self.cache.set(group, hint);
                        continue;
                    }
                    tokio::time::sleep(opts.retry_interval).await;
                }
                Err(RpcError::Transport(reason)) => {
                    tracing::debug!(group, node = target.node, %reason, "transport fault, evicting leader cache entry");
                    self.cache.unset(group);
                    tries_left -= 1;
                    if tries_left == 0 {
                        return Err(FleetError::NoLeader(group.to_string()));
                    }
                    tokio::time::sleep(opts.retry_interval).await;
                }
            }
        }
    }

    async fn try_rpc(&self, target: &ReplicaRef, op: &Op<'_>, timeout: Duration) -> Result<Vec<u8>, RpcError> {
        match op {
            Op::Command { arg, reference } => self.engine.command(target, arg, *reference, timeout).await,
            Op::Query { arg } => self.engine.query(target, arg, timeout).await,
        }
    }

    /// One discovery attempt. A success has already updated the cache.
    async fn discover(&self, group: &str) -> Option<ReplicaRef> {
        if group != self.config.cluster_group {
            if let Some(node) = self.cluster_leader_hint(group).await {
                match self.network.probe_leader(node, group).await {
                    Ok(Some(found)) => {
                        self.cache.set(group, found.clone());
                        return Some(found);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(group, node, error=%err, "leader hint probe failed");
                    }
                }
            }
        }
        self.broadcast_probe(group).await
    }

    /// Ask every connected node who leads `group`; first affirmative wins.
    async fn broadcast_probe(&self, group: &str) -> Option<ReplicaRef> {
        let mut targets = self.network.peers().await;
        targets.push(self.id);
        let mut pending = FuturesUnordered::new();
        for node in targets {
            let network = self.network.clone();
            let group = group.to_string();
            pending.push(async move { network.probe_leader(node, &group).await.ok().flatten() });
        }
        while let Some(res) = pending.next().await {
            if let Some(found) = res {
                self.cache.set(group, found.clone());
                return Some(found);
            }
        }
        None
    }

    /// Look up the replicated leader hint for a user group, going through
    /// the cluster group directly (no retry loop, to keep discovery one
    /// bounded step).
    async fn cluster_leader_hint(&self, group: &str) -> Option<NodeId> {
        let cluster = self.config.cluster_group.clone();
        let target = match self.cache.get(&cluster) {
            Some(target) => target,
            None => self.broadcast_probe(&cluster).await?,
        };
        let arg = serde_json::to_vec(&FleetQuery::LeaderHint { name: group.to_string() }).ok()?;
        let timeout = Duration::from_millis(self.config.rpc_timeout);
        match self.engine.query(&target, &arg, timeout).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(FleetResponse::Leader(hint)) => hint,
                Ok(_) | Err(_) => None,
            },
            Err(err) => {
                tracing::debug!(group, error=%err, "cluster group unreachable during discovery");
                self.cache.unset(&cluster);
                None
            }
        }
    }
}
