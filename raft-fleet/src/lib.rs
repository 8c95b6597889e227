//! Placement, leader routing and health management for a fleet of Raft
//! consensus groups.
//!
//! A *fleet* is a set of Raft consensus groups whose replicas are spread
//! across the nodes of a cluster. One distinguished group, the *cluster
//! group*, replicates the fleet's own membership and placement state and is
//! the root of trust for everything else: which nodes are active and in
//! which availability zone, which user groups exist, where their replicas
//! should live, and which nodes are failing and due to be purged.
//!
//! The Raft log/election machinery itself is an external collaborator
//! behind the [`RaftEngine`] trait; this crate decides *where* replicas run
//! and *how* requests find the current leader, not how logs are replicated.

pub mod cache;
pub mod config;
mod core;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fleet;
mod hash;
pub mod metrics;
pub mod placement;
pub mod state;

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

pub use async_trait;

pub use crate::cache::LeaderCache;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::dispatch::CallOptions;
pub use crate::engine::BootstrapOutcome;
pub use crate::engine::BootstrapRequest;
pub use crate::engine::FleetNetwork;
pub use crate::engine::MachineFactory;
pub use crate::engine::RaftEngine;
pub use crate::engine::ReplicaRef;
pub use crate::engine::ReplicaRole;
pub use crate::engine::ReplicaSpec;
pub use crate::engine::ReplicaStatus;
pub use crate::engine::ReplicatedMachine;
pub use crate::engine::StartMode;
pub use crate::error::FleetError;
pub use crate::error::FleetResult;
pub use crate::fleet::Fleet;
pub use crate::metrics::FleetMetrics;

/// A fleet-wide unique identifier of a cluster node.
pub type NodeId = u64;

/// An administrator-assigned availability zone.
pub type ZoneId = String;

/// The symbolic name of a consensus group.
pub type GroupName = String;

/// A caller-provided unique reference attached to a command so that a
/// retried submission applied twice by the Raft engine produces the same
/// result exactly once.
pub type CommandRef = u64;

/// Milliseconds since the Unix epoch.
///
/// Commands against the replicated cluster state are deterministic, so the
/// proposer stamps wall-clock time into the command rather than letting the
/// applier read a clock.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
