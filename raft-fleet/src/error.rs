//! Error types exposed by this crate.

use thiserror::Error;

use crate::engine::ReplicaRef;
use crate::GroupName;

/// A result type where the error variant is always a [`FleetError`].
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Errors surfaced by the routing layer and by the fleet node itself.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The fleet node is shutting down and can no longer accept requests.
    #[error("fleet node is shutting down")]
    ShuttingDown,

    /// The retry budget was exhausted without a successful leader dispatch.
    #[error("no leader found for consensus group '{0}' within the retry budget")]
    NoLeader(GroupName),

    /// A replicated command or query payload could not be encoded or decoded.
    #[error("replicated payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// An opaque fault from the Raft engine or the cluster transport.
    #[error("raft engine error: {0}")]
    Engine(#[from] anyhow::Error),
}

/// The error set of [`Fleet::activate`](crate::Fleet::activate).
#[derive(Debug, Error)]
pub enum ActivateError {
    /// The node has already executed `activate` without a matching
    /// `deactivate`.
    #[error("this node is already active")]
    NotInactive,

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// The error set of [`Fleet::deactivate`](crate::Fleet::deactivate).
#[derive(Debug, Error)]
pub enum DeactivateError {
    /// The node is not currently active.
    #[error("this node is not active")]
    Inactive,

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// The error set of
/// [`Fleet::add_consensus_group`](crate::Fleet::add_consensus_group).
#[derive(Debug, Error)]
pub enum AddGroupError {
    /// A live (non-tombstoned) group of the same name is already registered.
    #[error("consensus group '{0}' is already registered")]
    AlreadyAdded(GroupName),

    /// The bootstrap node already runs a replica process for this group.
    ///
    /// The registration has been rolled back by the time this error is
    /// returned.
    #[error("a replica process for consensus group '{0}' already exists")]
    ProcessExists(GroupName),

    /// The name is reserved for the cluster group.
    #[error("'{0}' is the reserved cluster group name")]
    Reserved(GroupName),

    /// The requested replica count is outside `1..=255`.
    #[error("n_replica must be at least 1")]
    InvalidReplicaCount,

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// The error set of
/// [`Fleet::remove_consensus_group`](crate::Fleet::remove_consensus_group).
#[derive(Debug, Error)]
pub enum RemoveGroupError {
    /// No group of this name is registered.
    #[error("consensus group '{0}' is not registered")]
    NotFound(GroupName),

    /// The name is reserved for the cluster group.
    #[error("'{0}' is the reserved cluster group name")]
    Reserved(GroupName),

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// Errors reported by a [`RaftEngine`](crate::RaftEngine) implementation
/// when starting or stopping replicas.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A replica of the group is already running on this node.
    #[error("a replica of consensus group '{0}' is already running on this node")]
    ProcessExists(GroupName),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The result type of a single RPC attempt against a replica or a node.
///
/// Transport-layer faults (connection refused, timeout, remote crash) are
/// caught at the RPC boundary and folded into the retry loop; application
/// level rejections travel inside successful payloads and are terminal.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The counterparty could not be reached within the deadline.
    ///
    /// Burns one retry and evicts the leader cache entry for the group.
    #[error("transport fault: {0}")]
    Transport(String),

    /// The target replica answered but is not the current leader.
    ///
    /// Evicts the cache entry; when a leader hint is included the caller
    /// follows it immediately without sleeping.
    #[error("target replica is not the leader")]
    NotLeader {
        /// The leader known to the responding replica, if any.
        hint: Option<ReplicaRef>,
    },
}
