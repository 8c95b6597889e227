//! Fleet runtime configuration.

use std::path::PathBuf;

use thiserror::Error;

use crate::GroupName;

/// Default Manager balancing tick period, in milliseconds.
pub const DEFAULT_BALANCING_INTERVAL: u64 = 60 * 1000;
/// Default leader cache refresh period, in milliseconds.
pub const DEFAULT_LEADER_CACHE_REFRESH_INTERVAL: u64 = 5 * 60 * 1000;
/// Default unhealthy duration before a node is purged, in milliseconds.
pub const DEFAULT_NODE_PURGE_FAILURE_TIME_WINDOW: u64 = 10 * 60 * 1000;
/// Default reconnect/health probe period, in milliseconds.
pub const DEFAULT_NODE_PURGE_RECONNECT_INTERVAL: u64 = 60 * 1000;
/// Default failing-member count above which a node is considered unhealthy.
///
/// Strictly greater triggers: a node with exactly this many unresponsive
/// replicas is still considered healthy.
pub const DEFAULT_NODE_PURGE_THRESHOLD_FAILING_MEMBERS: u32 = 2;
/// Default time a removed group name stays tombstoned, in milliseconds.
pub const DEFAULT_TOMBSTONE_TTL: u64 = 5 * 60 * 1000;
/// Default per-attempt RPC deadline, in milliseconds.
pub const DEFAULT_RPC_TIMEOUT: u64 = 500;
/// Default number of retries after the first attempt.
pub const DEFAULT_RPC_RETRY: u32 = 3;
/// Default sleep between retries, in milliseconds.
pub const DEFAULT_RPC_RETRY_INTERVAL: u64 = 1000;
/// Default replica count of the cluster group itself.
pub const DEFAULT_CLUSTER_GROUP_REPLICAS: u8 = 3;
/// Default name of the cluster group.
pub const DEFAULT_CLUSTER_GROUP: &str = "fleet.cluster";

/// Errors detected while validating a [`Config`].
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("cluster name must not be empty")]
    EmptyClusterName,

    #[error("cluster group name must not be empty")]
    EmptyClusterGroup,

    #[error("cluster group replica count must be at least 1")]
    InvalidClusterGroupReplicas,

    #[error("interval '{0}' must be greater than zero")]
    InvalidInterval(&'static str),
}

/// The runtime configuration of a fleet node.
///
/// All durations are in milliseconds. Obtain an instance through the
/// builder: `Config::build("my-cluster".into()).validate()`; test profiles
/// shorten the intervals through the same builder rather than via
/// compile-time switches.
#[derive(Clone, Debug)]
pub struct Config {
    /// A human readable name of the cluster, used in tracing output only.
    pub cluster_name: String,
    /// The reserved name of the cluster group.
    pub cluster_group: GroupName,
    /// How many replicas the cluster group itself should run.
    pub cluster_group_replicas: u8,
    /// Manager reconciliation tick period.
    pub balancing_interval: u64,
    /// Leader cache refresh period.
    pub leader_cache_refresh_interval: u64,
    /// How long a node may stay unhealthy before it is purged.
    pub node_purge_failure_time_window: u64,
    /// Connectivity probe and reconnect period of the purge controller.
    pub node_purge_reconnect_interval: u64,
    /// Unresponsive-replica count above which (strictly) a node is recorded
    /// as failing.
    pub node_purge_threshold_failing_members: u32,
    /// How long a removed group name stays tombstoned.
    pub tombstone_ttl: u64,
    /// Per-attempt deadline for commands and queries.
    pub rpc_timeout: u64,
    /// Retries after the first attempt for commands and queries.
    pub rpc_retry: u32,
    /// Sleep between retries.
    pub rpc_retry_interval: u64,
    /// When set, a replica of group `g` persists under `<parent>/<g>`.
    pub persistence_dir_parent: Option<PathBuf>,
}

impl Config {
    /// Start the builder process, with the cluster name given.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            cluster_group: None,
            cluster_group_replicas: None,
            balancing_interval: None,
            leader_cache_refresh_interval: None,
            node_purge_failure_time_window: None,
            node_purge_reconnect_interval: None,
            node_purge_threshold_failing_members: None,
            tombstone_ttl: None,
            rpc_timeout: None,
            rpc_retry: None,
            rpc_retry_interval: None,
            persistence_dir_parent: None,
        }
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    cluster_group: Option<GroupName>,
    cluster_group_replicas: Option<u8>,
    balancing_interval: Option<u64>,
    leader_cache_refresh_interval: Option<u64>,
    node_purge_failure_time_window: Option<u64>,
    node_purge_reconnect_interval: Option<u64>,
    node_purge_threshold_failing_members: Option<u32>,
    tombstone_ttl: Option<u64>,
    rpc_timeout: Option<u64>,
    rpc_retry: Option<u32>,
    rpc_retry_interval: Option<u64>,
    persistence_dir_parent: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Override the reserved cluster group name.
    pub fn cluster_group(mut self, name: GroupName) -> Self {
        self.cluster_group = Some(name);
        self
    }

    /// Set the replica count of the cluster group.
    pub fn cluster_group_replicas(mut self, n: u8) -> Self {
        self.cluster_group_replicas = Some(n);
        self
    }

    /// Set the Manager balancing tick period, in milliseconds.
    pub fn balancing_interval(mut self, millis: u64) -> Self {
        self.balancing_interval = Some(millis);
        self
    }

    /// Set the leader cache refresh period, in milliseconds.
    pub fn leader_cache_refresh_interval(mut self, millis: u64) -> Self {
        self.leader_cache_refresh_interval = Some(millis);
        self
    }

    /// Set the unhealthy duration before purge, in milliseconds.
    pub fn node_purge_failure_time_window(mut self, millis: u64) -> Self {
        self.node_purge_failure_time_window = Some(millis);
        self
    }

    /// Set the reconnect/health probe period, in milliseconds.
    pub fn node_purge_reconnect_interval(mut self, millis: u64) -> Self {
        self.node_purge_reconnect_interval = Some(millis);
        self
    }

    /// Set the failing-member threshold; strictly more failing members mark
    /// the node unhealthy.
    pub fn node_purge_threshold_failing_members(mut self, count: u32) -> Self {
        self.node_purge_threshold_failing_members = Some(count);
        self
    }

    /// Set how long removed group names stay tombstoned, in milliseconds.
    pub fn tombstone_ttl(mut self, millis: u64) -> Self {
        self.tombstone_ttl = Some(millis);
        self
    }

    /// Set the default per-attempt RPC deadline, in milliseconds.
    pub fn rpc_timeout(mut self, millis: u64) -> Self {
        self.rpc_timeout = Some(millis);
        self
    }

    /// Set the default retry count after the first attempt.
    pub fn rpc_retry(mut self, retry: u32) -> Self {
        self.rpc_retry = Some(retry);
        self
    }

    /// Set the default sleep between retries, in milliseconds.
    pub fn rpc_retry_interval(mut self, millis: u64) -> Self {
        self.rpc_retry_interval = Some(millis);
        self
    }

    /// Persist replica state of group `g` under `<parent>/<g>`.
    pub fn persistence_dir_parent(mut self, parent: PathBuf) -> Self {
        self.persistence_dir_parent = Some(parent);
        self
    }

    /// Validate the state of this builder and produce a new `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::EmptyClusterName);
        }
        let cluster_group = self.cluster_group.unwrap_or_else(|| DEFAULT_CLUSTER_GROUP.to_string());
        if cluster_group.is_empty() {
            return Err(ConfigError::EmptyClusterGroup);
        }
        let cluster_group_replicas = self.cluster_group_replicas.unwrap_or(DEFAULT_CLUSTER_GROUP_REPLICAS);
        if cluster_group_replicas == 0 {
            return Err(ConfigError::InvalidClusterGroupReplicas);
        }
        let config = Config {
            cluster_name: self.cluster_name,
            cluster_group,
            cluster_group_replicas,
            balancing_interval: self.balancing_interval.unwrap_or(DEFAULT_BALANCING_INTERVAL),
            leader_cache_refresh_interval: self
                .leader_cache_refresh_interval
                .unwrap_or(DEFAULT_LEADER_CACHE_REFRESH_INTERVAL),
            node_purge_failure_time_window: self
                .node_purge_failure_time_window
                .unwrap_or(DEFAULT_NODE_PURGE_FAILURE_TIME_WINDOW),
            node_purge_reconnect_interval: self
                .node_purge_reconnect_interval
                .unwrap_or(DEFAULT_NODE_PURGE_RECONNECT_INTERVAL),
            node_purge_threshold_failing_members: self
                .node_purge_threshold_failing_members
                .unwrap_or(DEFAULT_NODE_PURGE_THRESHOLD_FAILING_MEMBERS),
            tombstone_ttl: self.tombstone_ttl.unwrap_or(DEFAULT_TOMBSTONE_TTL),
            rpc_timeout: self.rpc_timeout.unwrap_or(DEFAULT_RPC_TIMEOUT),
            rpc_retry: self.rpc_retry.unwrap_or(DEFAULT_RPC_RETRY),
            rpc_retry_interval: self.rpc_retry_interval.unwrap_or(DEFAULT_RPC_RETRY_INTERVAL),
            persistence_dir_parent: self.persistence_dir_parent,
        };
        for &(name, value) in &[
            ("balancing_interval", config.balancing_interval),
            ("leader_cache_refresh_interval", config.leader_cache_refresh_interval),
            ("node_purge_failure_time_window", config.node_purge_failure_time_window),
            ("node_purge_reconnect_interval", config.node_purge_reconnect_interval),
            ("tombstone_ttl", config.tombstone_ttl),
            ("rpc_timeout", config.rpc_timeout),
            ("rpc_retry_interval", config.rpc_retry_interval),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidInterval(name));
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.balancing_interval, DEFAULT_BALANCING_INTERVAL);
        assert_eq!(config.rpc_timeout, 500);
        assert_eq!(config.rpc_retry, 3);
        assert_eq!(config.rpc_retry_interval, 1000);
        assert_eq!(config.cluster_group, DEFAULT_CLUSTER_GROUP);
        assert_eq!(config.node_purge_threshold_failing_members, 2);
        assert!(config.persistence_dir_parent.is_none());
    }

    #[test]
    fn rejects_empty_cluster_name() {
        let res = Config::build("".into()).validate();
        assert_eq!(res.unwrap_err(), ConfigError::EmptyClusterName);
    }

    #[test]
    fn rejects_zero_intervals() {
        let res = Config::build("test".into()).balancing_interval(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidInterval("balancing_interval"));
    }

    #[test]
    fn rejects_zero_cluster_group_replicas() {
        let res = Config::build("test".into()).cluster_group_replicas(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidClusterGroupReplicas);
    }
}
