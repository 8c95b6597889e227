//! Observability of a fleet node.
//!
//! The manager task publishes a [`FleetMetrics`] snapshot on a watch
//! channel after every state transition and balancing pass. [`Wait`] turns
//! that channel into test-friendly "block until the node looks like X"
//! helpers.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::GroupName;
use crate::NodeId;
use crate::ZoneId;

/// A snapshot of one node's view of itself.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetMetrics {
    /// This node's ID.
    pub id: NodeId,
    /// The zone this node is active in, if any.
    pub active_zone: Option<ZoneId>,
    /// Consensus groups with a replica running on this node, the cluster
    /// group included.
    pub hosted: BTreeSet<GroupName>,
    /// The cluster-group leader this node currently believes in.
    pub cluster_leader: Option<NodeId>,
    /// How many balancing passes have completed since activation.
    pub balancing_rounds: u64,
}

impl FleetMetrics {
    /// The metrics of a freshly started, inactive node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            active_zone: None,
            hosted: BTreeSet::new(),
            cluster_leader: None,
            balancing_rounds: 0,
        }
    }
}

/// Error variants related to metrics waiting.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("fleet node is shutting down")]
    ShuttingDown,
}

/// Wait for metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<FleetMetrics>,
}

impl Wait {
    /// Wait until `func(metrics)` returns true, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<FleetMetrics, WaitError>
    where T: Fn(&FleetMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!(?latest, "wait is satisfied: {}", msg);
                return Ok(latest);
            }
            let delta = tokio::time::timeout(self.timeout, rx.changed()).await;
            match delta {
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Wait until this node hosts a replica of `group`.
    pub async fn hosts(&self, group: &str, msg: &str) -> Result<FleetMetrics, WaitError> {
        let group = group.to_string();
        self.metrics(|m| m.hosted.contains(&group), msg).await
    }

    /// Wait until this node is active in `zone`.
    pub async fn active_in(&self, zone: &str, msg: &str) -> Result<FleetMetrics, WaitError> {
        let zone = zone.to_string();
        self.metrics(|m| m.active_zone.as_deref() == Some(zone.as_str()), msg).await
    }

    /// Wait until at least `rounds` balancing passes have completed.
    pub async fn balancing_rounds(&self, rounds: u64, msg: &str) -> Result<FleetMetrics, WaitError> {
        self.metrics(|m| m.balancing_rounds >= rounds, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_on_change() {
        let (tx, rx) = watch::channel(FleetMetrics::new_initial(1));
        let wait = Wait {
            timeout: Duration::from_millis(500),
            rx,
        };
        let handle = tokio::spawn(async move {
            let mut m = FleetMetrics::new_initial(1);
            m.active_zone = Some("z1".into());
            let _ = tx.send(m);
        });
        let m = wait.active_in("z1", "node activates").await.expect("watch change");
        assert_eq!(m.active_zone.as_deref(), Some("z1"));
        handle.await.expect("publisher task");
    }

    #[tokio::test]
    async fn wait_times_out() {
        let (_tx, rx) = watch::channel(FleetMetrics::new_initial(1));
        let wait = Wait {
            timeout: Duration::from_millis(10),
            rx,
        };
        let res = wait.hosts("g", "never happens").await;
        assert!(matches!(res, Err(WaitError::Timeout(_, _))));
    }
}
