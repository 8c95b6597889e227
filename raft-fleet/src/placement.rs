//! Zone-aware rendezvous placement of replicas onto nodes.
//!
//! Each consensus group is a *task* whose replicas must be spread over the
//! active nodes. Within one zone the nodes are ranked by their rendezvous
//! weight for the task; across zones the rank-0 picks of every zone sort
//! before any rank-1 pick, so replicas round-robin over zones before a
//! second replica lands in any one of them. Within a rank the hash order
//! keeps assignments rendezvous-stable: adding or removing a node only
//! perturbs the small fraction of tasks whose weights involved that node.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::hash::lrw_hash;
use crate::NodeId;
use crate::ZoneId;

/// Pick the `n_to_take` nodes which should host replicas of `task_id`.
///
/// The returned list is ordered: truncating the result for a smaller
/// replica count yields a prefix of the result for a larger one. When
/// `n_to_take` exceeds the number of available nodes, all available nodes
/// are returned. Empty zones are skipped.
///
/// Ties on (rank, hash) break on the NodeId itself so that the ordering
/// does not depend on sort implementation details.
pub fn lrw_members(
    nodes_per_zone: &BTreeMap<ZoneId, BTreeSet<NodeId>>,
    task_id: &str,
    n_to_take: usize,
) -> Vec<NodeId> {
    let mut weighted: Vec<(usize, u64, NodeId)> = Vec::new();
    for nodes in nodes_per_zone.values() {
        let mut zone: Vec<(u64, NodeId)> = nodes.iter().map(|&node| (lrw_hash(node, task_id), node)).collect();
        zone.sort_unstable();
        for (rank, (hash, node)) in zone.into_iter().enumerate() {
            weighted.push((rank, hash, node));
        }
    }
    weighted.sort_unstable();
    weighted.into_iter().take(n_to_take).map(|(_, _, node)| node).collect()
}
