//! The per-process leader cache.
//!
//! Entries are hints: a cached handle may point at a replica that lost
//! leadership long ago, and every caller must be prepared for that. Writers
//! race under last-writer-wins; eviction is opportunistic on RPC failure.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use crate::engine::ReplicaRef;
use crate::GroupName;

/// A process-wide map from group name to the believed leader replica.
#[derive(Debug, Default)]
pub struct LeaderCache {
    entries: RwLock<HashMap<GroupName, ReplicaRef>>,
}

impl LeaderCache {
    /// Look up the believed leader of `group`.
    pub fn get(&self, group: &str) -> Option<ReplicaRef> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(group).cloned()
    }

    /// Record `replica` as the believed leader of `group`.
    pub fn set(&self, group: &str, replica: ReplicaRef) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group.to_string(), replica);
    }

    /// Drop the entry for `group`, if any.
    pub fn unset(&self, group: &str) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(group);
    }

    /// Snapshot all current entries, for the periodic refresher.
    pub fn entries(&self) -> Vec<(GroupName, ReplicaRef)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(group, replica)| (group.clone(), replica.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(node: u64) -> ReplicaRef {
        ReplicaRef { group: "g".into(), node }
    }

    #[test]
    fn set_get_unset() {
        let cache = LeaderCache::default();
        assert_eq!(cache.get("g"), None);
        cache.set("g", replica(1));
        assert_eq!(cache.get("g"), Some(replica(1)));
        cache.set("g", replica(2));
        assert_eq!(cache.get("g"), Some(replica(2)));
        cache.unset("g");
        assert_eq!(cache.get("g"), None);
        // Unsetting an absent key is a no-op.
        cache.unset("g");
    }

    #[test]
    fn entries_snapshot() {
        let cache = LeaderCache::default();
        cache.set("a", replica(1));
        cache.set("b", replica(2));
        let mut entries = cache.entries();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "a");
        assert_eq!(entries[1].0, "b");
    }
}
