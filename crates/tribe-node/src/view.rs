//! The merged view: an immutable snapshot of every member cluster's nodes and indices.

use crate::state::{IndexRecord, MemberState, RemoteNode};
use serde::Serialize;
use std::collections::BTreeMap;

/// Immutable merged snapshot published by the aggregator.
///
/// Snapshots are never mutated after publication; a change produces a new
/// snapshot with a higher version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedView {
    version: u64,
    local_node: String,
    nodes: BTreeMap<String, RemoteNode>,
    indices: BTreeMap<String, IndexRecord>,
    members: BTreeMap<String, MemberState>,
}

impl MergedView {
    /// The empty view published before any member syncs.
    pub fn empty(local_node: &str) -> Self {
        Self {
            version: 0,
            local_node: local_node.to_string(),
            nodes: BTreeMap::new(),
            indices: BTreeMap::new(),
            members: BTreeMap::new(),
        }
    }

    pub(crate) fn new(
        version: u64,
        local_node: String,
        nodes: BTreeMap<String, RemoteNode>,
        indices: BTreeMap<String, IndexRecord>,
        members: BTreeMap<String, MemberState>,
    ) -> Self {
        Self {
            version,
            local_node,
            nodes,
            indices,
            members,
        }
    }

    /// True if `other` carries the same content, ignoring the version.
    pub fn same_content(&self, other: &MergedView) -> bool {
        self.local_node == other.local_node
            && self.nodes == other.nodes
            && self.indices == other.indices
            && self.members == other.members
    }

    /// Snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Name of the tribe node itself.
    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Remote nodes by namespaced name.
    pub fn nodes(&self) -> impl Iterator<Item = &RemoteNode> {
        self.nodes.values()
    }

    /// Look up a remote node by namespaced name.
    pub fn node(&self, merged_name: &str) -> Option<&RemoteNode> {
        self.nodes.get(merged_name)
    }

    /// Every node name in the view: the local node plus the namespaced remote nodes.
    pub fn node_names(&self) -> Vec<String> {
        std::iter::once(self.local_node.clone())
            .chain(self.nodes.keys().cloned())
            .collect()
    }

    /// Number of remote nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Indices by bare name.
    pub fn indices(&self) -> impl Iterator<Item = &IndexRecord> {
        self.indices.values()
    }

    /// Look up an index.
    pub fn index(&self, name: &str) -> Option<&IndexRecord> {
        self.indices.get(name)
    }

    /// True if the index is part of the view.
    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Sorted index names.
    pub fn index_names(&self) -> Vec<&str> {
        self.indices.keys().map(String::as_str).collect()
    }

    /// Alias of the member owning an index.
    pub fn owner_of(&self, index: &str) -> Option<&str> {
        self.indices.get(index).map(|r| r.cluster.as_str())
    }

    /// Link state per member alias.
    pub fn members(&self) -> &BTreeMap<String, MemberState> {
        &self.members
    }

    /// Link state of one member.
    pub fn member_state(&self, alias: &str) -> Option<MemberState> {
        self.members.get(alias).copied()
    }

    /// Aliases owning at least one index, sorted.
    pub fn owning_members(&self) -> Vec<&str> {
        let mut owners: Vec<&str> = self.indices.values().map(|r| r.cluster.as_str()).collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::merged_node_name;
    use crate::state::{IndexMetadata, NodeInfo};

    fn sample(version: u64) -> MergedView {
        let node = NodeInfo::new("node_1", "10.0.0.1:9300");
        let merged = merged_node_name(&node.name, "c1");
        let nodes = BTreeMap::from([(
            merged.clone(),
            RemoteNode {
                name: merged,
                original_name: node.name.clone(),
                cluster: "c1".to_string(),
                address: node.address.clone(),
                roles: node.roles.clone(),
            },
        )]);
        let indices = BTreeMap::from([
            (
                "test1".to_string(),
                IndexRecord::from_metadata("c1", &IndexMetadata::new("test1")),
            ),
            (
                "test2".to_string(),
                IndexRecord::from_metadata("c2", &IndexMetadata::new("test2")),
            ),
        ]);
        let members = BTreeMap::from([
            ("c1".to_string(), MemberState::Synced),
            ("c2".to_string(), MemberState::Synced),
        ]);
        MergedView::new(version, "tribe_node".to_string(), nodes, indices, members)
    }

    #[test]
    fn test_empty_view() {
        let view = MergedView::empty("tribe_node");
        assert_eq!(view.version(), 0);
        assert_eq!(view.node_names(), vec!["tribe_node".to_string()]);
        assert!(view.index_names().is_empty());
    }

    #[test]
    fn test_lookups() {
        let view = sample(3);
        assert!(view.has_index("test1"));
        assert_eq!(view.owner_of("test2"), Some("c2"));
        assert_eq!(view.owner_of("missing"), None);
        assert_eq!(view.node("node_1/c1").unwrap().original_name, "node_1");
        assert_eq!(view.node_names(), vec!["tribe_node", "node_1/c1"]);
        assert_eq!(view.owning_members(), vec!["c1", "c2"]);
        assert_eq!(view.member_state("c1"), Some(MemberState::Synced));
    }

    #[test]
    fn test_same_content_ignores_version() {
        assert!(sample(1).same_content(&sample(2)));
        assert_ne!(sample(1), sample(2));
    }

    #[test]
    fn test_view_serializes() {
        let json = serde_json::to_value(sample(5)).unwrap();
        assert_eq!(json["version"], 5);
        assert_eq!(json["indices"]["test1"]["settings"]["tribe.name"], "c1");
    }
}
