//! Facts observed on member clusters and the records exposed in the merged view.
//!
//! A member cluster publishes its full state as [`ClusterFacts`]. Links turn
//! consecutive publications into [`StateDelta`]s; the aggregator folds them
//! back into per-member facts before merging.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Setting injected into every merged index, naming the owning member cluster.
pub const TRIBE_NAME_SETTING: &str = "tribe.name";

/// Role a node plays inside its own cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Holds shard data.
    Data,
    /// Eligible for its cluster's master election.
    Master,
    /// Coordinating-only client node.
    Client,
}

/// A node as reported by its own cluster (bare name, no alias).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name, unique only within its own cluster.
    pub name: String,
    /// Transport address, e.g. "10.0.0.1:9300".
    pub address: String,
    /// Roles of the node.
    #[serde(default)]
    pub roles: BTreeSet<NodeRole>,
}

impl NodeInfo {
    /// Create a data node.
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            roles: BTreeSet::from([NodeRole::Data]),
        }
    }

    /// Replace the node roles.
    pub fn with_roles(mut self, roles: &[NodeRole]) -> Self {
        self.roles = roles.iter().copied().collect();
        self
    }
}

/// Open/closed status of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// Index accepts reads and writes.
    #[default]
    Open,
    /// Index is closed on its cluster.
    Closed,
}

/// Index metadata as reported by its own cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index name.
    pub name: String,
    /// Mapping definitions, type name to schema.
    #[serde(default)]
    pub mappings: BTreeMap<String, serde_json::Value>,
    /// Index settings.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Open/closed status.
    #[serde(default)]
    pub state: IndexState,
}

impl IndexMetadata {
    /// Create an open index with no mappings and no settings.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mappings: BTreeMap::new(),
            settings: BTreeMap::new(),
            state: IndexState::Open,
        }
    }

    /// Add a mapping for a type.
    pub fn with_mapping(mut self, doc_type: &str, schema: serde_json::Value) -> Self {
        self.mappings.insert(doc_type.to_string(), schema);
        self
    }

    /// Add a setting.
    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the open/closed status.
    pub fn with_state(mut self, state: IndexState) -> Self {
        self.state = state;
        self
    }
}

/// One full state publication of a member cluster.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterFacts {
    /// Version of the member's own cluster state.
    pub version: u64,
    /// Nodes by bare name.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeInfo>,
    /// Indices by name.
    #[serde(default)]
    pub indices: BTreeMap<String, IndexMetadata>,
}

impl ClusterFacts {
    /// Create empty facts at the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            nodes: BTreeMap::new(),
            indices: BTreeMap::new(),
        }
    }

    /// Add a node.
    pub fn with_node(mut self, node: NodeInfo) -> Self {
        self.nodes.insert(node.name.clone(), node);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexMetadata) -> Self {
        self.indices.insert(index.name.clone(), index);
        self
    }

    /// Compute the delta that turns `self` into `newer`.
    pub fn diff(&self, newer: &ClusterFacts) -> StateDelta {
        let added_nodes = newer
            .nodes
            .values()
            .filter(|n| self.nodes.get(&n.name) != Some(*n))
            .cloned()
            .collect();
        let removed_nodes = self
            .nodes
            .keys()
            .filter(|name| !newer.nodes.contains_key(*name))
            .cloned()
            .collect();
        let upserted_indices = newer
            .indices
            .values()
            .filter(|i| self.indices.get(&i.name) != Some(*i))
            .cloned()
            .collect();
        let removed_indices = self
            .indices
            .keys()
            .filter(|name| !newer.indices.contains_key(*name))
            .cloned()
            .collect();

        StateDelta {
            version: newer.version,
            added_nodes,
            removed_nodes,
            upserted_indices,
            removed_indices,
        }
    }

    /// Apply a delta in place.
    pub fn apply(&mut self, delta: &StateDelta) {
        for name in &delta.removed_nodes {
            self.nodes.remove(name);
        }
        for node in &delta.added_nodes {
            self.nodes.insert(node.name.clone(), node.clone());
        }
        for name in &delta.removed_indices {
            self.indices.remove(name);
        }
        for index in &delta.upserted_indices {
            self.indices.insert(index.name.clone(), index.clone());
        }
        self.version = delta.version;
    }
}

/// Changes between two consecutive publications of one member cluster.
///
/// `added_nodes` and `upserted_indices` carry upsert semantics: an entry
/// whose content changed is reported again in full.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateDelta {
    /// Member state version after the change.
    pub version: u64,
    /// Nodes that appeared or changed.
    pub added_nodes: Vec<NodeInfo>,
    /// Names of nodes that left.
    pub removed_nodes: Vec<String>,
    /// Indices that appeared or changed.
    pub upserted_indices: Vec<IndexMetadata>,
    /// Names of indices that were deleted.
    pub removed_indices: Vec<String>,
}

impl StateDelta {
    /// True if the delta carries no node or index change.
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.upserted_indices.is_empty()
            && self.removed_indices.is_empty()
    }
}

/// Link state of a member cluster as seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    /// No live connection.
    #[default]
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and holding a full copy of the member's state.
    Synced,
}

/// A node in the merged view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Namespaced name, `<original_name>/<cluster>`.
    pub name: String,
    /// Name inside the owning cluster.
    pub original_name: String,
    /// Alias of the owning member cluster.
    pub cluster: String,
    /// Transport address.
    pub address: String,
    /// Roles inside the owning cluster.
    pub roles: BTreeSet<NodeRole>,
}

/// An index in the merged view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Bare index name.
    pub name: String,
    /// Alias of the owning member cluster.
    pub cluster: String,
    /// Mapping definitions, type name to schema.
    pub mappings: BTreeMap<String, serde_json::Value>,
    /// Settings, including [`TRIBE_NAME_SETTING`].
    pub settings: BTreeMap<String, String>,
    /// Open/closed status.
    pub state: IndexState,
}

impl IndexRecord {
    /// Build the merged record for an index owned by `cluster`.
    pub fn from_metadata(cluster: &str, meta: &IndexMetadata) -> Self {
        let mut settings = meta.settings.clone();
        settings.insert(TRIBE_NAME_SETTING.to_string(), cluster.to_string());
        Self {
            name: meta.name.clone(),
            cluster: cluster.to_string(),
            mappings: meta.mappings.clone(),
            settings,
            state: meta.state,
        }
    }

    /// Value of the `tribe.name` setting.
    pub fn tribe_name(&self) -> Option<&str> {
        self.settings.get(TRIBE_NAME_SETTING).map(String::as_str)
    }

    /// Mapping for a type, if present.
    pub fn mapping(&self, doc_type: &str) -> Option<&serde_json::Value> {
        self.mappings.get(doc_type)
    }

    /// True if the index is open.
    pub fn is_open(&self) -> bool {
        self.state == IndexState::Open
    }
}
