//! Node name namespacing.
//!
//! Node names are only unique inside their own cluster, so every node in the
//! merged view is exposed as `<node>/<alias>`. Index names are never renamed.

/// Separator between the node name and the member cluster alias.
pub const SEPARATOR: char = '/';

/// Name under which a remote node appears in the merged view.
pub fn merged_node_name(node_name: &str, alias: &str) -> String {
    let mut name = String::with_capacity(node_name.len() + alias.len() + 1);
    name.push_str(node_name);
    name.push(SEPARATOR);
    name.push_str(alias);
    name
}

/// Split a merged node name back into `(node_name, alias)`.
///
/// Splits on the last separator since aliases never contain one.
pub fn split_merged_name(merged: &str) -> Option<(&str, &str)> {
    let (node, alias) = merged.rsplit_once(SEPARATOR)?;
    if node.is_empty() || alias.is_empty() {
        return None;
    }
    Some((node, alias))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_name_appends_alias() {
        assert_eq!(merged_node_name("node_1", "cluster_1"), "node_1/cluster_1");
    }

    #[test]
    fn test_same_node_name_differs_across_clusters() {
        assert_ne!(
            merged_node_name("node_1", "cluster_1"),
            merged_node_name("node_1", "cluster_2")
        );
    }

    #[test]
    fn test_split_round_trip() {
        let merged = merged_node_name("tribe_node", "cluster_2");
        assert_eq!(split_merged_name(&merged), Some(("tribe_node", "cluster_2")));
    }

    #[test]
    fn test_split_keeps_slashes_in_node_name() {
        assert_eq!(split_merged_name("rack/a/node/c1"), Some(("rack/a/node", "c1")));
    }

    #[test]
    fn test_split_rejects_bare_names() {
        assert_eq!(split_merged_name("node_1"), None);
        assert_eq!(split_merged_name("node_1/"), None);
        assert_eq!(split_merged_name("/c1"), None);
    }
}
