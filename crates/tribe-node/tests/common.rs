//! Shared fixtures for the tribe node integration tests.

#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tribe_node::sim::{SimCluster, SimConnector};
use tribe_node::{MergedView, Operation, RemoteConfig, TribeConfig, TribeNode};

/// Upper bound for any wait on the merged view.
pub const WAIT: Duration = Duration::from_secs(10);

/// Two in-process member clusters, reachable as `t1` and `t2`.
pub struct TestClusters {
    pub c1: SimCluster,
    pub c2: SimCluster,
    pub connector: Arc<SimConnector>,
}

impl TestClusters {
    /// `cluster_1` with nodes `node_1`, `node_2`; `cluster_2` with `node_1`, `node_2`.
    pub fn new() -> Self {
        let c1 = SimCluster::new("cluster_1").with_nodes(&["node_1", "node_2"]);
        let c2 = SimCluster::new("cluster_2").with_nodes(&["node_1", "node_2"]);
        let connector = SimConnector::new();
        connector.add("t1", c1.clone());
        connector.add("t2", c2.clone());
        Self {
            c1,
            c2,
            connector: Arc::new(connector),
        }
    }

    /// Start a tribe node joining `aliases`, after `customize` adjusts its config.
    pub async fn tribe<F>(&self, aliases: &[&str], customize: F) -> TribeNode
    where
        F: FnOnce(&mut TribeConfig),
    {
        let mut config = fast_config(aliases);
        customize(&mut config);
        TribeNode::start(config, self.connector.clone())
            .await
            .expect("tribe node starts")
    }
}

/// Config with short reconnect delays, joining `aliases`.
pub fn fast_config(aliases: &[&str]) -> TribeConfig {
    let mut config = aliases.iter().fold(TribeConfig::default(), |c, alias| {
        c.with_remote(RemoteConfig::new(alias, &["127.0.0.1:9300"]))
    });
    config.initial_state_timeout_ms = 5000;
    config.link.reconnect_delay_ms = 5;
    config.link.max_reconnect_delay_ms = 50;
    config.link.jitter = false;
    config
}

/// Wait for the view to satisfy `pred`; panics on timeout.
pub async fn wait_view<F>(node: &TribeNode, pred: F) -> Arc<MergedView>
where
    F: Fn(&MergedView) -> bool,
{
    node.wait_for(WAIT, pred)
        .await
        .unwrap_or_else(|| panic!("view never converged, last: {:?}", node.view()))
}

/// Index a `type1` document into `index`.
pub fn index_doc(index: &str) -> Operation {
    Operation::Index {
        index: index.to_string(),
        doc_type: "type1".to_string(),
        id: Some("1".to_string()),
        source: json!({"field1": "value1"}),
    }
}

/// Read document `1` of `type1` back from `index`.
pub fn get_doc(index: &str) -> Operation {
    Operation::Get {
        index: index.to_string(),
        doc_type: "type1".to_string(),
        id: "1".to_string(),
    }
}
