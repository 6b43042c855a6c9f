//! The tribe node service.
//!
//! [`TribeNode`] wires the configuration, one link per member cluster, the
//! aggregator and the request router together.

use crate::aggregator::{AggregatorHandle, AggregatorStats, StateAggregator};
use crate::blocks::BlockPolicy;
use crate::config::{RemoteConfig, TribeConfig};
use crate::error::{Result, TribeError};
use crate::health::HealthReport;
use crate::link::{ClusterConnector, LinkHandle, LinkStats, RemoteClusterLink};
use crate::router::{Operation, RequestRouter, RouteTarget, RouterStats};
use crate::state::MemberState;
use crate::view::MergedView;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// A running tribe node.
pub struct TribeNode {
    config: TribeConfig,
    connector: Arc<dyn ClusterConnector>,
    aggregator: AggregatorHandle,
    router: RequestRouter,
    links: Mutex<HashMap<String, LinkHandle>>,
}

impl TribeNode {
    /// Start the node: validate the configuration, open a link per member and
    /// wait up to `initial_state_timeout` for every member to sync.
    ///
    /// Members still unsynced when the wait ends are logged and keep
    /// connecting in the background.
    pub async fn start(config: TribeConfig, connector: Arc<dyn ClusterConnector>) -> Result<Self> {
        config.validate()?;
        let blocks = BlockPolicy::new(&config.blocks)?;
        let aggregator = StateAggregator::new(&config.node_name, config.on_conflict.clone())
            .start(config.link.channel_capacity);
        let router = RequestRouter::new(blocks, aggregator.clone());

        let node = Self {
            config,
            connector,
            aggregator,
            router,
            links: Mutex::new(HashMap::new()),
        };

        let remotes = node.config.remotes.clone();
        for remote in &remotes {
            node.add_member(remote).await?;
        }

        let aliases: Vec<String> = remotes.iter().map(|r| r.alias.clone()).collect();
        if node
            .wait_for_members(&aliases, node.config.initial_state_timeout())
            .await
        {
            info!(
                node = %node.config.node_name,
                members = aliases.len(),
                "tribe node started, all members synced"
            );
        } else {
            let health = node.health();
            warn!(
                node = %node.config.node_name,
                timeout_ms = node.config.initial_state_timeout_ms,
                unsynced = ?health.unsynced(),
                "tribe node started before every member synced"
            );
        }

        Ok(node)
    }

    /// Join a member cluster at runtime.
    pub async fn add_member(&self, remote: &RemoteConfig) -> Result<()> {
        let mut links = self.links.lock().await;
        if links.contains_key(&remote.alias) {
            return Err(TribeError::Config {
                reason: format!("member [{}] already joined", remote.alias),
            });
        }

        let client = self.connector.client(&remote.alias, &remote.seeds)?;
        self.router.add_client(&remote.alias, client).await;
        self.aggregator.register(&remote.alias).await?;

        let link = RemoteClusterLink::spawn(
            &remote.alias,
            remote.seeds.clone(),
            self.config.link.clone(),
            Arc::clone(&self.connector),
            self.aggregator.sender(),
        );
        links.insert(remote.alias.clone(), link);
        info!(alias = %remote.alias, seeds = ?remote.seeds, "joining member cluster");
        Ok(())
    }

    /// Leave a member cluster; its nodes and indices leave the view.
    /// Returns false if the member was not joined.
    pub async fn remove_member(&self, alias: &str) -> bool {
        let link = self.links.lock().await.remove(alias);
        let Some(link) = link else {
            return false;
        };
        link.close().await;
        self.router.remove_client(alias).await;
        info!(alias = %alias, "left member cluster");
        true
    }

    /// Node configuration.
    pub fn config(&self) -> &TribeConfig {
        &self.config
    }

    /// The current merged view.
    pub fn view(&self) -> Arc<MergedView> {
        self.aggregator.view()
    }

    /// Federation health at the current view.
    pub fn health(&self) -> HealthReport {
        HealthReport::from_view(&self.view())
    }

    /// Watch receiver yielding each published view version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.aggregator.subscribe()
    }

    /// Wait until the view satisfies `pred`, or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<Arc<MergedView>>
    where
        F: Fn(&MergedView) -> bool,
    {
        self.aggregator.wait_for(timeout, pred).await
    }

    /// Wait until every alias in `aliases` is synced. Returns false on timeout.
    pub async fn wait_for_members(&self, aliases: &[String], timeout: Duration) -> bool {
        self.wait_for(timeout, |view| {
            aliases
                .iter()
                .all(|alias| view.member_state(alias) == Some(MemberState::Synced))
        })
        .await
        .is_some()
    }

    /// Decide where an operation would go, without forwarding it.
    pub fn route(&self, op: &Operation) -> Result<RouteTarget> {
        self.router.route(op)
    }

    /// Submit an operation; returns the owning member's response unchanged.
    pub async fn execute(&self, op: Operation) -> Result<Value> {
        self.router.execute(op).await
    }

    /// Per-member link counters.
    pub async fn link_stats(&self) -> BTreeMap<String, LinkStats> {
        self.links
            .lock()
            .await
            .iter()
            .map(|(alias, link)| (alias.clone(), link.stats()))
            .collect()
    }

    /// Aggregator counters.
    pub fn aggregator_stats(&self) -> AggregatorStats {
        self.aggregator.stats()
    }

    /// Router counters.
    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Close every link and stop the aggregator.
    pub async fn shutdown(&self) {
        let links: Vec<LinkHandle> = self.links.lock().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.close().await;
        }
        self.aggregator.shutdown().await;
        info!(node = %self.config.node_name, "tribe node stopped");
    }
}
