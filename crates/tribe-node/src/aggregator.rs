//! The state aggregator: folds member events into the merged view.
//!
//! All merges go through a single task draining one queue, so view
//! transitions never interleave. The current view sits behind an
//! [`ArcSwap`]; readers load it without locking and keep whatever snapshot
//! they loaded for as long as they need it.

use crate::conflict::{ConflictPolicy, ConflictResolver};
use crate::error::{Result, TribeError};
use crate::link::LinkEvent;
use crate::namespace::merged_node_name;
use crate::state::{ClusterFacts, IndexRecord, MemberState, NodeRole, RemoteNode};
use crate::view::MergedView;
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Address reported for the tribe node's own client membership.
pub const LOCAL_ADDRESS: &str = "local";

/// Message accepted by the aggregator task.
#[derive(Debug)]
pub enum AggregatorCommand {
    /// Declare a configured member cluster (starts `disconnected`).
    Register {
        /// Member alias.
        alias: String,
    },
    /// An event from a member's link.
    Event {
        /// Member alias.
        alias: String,
        /// The event.
        event: LinkEvent,
    },
    /// Stop the aggregator task.
    Shutdown,
}

/// Sending side of the aggregator queue, cloned into every link.
pub type EventSender = mpsc::Sender<AggregatorCommand>;

#[derive(Debug, Default)]
struct AggregatorStatsInner {
    events_received: AtomicU64,
    views_published: AtomicU64,
    merges_skipped: AtomicU64,
    events_ignored: AtomicU64,
}

/// Aggregator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Events received from links.
    pub events_received: u64,
    /// Views published (version bumps).
    pub views_published: u64,
    /// Merges that produced no change.
    pub merges_skipped: u64,
    /// Events dropped (delta without baseline, unknown member).
    pub events_ignored: u64,
}

#[derive(Debug, Default)]
struct MemberRecord {
    state: MemberState,
    facts: Option<ClusterFacts>,
}

/// Owns per-member facts and the published merged view.
pub struct StateAggregator {
    local_node: String,
    resolver: ConflictResolver,
    members: BTreeMap<String, MemberRecord>,
    contested: BTreeSet<String>,
    excluded: BTreeSet<String>,
    view: Arc<ArcSwap<MergedView>>,
    stats: Arc<AggregatorStatsInner>,
}

impl StateAggregator {
    /// Create an aggregator publishing the empty view.
    pub fn new(local_node: &str, policy: ConflictPolicy) -> Self {
        Self {
            local_node: local_node.to_string(),
            resolver: ConflictResolver::new(policy),
            members: BTreeMap::new(),
            contested: BTreeSet::new(),
            excluded: BTreeSet::new(),
            view: Arc::new(ArcSwap::from_pointee(MergedView::empty(local_node))),
            stats: Arc::new(AggregatorStatsInner::default()),
        }
    }

    /// The currently published view.
    pub fn current(&self) -> Arc<MergedView> {
        self.view.load_full()
    }

    /// Counters snapshot.
    pub fn stats(&self) -> AggregatorStats {
        self.stats.snapshot()
    }

    /// Declare a member cluster. Returns the new view if it changed.
    pub fn register(&mut self, alias: &str) -> Option<Arc<MergedView>> {
        if self.members.contains_key(alias) {
            return None;
        }
        self.members.insert(alias.to_string(), MemberRecord::default());
        self.merge()
    }

    /// Apply one event from a member. Returns the new view if it changed.
    pub fn on_event(&mut self, alias: &str, event: LinkEvent) -> Option<Arc<MergedView>> {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        if !self.members.contains_key(alias) {
            match event {
                LinkEvent::Connecting | LinkEvent::Resync(_) => {
                    self.members.insert(alias.to_string(), MemberRecord::default());
                }
                _ => {
                    debug!(alias = %alias, "ignoring event for unknown member");
                    self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        match event {
            LinkEvent::Connecting => {
                if let Some(member) = self.members.get_mut(alias) {
                    member.state = MemberState::Connecting;
                    member.facts = None;
                }
            }
            LinkEvent::Resync(facts) => {
                debug!(
                    alias = %alias,
                    version = facts.version,
                    nodes = facts.nodes.len(),
                    indices = facts.indices.len(),
                    "member resynced"
                );
                if let Some(member) = self.members.get_mut(alias) {
                    member.state = MemberState::Synced;
                    member.facts = Some(facts);
                }
            }
            LinkEvent::Delta(delta) => {
                let applied = match self.members.get_mut(alias) {
                    Some(MemberRecord {
                        state: MemberState::Synced,
                        facts: Some(facts),
                    }) => {
                        facts.apply(&delta);
                        true
                    }
                    _ => false,
                };
                if !applied {
                    debug!(alias = %alias, "ignoring delta without a synced baseline");
                    self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
            LinkEvent::Unreachable { reason } => {
                warn!(alias = %alias, reason = %reason, "member cluster unreachable");
                if let Some(member) = self.members.get_mut(alias) {
                    member.state = MemberState::Disconnected;
                    member.facts = None;
                }
            }
            LinkEvent::Closed => {
                info!(alias = %alias, "member cluster removed");
                self.members.remove(alias);
            }
        }

        self.merge()
    }

    /// Recompute the view from the latest facts of every synced member and
    /// publish it if its content changed.
    fn merge(&mut self) -> Option<Arc<MergedView>> {
        let synced: Vec<(&str, &ClusterFacts)> = self
            .members
            .iter()
            .filter_map(|(alias, m)| m.facts.as_ref().map(|f| (alias.as_str(), f)))
            .collect();

        let mut nodes = BTreeMap::new();
        for (alias, facts) in &synced {
            // The tribe node itself is a client member of every synced cluster.
            let client = merged_node_name(&self.local_node, alias);
            nodes.insert(
                client.clone(),
                RemoteNode {
                    name: client,
                    original_name: self.local_node.clone(),
                    cluster: alias.to_string(),
                    address: LOCAL_ADDRESS.to_string(),
                    roles: BTreeSet::from([NodeRole::Client]),
                },
            );
            for node in facts.nodes.values() {
                let name = merged_node_name(&node.name, alias);
                nodes.insert(
                    name.clone(),
                    RemoteNode {
                        name,
                        original_name: node.name.clone(),
                        cluster: alias.to_string(),
                        address: node.address.clone(),
                        roles: node.roles.clone(),
                    },
                );
            }
        }

        let resolution = self.resolver.resolve(synced.iter().copied(), &self.contested);
        let indices: BTreeMap<String, IndexRecord> = resolution
            .winners
            .iter()
            .map(|(name, (alias, meta))| (name.to_string(), IndexRecord::from_metadata(alias, meta)))
            .collect();

        let excluded: BTreeSet<String> =
            resolution.exclusions.iter().map(|e| e.index.clone()).collect();
        for exclusion in &resolution.exclusions {
            if !self.excluded.contains(&exclusion.index) {
                warn!(
                    index = %exclusion.index,
                    claimants = ?exclusion.claimants,
                    policy = %self.resolver.policy(),
                    "index excluded from merged view by conflict policy"
                );
            }
        }
        for name in self.excluded.difference(&excluded) {
            debug!(index = %name, "index no longer excluded by conflict policy");
        }
        let contested = resolution.contested;

        let members = self
            .members
            .iter()
            .map(|(alias, m)| (alias.clone(), m.state))
            .collect();

        self.contested = contested;
        self.excluded = excluded;

        let current = self.view.load();
        let next = MergedView::new(
            current.version() + 1,
            self.local_node.clone(),
            nodes,
            indices,
            members,
        );
        if next.same_content(&current) {
            self.stats.merges_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let next = Arc::new(next);
        self.view.store(Arc::clone(&next));
        self.stats.views_published.fetch_add(1, Ordering::Relaxed);
        debug!(
            version = next.version(),
            nodes = next.node_count(),
            indices = next.index_names().len(),
            "published merged view"
        );
        Some(next)
    }

    /// Move the aggregator into a background task.
    pub fn start(self, capacity: usize) -> AggregatorHandle {
        let (sender, receiver) = mpsc::channel(capacity);
        let (version_tx, version_rx) = watch::channel(self.current().version());
        let handle = AggregatorHandle {
            sender,
            view: Arc::clone(&self.view),
            versions: version_rx,
            stats: Arc::clone(&self.stats),
        };
        tokio::spawn(self.run(receiver, version_tx));
        handle
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<AggregatorCommand>,
        versions: watch::Sender<u64>,
    ) {
        while let Some(command) = rx.recv().await {
            let published = match command {
                AggregatorCommand::Register { alias } => self.register(&alias),
                AggregatorCommand::Event { alias, event } => self.on_event(&alias, event),
                AggregatorCommand::Shutdown => break,
            };
            if let Some(view) = published {
                let _ = versions.send(view.version());
            }
        }
        debug!("aggregator stopped");
    }
}

impl AggregatorStatsInner {
    fn snapshot(&self) -> AggregatorStats {
        AggregatorStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            views_published: self.views_published.load(Ordering::Relaxed),
            merges_skipped: self.merges_skipped.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running aggregator.
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: EventSender,
    view: Arc<ArcSwap<MergedView>>,
    versions: watch::Receiver<u64>,
    stats: Arc<AggregatorStatsInner>,
}

impl AggregatorHandle {
    /// Queue sender for links.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// The currently published view.
    pub fn view(&self) -> Arc<MergedView> {
        self.view.load_full()
    }

    /// Counters snapshot.
    pub fn stats(&self) -> AggregatorStats {
        self.stats.snapshot()
    }

    /// Watch receiver yielding each published version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.versions.clone()
    }

    /// Declare a member cluster.
    pub async fn register(&self, alias: &str) -> Result<()> {
        self.send(AggregatorCommand::Register {
            alias: alias.to_string(),
        })
        .await
    }

    /// Submit an event on behalf of a member.
    pub async fn submit(&self, alias: &str, event: LinkEvent) -> Result<()> {
        self.send(AggregatorCommand::Event {
            alias: alias.to_string(),
            event,
        })
        .await
    }

    /// Stop the aggregator task.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(AggregatorCommand::Shutdown).await;
    }

    /// Wait until the published view satisfies `pred`, or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<Arc<MergedView>>
    where
        F: Fn(&MergedView) -> bool,
    {
        let mut versions = self.versions.clone();
        let wait = async {
            loop {
                let view = self.view();
                if pred(view.as_ref()) {
                    return Some(view);
                }
                if versions.changed().await.is_err() {
                    let view = self.view();
                    return pred(view.as_ref()).then_some(view);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    async fn send(&self, command: AggregatorCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| TribeError::Shutdown)
    }
}
