//! Request routing.
//!
//! Every request entering the tribe node is classified, checked against the
//! block policy and forwarded to the member cluster that owns its index in
//! the current merged view. Operations that need a master are rejected
//! outright: the tribe node never has one and never waits for one.

use crate::aggregator::AggregatorHandle;
use crate::blocks::{BlockPolicy, OperationKind};
use crate::error::{Result, TribeError};
use crate::view::MergedView;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A request against the merged view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Index a document.
    Index {
        /// Target index.
        index: String,
        /// Mapping type of the document.
        doc_type: String,
        /// Document id; the owner assigns one if absent.
        #[serde(default)]
        id: Option<String>,
        /// Document body.
        source: Value,
    },
    /// Delete a document.
    Delete {
        /// Target index.
        index: String,
        /// Mapping type of the document.
        doc_type: String,
        /// Document id.
        id: String,
    },
    /// Fetch a document.
    Get {
        /// Target index.
        index: String,
        /// Mapping type of the document.
        doc_type: String,
        /// Document id.
        id: String,
    },
    /// Search one index, or every index in the view when `index` is absent.
    Search {
        /// Target index.
        #[serde(default)]
        index: Option<String>,
        /// Query body, passed through unchanged.
        #[serde(default)]
        query: Value,
    },
    /// Add or update a mapping type.
    PutMapping {
        /// Target index.
        index: String,
        /// Mapping type.
        doc_type: String,
        /// Mapping definition.
        mapping: Value,
    },
    /// Merge an index's segments.
    ForceMerge {
        /// Target index.
        index: String,
    },
    /// Close an index.
    Close {
        /// Target index.
        index: String,
    },
    /// Reopen a closed index.
    Open {
        /// Target index.
        index: String,
    },
    /// Create an index. Needs a master.
    CreateIndex {
        /// Index to create.
        index: String,
    },
    /// Delete an index. Needs a master.
    DeleteIndex {
        /// Index to delete.
        index: String,
    },
    /// Update cluster-wide settings. Needs a master.
    UpdateClusterSettings {
        /// Settings to apply.
        settings: BTreeMap<String, String>,
    },
}

impl Operation {
    /// Operation name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Index { .. } => "index",
            Operation::Delete { .. } => "delete",
            Operation::Get { .. } => "get",
            Operation::Search { .. } => "search",
            Operation::PutMapping { .. } => "put_mapping",
            Operation::ForceMerge { .. } => "force_merge",
            Operation::Close { .. } => "close",
            Operation::Open { .. } => "open",
            Operation::CreateIndex { .. } => "create_index",
            Operation::DeleteIndex { .. } => "delete_index",
            Operation::UpdateClusterSettings { .. } => "update_cluster_settings",
        }
    }

    /// Classification used by the block policy.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Index { .. } | Operation::Delete { .. } => OperationKind::Write,
            Operation::Get { .. } | Operation::Search { .. } => OperationKind::Read,
            Operation::PutMapping { .. }
            | Operation::ForceMerge { .. }
            | Operation::Close { .. }
            | Operation::Open { .. }
            | Operation::CreateIndex { .. }
            | Operation::DeleteIndex { .. }
            | Operation::UpdateClusterSettings { .. } => OperationKind::MetadataChange,
        }
    }

    /// Target index, if the operation is index-scoped.
    pub fn index(&self) -> Option<&str> {
        match self {
            Operation::Index { index, .. }
            | Operation::Delete { index, .. }
            | Operation::Get { index, .. }
            | Operation::PutMapping { index, .. }
            | Operation::ForceMerge { index }
            | Operation::Close { index }
            | Operation::Open { index }
            | Operation::CreateIndex { index }
            | Operation::DeleteIndex { index } => Some(index.as_str()),
            Operation::Search { index, .. } => index.as_deref(),
            Operation::UpdateClusterSettings { .. } => None,
        }
    }

    /// True for operations that only a master can perform.
    pub fn requires_coordinator(&self) -> bool {
        matches!(
            self,
            Operation::CreateIndex { .. }
                | Operation::DeleteIndex { .. }
                | Operation::UpdateClusterSettings { .. }
        )
    }
}

/// Where an admitted operation goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// The single member owning the target index.
    Member(String),
    /// Every member owning at least one index.
    FanOut(Vec<String>),
}

/// Client side of a member cluster's request interface.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Send an operation to the member and return its response unchanged.
    async fn forward(&self, op: &Operation) -> Result<Value>;
}

#[derive(Debug, Default)]
struct RouterStatsInner {
    forwarded: AtomicU64,
    rejected: AtomicU64,
    fan_outs: AtomicU64,
}

/// Router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Operations forwarded to a member (fan-out legs count individually).
    pub forwarded: u64,
    /// Operations rejected before reaching a member.
    pub rejected: u64,
    /// Fan-out searches.
    pub fan_outs: u64,
}

/// Routes operations against the current merged view.
pub struct RequestRouter {
    blocks: BlockPolicy,
    views: AggregatorHandle,
    clients: RwLock<HashMap<String, Arc<dyn RemoteClient>>>,
    stats: RouterStatsInner,
}

impl RequestRouter {
    /// Create a router reading views from `views`.
    pub fn new(blocks: BlockPolicy, views: AggregatorHandle) -> Self {
        Self {
            blocks,
            views,
            clients: RwLock::new(HashMap::new()),
            stats: RouterStatsInner::default(),
        }
    }

    /// Register the client used to reach a member.
    pub async fn add_client(&self, alias: &str, client: Arc<dyn RemoteClient>) {
        self.clients.write().await.insert(alias.to_string(), client);
    }

    /// Forget a member's client.
    pub async fn remove_client(&self, alias: &str) -> bool {
        self.clients.write().await.remove(alias).is_some()
    }

    /// Counters snapshot.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            fan_outs: self.stats.fan_outs.load(Ordering::Relaxed),
        }
    }

    /// Decide where `op` goes using the current view.
    pub fn route(&self, op: &Operation) -> Result<RouteTarget> {
        let view = self.views.view();
        route_in(&self.blocks, &view, op)
    }

    /// Route `op` and forward it, returning the owner's response unchanged.
    ///
    /// A fan-out search returns the merged hits plus each member's response
    /// keyed by alias.
    pub async fn execute(&self, op: Operation) -> Result<Value> {
        let target = match self.route(&op) {
            Ok(target) => target,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(op = op.name(), index = ?op.index(), code = e.code(), "operation rejected");
                return Err(e);
            }
        };

        match target {
            RouteTarget::Member(alias) => {
                let client = self.client(&alias).await?;
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                debug!(op = op.name(), alias = %alias, "forwarding operation");
                client.forward(&op).await
            }
            RouteTarget::FanOut(aliases) => self.fan_out(op, aliases).await,
        }
    }

    async fn fan_out(&self, op: Operation, aliases: Vec<String>) -> Result<Value> {
        self.stats.fan_outs.fetch_add(1, Ordering::Relaxed);
        let op = Arc::new(op);
        let mut members = Map::new();
        let mut tasks = JoinSet::new();
        for alias in aliases {
            let client = match self.client(&alias).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(alias = %alias, error = %e, "fan-out leg has no client");
                    members.insert(alias, error_body(&e));
                    continue;
                }
            };
            let op = Arc::clone(&op);
            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            tasks.spawn(async move {
                let response = client.forward(&op).await;
                (alias, response)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (alias, response) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "fan-out task failed");
                    continue;
                }
            };
            let value = match response {
                Ok(value) => value,
                Err(e) => {
                    warn!(alias = %alias, error = %e, "fan-out leg failed");
                    error_body(&e)
                }
            };
            members.insert(alias, value);
        }

        Ok(merge_hits(members))
    }

    async fn client(&self, alias: &str) -> Result<Arc<dyn RemoteClient>> {
        self.clients
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| TribeError::RemoteUnreachable {
                alias: alias.to_string(),
                msg: "no client registered".to_string(),
            })
    }
}

/// Route `op` against a given view.
///
/// Order: coordinator-only operations are rejected first, then blocks, then
/// the owner lookup. A blocked write therefore reports the block even when
/// its index does not exist.
pub fn route_in(blocks: &BlockPolicy, view: &MergedView, op: &Operation) -> Result<RouteTarget> {
    if op.requires_coordinator() {
        return Err(TribeError::NoCoordinator {
            operation: op.name().to_string(),
        });
    }

    blocks.check(op.kind(), op.index()).into_result()?;

    let Some(index) = op.index() else {
        return Ok(RouteTarget::FanOut(
            view.owning_members().into_iter().map(String::from).collect(),
        ));
    };

    let record = view.index(index).ok_or_else(|| TribeError::UnknownIndex {
        index: index.to_string(),
    })?;

    if !record.is_open() && !matches!(op, Operation::Open { .. }) {
        return Err(TribeError::IndexClosed {
            index: index.to_string(),
        });
    }

    Ok(RouteTarget::Member(record.cluster.clone()))
}

/// Combine per-member search responses into one hit set.
///
/// Returns `{"hits": {"total", "hits"}, "members": {alias: response}}`;
/// legs without hits (errors included) add nothing to the merged set.
fn merge_hits(members: Map<String, Value>) -> Value {
    let mut total = 0;
    let mut hits = Vec::new();
    for response in members.values() {
        total += response["hits"]["total"].as_u64().unwrap_or(0);
        if let Some(leg) = response["hits"]["hits"].as_array() {
            hits.extend(leg.iter().cloned());
        }
    }
    json!({
        "hits": {"total": total, "hits": hits},
        "members": members,
    })
}

/// JSON body describing a rejection: `{"error": {"code", "reason"}}`.
pub fn error_body(err: &TribeError) -> Value {
    json!({
        "error": {
            "code": err.code(),
            "reason": err.to_string(),
        }
    })
}
