//! In-process member clusters.
//!
//! [`SimCluster`] holds a mutable cluster state and publishes every change
//! over a tokio `watch` channel, the way a real cluster publishes its state
//! to clients. It also answers forwarded requests, keeps documents in memory
//! and adds mapping types dynamically the first time a document of a new
//! type is indexed. A kill switch drops every open connection and refuses
//! new ones until the cluster is restored.

use crate::error::{Result, TribeError};
use crate::link::{ClusterConnector, StateSource};
use crate::router::{Operation, RemoteClient};
use crate::state::{ClusterFacts, IndexMetadata, IndexState, NodeInfo, NodeRole};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
struct Published {
    epoch: u64,
    facts: Option<Arc<ClusterFacts>>,
}

type Documents = BTreeMap<(String, String), Value>;

#[derive(Debug)]
struct SimState {
    facts: ClusterFacts,
    docs: BTreeMap<String, Documents>,
    online: bool,
    epoch: u64,
    next_id: u64,
}

#[derive(Debug)]
struct SimInner {
    name: String,
    state: Mutex<SimState>,
    publish: watch::Sender<Published>,
}

/// An in-memory member cluster.
#[derive(Debug, Clone)]
pub struct SimCluster {
    inner: Arc<SimInner>,
}

impl SimCluster {
    /// Create an online cluster with no nodes and no indices.
    pub fn new(name: &str) -> Self {
        let facts = ClusterFacts::new(1);
        let (publish, _) = watch::channel(Published {
            epoch: 0,
            facts: Some(Arc::new(facts.clone())),
        });
        Self {
            inner: Arc::new(SimInner {
                name: name.to_string(),
                state: Mutex::new(SimState {
                    facts,
                    docs: BTreeMap::new(),
                    online: true,
                    epoch: 0,
                    next_id: 1,
                }),
                publish,
            }),
        }
    }

    /// Add nodes, builder style.
    pub fn with_nodes(self, names: &[&str]) -> Self {
        for name in names {
            self.add_node(name);
        }
        self
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state, including while offline.
    pub fn facts(&self) -> ClusterFacts {
        self.lock().facts.clone()
    }

    /// True unless [`disconnect`](Self::disconnect) was called.
    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Start a node.
    pub fn add_node(&self, name: &str) {
        let address = format!("sim://{}/{}", self.inner.name, name);
        let node = NodeInfo::new(name, &address).with_roles(&[NodeRole::Master, NodeRole::Data]);
        self.mutate(|state| {
            state.facts.nodes.insert(node.name.clone(), node);
            Ok(())
        })
        .unwrap_or_default();
    }

    /// Stop a node. Returns false if it was not running.
    pub fn remove_node(&self, name: &str) -> bool {
        self.mutate(|state| match state.facts.nodes.remove(name) {
            Some(_) => Ok(()),
            None => Err(unknown_node(name)),
        })
        .is_ok()
    }

    /// Create an index.
    pub fn create_index(&self, name: &str) -> Result<()> {
        self.create_index_with(IndexMetadata::new(name))
    }

    /// Create an index from full metadata.
    pub fn create_index_with(&self, meta: IndexMetadata) -> Result<()> {
        self.mutate(|state| {
            if state.facts.indices.contains_key(&meta.name) {
                return Err(TribeError::Config {
                    reason: format!("index [{}] already exists", meta.name),
                });
            }
            state.docs.insert(meta.name.clone(), Documents::new());
            state.facts.indices.insert(meta.name.clone(), meta);
            Ok(())
        })
    }

    /// Delete an index and its documents.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.mutate(|state| {
            state.facts.indices.remove(name).ok_or_else(|| unknown_index(name))?;
            state.docs.remove(name);
            Ok(())
        })
    }

    /// Close an index.
    pub fn close_index(&self, name: &str) -> Result<()> {
        self.set_index_state(name, IndexState::Closed)
    }

    /// Reopen an index.
    pub fn open_index(&self, name: &str) -> Result<()> {
        self.set_index_state(name, IndexState::Open)
    }

    /// Add or replace a mapping type.
    pub fn put_mapping(&self, index: &str, doc_type: &str, mapping: Value) -> Result<()> {
        self.mutate(|state| {
            let meta = state.facts.indices.get_mut(index).ok_or_else(|| unknown_index(index))?;
            meta.mappings.insert(doc_type.to_string(), mapping);
            Ok(())
        })
    }

    /// Number of documents in an index.
    pub fn doc_count(&self, index: &str) -> usize {
        self.lock().docs.get(index).map_or(0, BTreeMap::len)
    }

    /// Drop every open connection and refuse new ones.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        if !state.online {
            return;
        }
        state.online = false;
        state.epoch += 1;
        debug!(cluster = %self.inner.name, "simulated cluster disconnected");
        self.inner.publish.send_replace(Published {
            epoch: state.epoch,
            facts: None,
        });
    }

    /// Accept connections again.
    pub fn restore(&self) {
        let mut state = self.lock();
        if state.online {
            return;
        }
        state.online = true;
        debug!(cluster = %self.inner.name, "simulated cluster restored");
        self.inner.publish.send_replace(Published {
            epoch: state.epoch,
            facts: Some(Arc::new(state.facts.clone())),
        });
    }

    /// Open a state subscription, as a client connecting to the cluster would.
    pub fn subscribe(&self) -> Result<SimStateSource> {
        let rx = self.inner.publish.subscribe();
        let published = rx.borrow().clone();
        if published.facts.is_none() {
            return Err(self.refused());
        }
        Ok(SimStateSource {
            cluster: self.inner.name.clone(),
            rx,
            epoch: published.epoch,
            started: false,
        })
    }

    /// Execute a request the way the cluster's own master and data nodes would.
    pub fn handle(&self, op: &Operation) -> Result<Value> {
        if !self.is_online() {
            return Err(self.refused());
        }

        match op {
            Operation::Index {
                index,
                doc_type,
                id,
                source,
            } => self.mutate(|state| {
                let meta = open_index_mut(&mut state.facts, index)?;
                if !meta.mappings.contains_key(doc_type) {
                    meta.mappings.insert(doc_type.clone(), dynamic_mapping(source));
                }
                let id = match id {
                    Some(id) => id.clone(),
                    None => {
                        state.next_id += 1;
                        format!("auto-{}", state.next_id - 1)
                    }
                };
                let docs = state.docs.entry(index.clone()).or_default();
                let created = docs
                    .insert((doc_type.clone(), id.clone()), source.clone())
                    .is_none();
                Ok(json!({
                    "_index": index,
                    "_type": doc_type,
                    "_id": id,
                    "created": created,
                }))
            }),
            Operation::Delete {
                index,
                doc_type,
                id,
            } => {
                let mut state = self.lock();
                open_index(&state.facts, index)?;
                let found = state
                    .docs
                    .get_mut(index)
                    .and_then(|docs| docs.remove(&(doc_type.clone(), id.clone())))
                    .is_some();
                Ok(json!({"_index": index, "_type": doc_type, "_id": id, "found": found}))
            }
            Operation::Get {
                index,
                doc_type,
                id,
            } => {
                let state = self.lock();
                open_index(&state.facts, index)?;
                let doc = state
                    .docs
                    .get(index)
                    .and_then(|docs| docs.get(&(doc_type.clone(), id.clone())));
                Ok(match doc {
                    Some(source) => json!({
                        "_index": index, "_type": doc_type, "_id": id,
                        "found": true, "_source": source,
                    }),
                    None => json!({"_index": index, "_type": doc_type, "_id": id, "found": false}),
                })
            }
            Operation::Search { index, .. } => {
                let state = self.lock();
                let mut hits = Vec::new();
                for (name, docs) in &state.docs {
                    if index.as_deref().is_some_and(|i| i != name.as_str()) {
                        continue;
                    }
                    if !state.facts.indices.get(name).is_some_and(|m| m.state == IndexState::Open) {
                        continue;
                    }
                    for ((doc_type, id), source) in docs {
                        hits.push(json!({
                            "_index": name, "_type": doc_type, "_id": id, "_source": source,
                        }));
                    }
                }
                if let Some(name) = index {
                    open_index(&state.facts, name)?;
                }
                Ok(json!({"hits": {"total": hits.len(), "hits": hits}}))
            }
            Operation::PutMapping {
                index,
                doc_type,
                mapping,
            } => {
                self.put_mapping(index, doc_type, mapping.clone())?;
                Ok(acknowledged())
            }
            Operation::ForceMerge { index } => {
                open_index(&self.lock().facts, index)?;
                Ok(json!({"_shards": {"failed": 0}}))
            }
            Operation::Close { index } => self.close_index(index).map(|_| acknowledged()),
            Operation::Open { index } => self.open_index(index).map(|_| acknowledged()),
            Operation::CreateIndex { index } => self.create_index(index).map(|_| acknowledged()),
            Operation::DeleteIndex { index } => self.delete_index(index).map(|_| acknowledged()),
            Operation::UpdateClusterSettings { .. } => Ok(acknowledged()),
        }
    }

    fn set_index_state(&self, name: &str, index_state: IndexState) -> Result<()> {
        self.mutate(|state| {
            let meta = state.facts.indices.get_mut(name).ok_or_else(|| unknown_index(name))?;
            meta.state = index_state;
            Ok(())
        })
    }

    /// Apply `f` to the state; on success bump the version and publish.
    fn mutate<T>(&self, f: impl FnOnce(&mut SimState) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let out = f(&mut state)?;
        state.facts.version += 1;
        if state.online {
            self.inner.publish.send_replace(Published {
                epoch: state.epoch,
                facts: Some(Arc::new(state.facts.clone())),
            });
        }
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refused(&self) -> TribeError {
        TribeError::RemoteUnreachable {
            alias: self.inner.name.clone(),
            msg: "connection refused".to_string(),
        }
    }
}

fn acknowledged() -> Value {
    json!({"acknowledged": true})
}

fn unknown_index(name: &str) -> TribeError {
    TribeError::UnknownIndex {
        index: name.to_string(),
    }
}

fn unknown_node(name: &str) -> TribeError {
    TribeError::Config {
        reason: format!("no such node [{}]", name),
    }
}

fn open_index<'a>(facts: &'a ClusterFacts, name: &str) -> Result<&'a IndexMetadata> {
    let meta = facts.indices.get(name).ok_or_else(|| unknown_index(name))?;
    if meta.state != IndexState::Open {
        return Err(TribeError::IndexClosed {
            index: name.to_string(),
        });
    }
    Ok(meta)
}

fn open_index_mut<'a>(facts: &'a mut ClusterFacts, name: &str) -> Result<&'a mut IndexMetadata> {
    let meta = facts.indices.get_mut(name).ok_or_else(|| unknown_index(name))?;
    if meta.state != IndexState::Open {
        return Err(TribeError::IndexClosed {
            index: name.to_string(),
        });
    }
    Ok(meta)
}

/// Mapping inferred from a document's top-level fields.
fn dynamic_mapping(source: &Value) -> Value {
    let mut properties = Map::new();
    if let Value::Object(fields) = source {
        for (field, value) in fields {
            let field_type = match value {
                Value::Bool(_) => "boolean",
                Value::Number(n) if n.is_f64() => "double",
                Value::Number(_) => "long",
                Value::Object(_) => "object",
                _ => "string",
            };
            properties.insert(field.clone(), json!({"type": field_type}));
        }
    }
    json!({"properties": properties})
}

/// State subscription to a [`SimCluster`].
pub struct SimStateSource {
    cluster: String,
    rx: watch::Receiver<Published>,
    epoch: u64,
    started: bool,
}

impl SimStateSource {
    fn current(&mut self) -> Result<ClusterFacts> {
        let published = self.rx.borrow_and_update().clone();
        match published.facts {
            Some(facts) if published.epoch == self.epoch => Ok(facts.as_ref().clone()),
            _ => Err(TribeError::RemoteUnreachable {
                alias: self.cluster.clone(),
                msg: "connection closed by cluster".to_string(),
            }),
        }
    }
}

#[async_trait]
impl StateSource for SimStateSource {
    async fn next_state(&mut self) -> Result<ClusterFacts> {
        if !self.started {
            self.started = true;
            return self.current();
        }
        if self.rx.changed().await.is_err() {
            return Err(TribeError::RemoteUnreachable {
                alias: self.cluster.clone(),
                msg: "cluster stopped".to_string(),
            });
        }
        self.current()
    }
}

type ClusterMap = Arc<RwLock<HashMap<String, SimCluster>>>;

fn lookup(clusters: &ClusterMap, alias: &str) -> Result<SimCluster> {
    clusters
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(alias)
        .cloned()
        .ok_or_else(|| TribeError::RemoteUnreachable {
            alias: alias.to_string(),
            msg: "no cluster at any seed".to_string(),
        })
}

/// Request client for a [`SimCluster`].
///
/// Clients handed out by [`SimConnector`] resolve their cluster on every
/// request, so a member added after the client was created is reachable.
#[derive(Debug, Clone)]
pub struct SimClient {
    alias: String,
    clusters: ClusterMap,
}

impl SimClient {
    /// Client sending requests to `cluster`.
    pub fn new(cluster: SimCluster) -> Self {
        let alias = cluster.name().to_string();
        let clusters = HashMap::from([(alias.clone(), cluster)]);
        Self {
            alias,
            clusters: Arc::new(RwLock::new(clusters)),
        }
    }
}

#[async_trait]
impl RemoteClient for SimClient {
    async fn forward(&self, op: &Operation) -> Result<Value> {
        lookup(&self.clusters, &self.alias)?.handle(op)
    }
}

/// Connector resolving member aliases to in-process clusters.
#[derive(Debug, Default)]
pub struct SimConnector {
    clusters: ClusterMap,
}

impl SimConnector {
    /// Create an empty connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `cluster` reachable under `alias`.
    pub fn add(&self, alias: &str, cluster: SimCluster) {
        self.clusters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias.to_string(), cluster);
    }
}

#[async_trait]
impl ClusterConnector for SimConnector {
    async fn connect(&self, alias: &str, _seeds: &[String]) -> Result<Box<dyn StateSource>> {
        let source = lookup(&self.clusters, alias)?.subscribe()?;
        Ok(Box::new(source))
    }

    fn client(&self, alias: &str, _seeds: &[String]) -> Result<Arc<dyn RemoteClient>> {
        Ok(Arc::new(SimClient {
            alias: alias.to_string(),
            clusters: Arc::clone(&self.clusters),
        }))
    }
}
