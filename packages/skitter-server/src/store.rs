//! Node-local stores.
//!
//! Two families live here, both read-mostly with a single writer:
//!
//! - **Deployment constants**: the resolved link table and the deployment
//!   data vector of every live deployment, published once at deploy time
//!   and replicated identically on every node. Readers take lock-free
//!   snapshots; routers never coordinate across nodes for a lookup.
//! - **Cluster stores**: the node Registry (worker-capable members) and
//!   the Tags store, mutated only by the membership component.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skitter_core::{
    DefinitionError, Destination, FlattenedWorkflow, Operation, OperationRegistry, Value,
};

use crate::cluster::types::{MembersView, NodeInfo};
use crate::registry::StrategyRegistry;
use crate::strategy::Strategy;
use crate::worker::WorkerId;

// ---------------------------------------------------------------------------
// DeploymentRef
// ---------------------------------------------------------------------------

/// Identity of one deployed workflow instance, unique cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentRef(pub u64);

impl DeploymentRef {
    /// Allocates a fresh reference.
    #[must_use]
    pub fn fresh() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for DeploymentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dep-{:016x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

/// One node of a deployment with its names resolved against the local
/// registries.
pub struct ResolvedNode {
    pub name: String,
    pub operation: Arc<Operation>,
    pub strategy: Arc<dyn Strategy>,
    pub args: Value,
    /// Destinations per out port, indexed by out-port index.
    pub links: Vec<Vec<Destination>>,
}

impl fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedNode")
            .field("name", &self.name)
            .field("operation", &self.operation.name())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// Tracks the workers a deployment owns on this node, for teardown.
#[derive(Debug, Default)]
pub struct Supervisor {
    workers: Mutex<Vec<WorkerId>>,
}

impl Supervisor {
    pub fn register(&self, id: WorkerId) {
        self.workers.lock().push(id);
    }

    pub fn unregister(&self, id: WorkerId) {
        self.workers.lock().retain(|w| *w != id);
    }

    #[must_use]
    pub fn workers(&self) -> Vec<WorkerId> {
        self.workers.lock().clone()
    }
}

/// A live deployment as seen by this node: resolved nodes, the in-port
/// link table, the (write-once) deployment data vector, and the local
/// supervisor.
pub struct Deployment {
    pub reference: DeploymentRef,
    pub nodes: Vec<ResolvedNode>,
    /// Workflow in-port name to destinations, for external records.
    pub in_links: HashMap<String, Vec<Destination>>,
    /// The published form, kept for replication to late-joining nodes.
    pub flat: FlattenedWorkflow,
    data: ArcSwap<Vec<Option<Value>>>,
    pub supervisor: Supervisor,
}

impl Deployment {
    /// The deployment data of one operation instance, if published.
    #[must_use]
    pub fn data_for(&self, node_idx: usize) -> Option<Value> {
        self.data.load().get(node_idx).cloned().flatten()
    }

    /// Replaces the whole data vector (replication path).
    pub fn set_data(&self, data: Vec<Option<Value>>) {
        self.data.store(Arc::new(data));
    }

    /// Fills one slot (master path: hooks run in flattened order and may
    /// observe slots of earlier nodes through the partially filled
    /// vector).
    pub fn set_data_slot(&self, node_idx: usize, value: Value) {
        let mut data = (**self.data.load()).clone();
        if let Some(slot) = data.get_mut(node_idx) {
            *slot = Some(value);
        }
        self.data.store(Arc::new(data));
    }

    /// Snapshot of the data vector, for publication.
    #[must_use]
    pub fn data_vector(&self) -> Vec<Option<Value>> {
        (**self.data.load()).clone()
    }
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("reference", &self.reference)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DeploymentStore
// ---------------------------------------------------------------------------

/// All deployments live on this node, keyed by reference.
#[derive(Debug, Default)]
pub struct DeploymentStore {
    deployments: DashMap<DeploymentRef, Arc<Deployment>>,
}

impl DeploymentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            deployments: DashMap::new(),
        }
    }

    /// Resolves a flattened workflow against the local registries and
    /// publishes it. The data vector starts empty.
    ///
    /// # Errors
    ///
    /// `DefinitionError` when an operation or strategy name does not
    /// resolve locally.
    pub fn publish(
        &self,
        reference: DeploymentRef,
        flat: &FlattenedWorkflow,
        operations: &OperationRegistry,
        strategies: &StrategyRegistry,
    ) -> Result<Arc<Deployment>, DefinitionError> {
        let mut nodes = Vec::with_capacity(flat.nodes.len());
        for node in &flat.nodes {
            nodes.push(ResolvedNode {
                name: node.name.clone(),
                operation: operations.resolve(&node.operation)?,
                strategy: strategies.resolve(&node.strategy)?,
                args: node.args.clone(),
                links: node.links.clone(),
            });
        }
        let deployment = Arc::new(Deployment {
            reference,
            data: ArcSwap::new(Arc::new(vec![None; nodes.len()])),
            nodes,
            in_links: flat.in_links.clone(),
            flat: flat.clone(),
            supervisor: Supervisor::default(),
        });
        self.deployments.insert(reference, deployment.clone());
        Ok(deployment)
    }

    #[must_use]
    pub fn get(&self, reference: DeploymentRef) -> Option<Arc<Deployment>> {
        self.deployments
            .get(&reference)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, reference: DeploymentRef) -> Option<Arc<Deployment>> {
        self.deployments
            .remove(&reference)
            .map(|(_, deployment)| deployment)
    }

    #[must_use]
    pub fn references(&self) -> Vec<DeploymentRef> {
        self.deployments.iter().map(|entry| *entry.key()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MemberStore (node registry)
// ---------------------------------------------------------------------------

/// Registry of worker-capable nodes.
///
/// `ArcSwap` gives lock-free snapshots to readers (placement, routing);
/// the membership component is the only writer and serializes its
/// mutations through the write lock.
#[derive(Debug)]
pub struct MemberStore {
    view: ArcSwap<MembersView>,
    write: Mutex<()>,
}

impl MemberStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            view: ArcSwap::new(Arc::new(MembersView::default())),
            write: Mutex::new(()),
        }
    }

    /// Lock-free snapshot of the current view.
    #[must_use]
    pub fn snapshot(&self) -> Arc<MembersView> {
        self.view.load_full()
    }

    /// Adds a node, replacing any entry with the same name.
    pub fn add(&self, info: NodeInfo) {
        let _guard = self.write.lock();
        let mut view = (**self.view.load()).clone();
        view.members.retain(|m| m.name != info.name);
        view.members.push(info);
        view.version += 1;
        self.view.store(Arc::new(view));
    }

    /// Removes a node; returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        let _guard = self.write.lock();
        let mut view = (**self.view.load()).clone();
        let before = view.members.len();
        view.members.retain(|m| m.name != name);
        let removed = view.members.len() != before;
        if removed {
            view.version += 1;
            self.view.store(Arc::new(view));
        }
        removed
    }

    /// Drops every node except `keep`. Used when a worker loses its
    /// master and retains only itself.
    pub fn clear_except(&self, keep: &str) {
        let _guard = self.write.lock();
        let mut view = (**self.view.load()).clone();
        view.members.retain(|m| m.name == keep);
        view.version += 1;
        self.view.store(Arc::new(view));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.view.load().contains(name)
    }
}

impl Default for MemberStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// TagsStore
// ---------------------------------------------------------------------------

/// Capability tags per node, replicated by the membership component.
#[derive(Debug, Default)]
pub struct TagsStore {
    tags: DashMap<String, Vec<String>>,
}

impl TagsStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: DashMap::new(),
        }
    }

    pub fn put(&self, node: impl Into<String>, tags: Vec<String>) {
        self.tags.insert(node.into(), tags);
    }

    pub fn remove(&self, node: &str) {
        self.tags.remove(node);
    }

    #[must_use]
    pub fn get(&self, node: &str) -> Option<Vec<String>> {
        self.tags.get(node).map(|entry| entry.value().clone())
    }

    /// Snapshot of all tag sets.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Vec<String>> {
        self.tags
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::NodeMode;

    fn member(name: &str) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            addr: "127.0.0.1:0".to_string(),
            mode: NodeMode::Worker,
            tags: vec![],
            cores: 2,
        }
    }

    #[test]
    fn deployment_ref_display_and_uniqueness() {
        let a = DeploymentRef::fresh();
        let b = DeploymentRef::fresh();
        assert_ne!(a, b);
        assert!(format!("{a}").starts_with("dep-"));
    }

    #[test]
    fn deployment_data_slots_fill_incrementally() {
        let deployment = Deployment {
            reference: DeploymentRef(1),
            nodes: Vec::new(),
            in_links: HashMap::new(),
            flat: FlattenedWorkflow::default(),
            data: ArcSwap::new(Arc::new(vec![None, None])),
            supervisor: Supervisor::default(),
        };
        assert_eq!(deployment.data_for(0), None);
        deployment.set_data_slot(0, Value::Int(1));
        assert_eq!(deployment.data_for(0), Some(Value::Int(1)));
        assert_eq!(deployment.data_for(1), None);
        deployment.set_data_slot(1, Value::Int(2));
        assert_eq!(
            deployment.data_vector(),
            vec![Some(Value::Int(1)), Some(Value::Int(2))]
        );
    }

    #[test]
    fn deployment_set_data_replaces_vector() {
        let deployment = Deployment {
            reference: DeploymentRef(1),
            nodes: Vec::new(),
            in_links: HashMap::new(),
            flat: FlattenedWorkflow::default(),
            data: ArcSwap::new(Arc::new(vec![None])),
            supervisor: Supervisor::default(),
        };
        deployment.set_data(vec![Some(Value::Bool(true))]);
        assert_eq!(deployment.data_for(0), Some(Value::Bool(true)));
    }

    #[test]
    fn supervisor_tracks_workers() {
        let supervisor = Supervisor::default();
        supervisor.register(1);
        supervisor.register(2);
        supervisor.unregister(1);
        assert_eq!(supervisor.workers(), vec![2]);
    }

    #[test]
    fn member_store_add_remove() {
        let store = MemberStore::new();
        assert_eq!(store.snapshot().version, 0);

        store.add(member("w1"));
        store.add(member("w2"));
        assert!(store.contains("w1"));
        assert_eq!(store.snapshot().members.len(), 2);
        assert_eq!(store.snapshot().version, 2);

        assert!(store.remove("w1"));
        assert!(!store.remove("w1"));
        assert!(!store.contains("w1"));
    }

    #[test]
    fn member_store_add_replaces_same_name() {
        let store = MemberStore::new();
        store.add(member("w1"));
        let mut updated = member("w1");
        updated.cores = 8;
        store.add(updated);
        let view = store.snapshot();
        assert_eq!(view.members.len(), 1);
        assert_eq!(view.members[0].cores, 8);
    }

    #[test]
    fn member_store_clear_except() {
        let store = MemberStore::new();
        store.add(member("w1"));
        store.add(member("w2"));
        store.add(member("w3"));
        store.clear_except("w2");
        let view = store.snapshot();
        assert_eq!(view.members.len(), 1);
        assert_eq!(view.members[0].name, "w2");
    }

    #[test]
    fn tags_store_put_get_remove() {
        let store = TagsStore::new();
        store.put("w1", vec!["gpu".to_string()]);
        assert_eq!(store.get("w1"), Some(vec!["gpu".to_string()]));
        assert_eq!(store.snapshot().len(), 1);
        store.remove("w1");
        assert_eq!(store.get("w1"), None);
    }
}
