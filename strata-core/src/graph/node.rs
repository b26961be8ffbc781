//! Graph Nodes
//!
//! This module defines the per-node entry that lives in a domain's arena.
//! An entry is created the first time a node is touched inside a domain and
//! holds everything the engine knows about that node there: the committed
//! value, the edge sets, the listeners, and the generation counter.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::watch;

use crate::error::GraphError;
use crate::node::ErasedDefinition;
use crate::utils::NodeKey;

/// A type-erased node value.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Change notification callback.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Teardown returned by a node subscription.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a node entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Registered but never evaluated.
    Uninitialized,

    /// A derivation has started and has not committed yet. For asynchronous
    /// derivations this lasts until the future settles.
    Evaluating,

    /// The latest evaluation has committed a value or a failure.
    Ready,

    /// The node was torn down. Any late result is dropped.
    Disposed,
}

/// Arena entry for one node inside a domain.
pub struct NodeState {
    definition: Arc<dyn ErasedDefinition>,

    /// Last committed value. Kept across failures so the last good value
    /// stays retrievable.
    value: Option<Value>,

    /// Failure of the latest completed evaluation, if it failed.
    failure: Option<GraphError>,

    /// Nodes read during the latest completed evaluation.
    dependencies: IndexSet<NodeKey>,

    /// Nodes whose latest evaluation read this node.
    dependents: IndexSet<NodeKey>,

    listeners: IndexMap<ListenerId, Listener>,

    /// Bumped every time an evaluation starts.
    generation: u64,

    status: NodeStatus,

    disposer: Option<Teardown>,

    /// Set once the subscriptions of the node have run in this domain.
    activated: bool,

    /// Bumped on every commit; consumers suspended on this node wait on it.
    settled: watch::Sender<u64>,

    /// Domain sequence number of the last commit that changed the node.
    settled_seq: u64,
}

impl NodeState {
    pub fn new(definition: Arc<dyn ErasedDefinition>) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            definition,
            value: None,
            failure: None,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
            listeners: IndexMap::new(),
            generation: 0,
            status: NodeStatus::Uninitialized,
            disposer: None,
            activated: false,
            settled,
            settled_seq: 0,
        }
    }

    pub fn definition(&self) -> &Arc<dyn ErasedDefinition> {
        &self.definition
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new evaluation and return its generation.
    pub fn begin_evaluation(&mut self) -> u64 {
        self.generation += 1;
        self.status = NodeStatus::Evaluating;
        self.generation
    }

    /// Check whether `generation` is still the live evaluation.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.status != NodeStatus::Disposed
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn failure(&self) -> Option<&GraphError> {
        self.failure.as_ref()
    }

    /// True once a value or a failure has been committed.
    pub fn has_settled_once(&self) -> bool {
        self.value.is_some() || self.failure.is_some()
    }

    /// Commit a value. Returns true if it replaced the previous one.
    pub fn commit_value(&mut self, value: Value, seq: u64) -> bool {
        let changed = match (&self.value, &self.failure) {
            (Some(prev), None) => self.definition.should_update(prev, &value),
            _ => true,
        };
        self.status = NodeStatus::Ready;
        self.failure = None;
        if changed {
            self.value = Some(value);
            self.settled_seq = seq;
        }
        self.settled.send_modify(|n| *n += 1);
        changed
    }

    /// Commit a failure. The previous value is kept.
    pub fn commit_failure(&mut self, error: GraphError, seq: u64) -> bool {
        let changed = self.failure.as_ref() != Some(&error);
        self.status = NodeStatus::Ready;
        self.failure = Some(error);
        if changed {
            self.settled_seq = seq;
        }
        self.settled.send_modify(|n| *n += 1);
        changed
    }

    pub fn settled_seq(&self) -> u64 {
        self.settled_seq
    }

    /// Subscribe to the next commit of this node.
    pub fn watch_settled(&self) -> watch::Receiver<u64> {
        self.settled.subscribe()
    }

    pub fn dependencies(&self) -> &IndexSet<NodeKey> {
        &self.dependencies
    }

    pub fn add_dependency(&mut self, key: NodeKey) {
        self.dependencies.insert(key);
    }

    pub fn remove_dependency(&mut self, key: &NodeKey) {
        self.dependencies.shift_remove(key);
    }

    pub fn dependents(&self) -> &IndexSet<NodeKey> {
        &self.dependents
    }

    pub fn add_dependent(&mut self, key: NodeKey) {
        self.dependents.insert(key);
    }

    pub fn remove_dependent(&mut self, key: &NodeKey) {
        self.dependents.shift_remove(key);
    }

    pub fn add_listener(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.shift_remove(&id).is_some()
    }

    pub fn listeners(&self) -> impl Iterator<Item = (&ListenerId, &Listener)> {
        self.listeners.iter()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Mark the node activated. Returns true only the first time.
    pub fn mark_activated(&mut self) -> bool {
        !std::mem::replace(&mut self.activated, true)
    }

    pub fn set_disposer(&mut self, disposer: Teardown) {
        self.disposer = Some(disposer);
    }

    /// Tear the entry down: mark it disposed, drop listeners and hand back
    /// the edges and the disposer so the caller can unlink and run them
    /// outside the arena lock.
    pub fn dispose(&mut self) -> (IndexSet<NodeKey>, IndexSet<NodeKey>, Option<Teardown>) {
        self.status = NodeStatus::Disposed;
        self.listeners.clear();
        (
            std::mem::take(&mut self.dependencies),
            std::mem::take(&mut self.dependents),
            self.disposer.take(),
        )
    }
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeState")
            .field("key", self.definition.key())
            .field("status", &self.status)
            .field("generation", &self.generation)
            .field("has_value", &self.value.is_some())
            .field("failure", &self.failure)
            .field("dependencies", &self.dependencies)
            .field("dependents", &self.dependents)
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn state() -> NodeState {
        let node = Node::value(0_i32);
        NodeState::new(node.erased())
    }

    #[test]
    fn listener_ids_are_unique() {
        assert_ne!(ListenerId::new(), ListenerId::new());
    }

    #[test]
    fn entry_starts_uninitialized() {
        let entry = state();
        assert_eq!(entry.status(), NodeStatus::Uninitialized);
        assert!(!entry.has_settled_once());
        assert_eq!(entry.generation(), 0);
    }

    #[test]
    fn generation_tracks_latest_evaluation() {
        let mut entry = state();
        let first = entry.begin_evaluation();
        let second = entry.begin_evaluation();
        assert!(!entry.is_current(first));
        assert!(entry.is_current(second));
        assert_eq!(entry.status(), NodeStatus::Evaluating);
    }

    #[test]
    fn equal_commit_is_not_a_change() {
        let mut entry = state();
        assert!(entry.commit_value(Arc::new(1_i32), 1));
        assert!(!entry.commit_value(Arc::new(1_i32), 2));
        assert_eq!(entry.settled_seq(), 1);
        assert!(entry.commit_value(Arc::new(2_i32), 3));
        assert_eq!(entry.settled_seq(), 3);
    }

    #[test]
    fn failure_keeps_last_value() {
        let mut entry = state();
        entry.commit_value(Arc::new(5_i32), 1);
        assert!(entry.commit_failure(GraphError::msg("nope"), 2));
        assert!(entry.failure().is_some());
        let value = entry.value().and_then(|v| v.downcast_ref::<i32>()).copied();
        assert_eq!(value, Some(5));
    }

    #[test]
    fn dependency_management() {
        let mut entry = state();
        let a = NodeKey::from("a");
        let b = NodeKey::from("b");

        entry.add_dependency(a.clone());
        entry.add_dependency(b.clone());
        assert_eq!(entry.dependencies().len(), 2);

        entry.remove_dependency(&a);
        assert!(!entry.dependencies().contains(&a));
        assert!(entry.dependencies().contains(&b));
    }

    #[test]
    fn dispose_hands_back_edges_and_disposer() {
        let mut entry = state();
        entry.add_dependency(NodeKey::from("up"));
        entry.add_dependent(NodeKey::from("down"));
        entry.add_listener(Arc::new(|| {}));
        entry.set_disposer(Box::new(|| {}));

        let (deps, dependents, disposer) = entry.dispose();
        assert_eq!(deps.len(), 1);
        assert_eq!(dependents.len(), 1);
        assert!(disposer.is_some());
        assert_eq!(entry.listener_count(), 0);
        assert_eq!(entry.status(), NodeStatus::Disposed);
        assert!(!entry.is_current(entry.generation()));
    }
}
