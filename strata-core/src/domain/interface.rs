//! Domain Interface
//!
//! The public read, write and subscription operations of a [`Domain`].
//!
//! # Reads
//!
//! [`Domain::get_value`] evaluates a node on first access and returns its
//! committed value. Resource reads come in three shapes: the raw
//! [`ResourceResult`], a suspending [`Domain::read`] that hands back a
//! [`Settled`] future while pending, and [`Domain::read_async`] which awaits
//! settlement itself.
//!
//! # Writes
//!
//! Every write runs inside a batch. Dependents are re-evaluated and
//! listeners are notified once, when the outermost batch closes.

use std::sync::Arc;

use tracing::debug;

use super::context::WriteContext;
use super::memory::Domain;
use crate::error::{GraphError, Result};
use crate::graph::{ListenerId, NodeStatus};
use crate::node::{Draft, Node, NodeValue, Setter};
use crate::resource::{Resource, ResourceResult, Settled, Suspend};
use crate::utils::NodeKey;

impl Domain {
    /// Read a node, evaluating it first if this domain has never seen it.
    pub fn get_value<S, A>(&self, node: &Node<S, A>) -> Result<S>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        self.batch(|| {
            self.ensure(&node.erased())?;
            self.read_typed(node.key())
        })
    }

    /// The last committed value, without evaluating.
    pub fn peek<S, A>(&self, node: &Node<S, A>) -> Result<Option<S>>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        if !self.memory()?.nodes.contains_key(node.key()) {
            return Ok(None);
        }
        self.read_last(node.key())
    }

    pub fn status<S, A>(&self, node: &Node<S, A>) -> Option<NodeStatus>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        let memory = self.memory().ok()?;
        memory.nodes.get(node.key()).map(|entry| entry.status())
    }

    /// Nodes read by the latest evaluation of `node`.
    pub fn dependencies<S, A>(&self, node: &Node<S, A>) -> Result<Vec<NodeKey>>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        let memory = self.memory()?;
        Ok(memory
            .nodes
            .get(node.key())
            .map(|entry| entry.dependencies().iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Nodes whose latest evaluation read `node`.
    pub fn dependents<S, A>(&self, node: &Node<S, A>) -> Result<Vec<NodeKey>>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        let memory = self.memory()?;
        Ok(memory
            .nodes
            .get(node.key())
            .map(|entry| entry.dependents().iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn listener_count<S, A>(&self, node: &Node<S, A>) -> usize
    where
        S: NodeValue,
        A: Send + 'static,
    {
        self.memory()
            .ok()
            .and_then(|memory| memory.nodes.get(node.key()).map(|entry| entry.listener_count()))
            .unwrap_or(0)
    }

    pub fn get_resource<T: NodeValue>(&self, resource: &Resource<T>) -> Result<ResourceResult<T>> {
        self.get_value(resource.node())
    }

    /// Read a resource, suspending while it is pending.
    ///
    /// `Err(Suspend::Pending(settled))` carries a future that resolves when
    /// the resource next settles; read again once it does.
    pub fn read<T: NodeValue>(&self, resource: &Resource<T>) -> Result<T, Suspend> {
        let state = match self.get_resource(resource).map_err(Suspend::Failed)? {
            ResourceResult::Pending => {
                let settled = self.settled(resource.node()).map_err(Suspend::Failed)?;
                // The resource may have settled between the read and the
                // subscription.
                match self.get_resource(resource).map_err(Suspend::Failed)? {
                    ResourceResult::Pending => return Err(Suspend::Pending(settled)),
                    state => state,
                }
            }
            state => state,
        };
        match state {
            ResourceResult::Success(value) => Ok(value),
            ResourceResult::Failure(error) => Err(Suspend::Failed(error)),
            ResourceResult::Pending => Err(Suspend::Failed(GraphError::Pending(resource.key().clone()))),
        }
    }

    /// Read a resource, waiting for it to settle.
    pub async fn read_async<T: NodeValue>(&self, resource: &Resource<T>) -> Result<T> {
        loop {
            match self.read(resource) {
                Ok(value) => return Ok(value),
                Err(Suspend::Failed(error)) => return Err(error),
                Err(Suspend::Pending(settled)) => settled.wait().await?,
            }
        }
    }

    /// Future that resolves on the next commit of `node`.
    pub fn settled<S, A>(&self, node: &Node<S, A>) -> Result<Settled>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        let memory = self.memory()?;
        let receiver = memory.entry(node.key())?.watch_settled();
        Ok(Settled::new(node.key().clone(), receiver))
    }

    /// Subscribe to changes of `node`. The listener is invoked through the
    /// domain's batching hook, at most once per tick.
    pub fn add_listener<S, A, F>(&self, node: &Node<S, A>, listener: F) -> Result<ListenerId>
    where
        S: NodeValue,
        A: Send + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.batch(|| self.ensure(&node.erased()))?;
        let mut memory = self.memory()?;
        Ok(memory.entry_mut(node.key())?.add_listener(Arc::new(listener)))
    }

    pub fn remove_listener<S, A>(&self, node: &Node<S, A>, id: ListenerId) -> bool
    where
        S: NodeValue,
        A: Send + 'static,
    {
        self.memory()
            .ok()
            .and_then(|mut memory| {
                memory
                    .nodes
                    .get_mut(node.key())
                    .map(|entry| entry.remove_listener(id))
            })
            .unwrap_or(false)
    }

    /// Write a value or update, bypassing the node's setter.
    pub fn set<S, A>(&self, node: &Node<S, A>, draft: impl Into<Draft<S>>) -> Result<()>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        self.write_draft(node, draft.into())
    }

    fn write_draft<S, A>(&self, node: &Node<S, A>, draft: Draft<S>) -> Result<()>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        self.batch(|| {
            self.ensure(&node.erased())?;
            let next = match draft {
                Draft::Value(value) => value,
                update => update.apply(&self.read_typed::<S>(node.key())?),
            };
            self.write_value(node.key(), Arc::new(next))
        })
    }

    /// Dispatch an action through the node's setter.
    ///
    /// Fails with [`GraphError::AsyncSetter`] if the setter is asynchronous.
    pub fn dispatch_sync<S, A>(&self, node: &Node<S, A>, action: A) -> Result<()>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        match node.setter().clone() {
            Setter::Direct(convert) => self.write_draft(node, convert(action)),
            Setter::Sync(setter) => self.batch(|| {
                self.ensure(&node.erased())?;
                setter(&WriteContext::new(self.clone()), action)
            }),
            Setter::Async(_) => Err(GraphError::AsyncSetter(node.key().clone())),
        }
    }

    /// Dispatch an action through the node's setter, awaiting an
    /// asynchronous setter to completion.
    pub async fn dispatch<S, A>(&self, node: &Node<S, A>, action: A) -> Result<()>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        match node.setter().clone() {
            Setter::Async(setter) => {
                self.batch(|| self.ensure(&node.erased()))?;
                setter(WriteContext::new(self.clone()), action).await
            }
            _ => self.dispatch_sync(node, action),
        }
    }

    /// Seed a node that this domain has not evaluated yet. Returns false
    /// and leaves the node untouched if it already holds state.
    ///
    /// A derivation still runs once so the node links to its inputs and
    /// activates; the seed replaces its result.
    pub fn hydrate<S, A>(&self, node: &Node<S, A>, value: S) -> Result<bool>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        self.batch(|| {
            self.register(&node.erased())?;
            {
                let memory = self.memory()?;
                let entry = memory.entry(node.key())?;
                if entry.status() != NodeStatus::Uninitialized || entry.has_settled_once() {
                    return Ok(false);
                }
            }
            self.evaluate_seeded(node.key(), Arc::new(value))?;
            debug!(node = %node.key(), "hydrated");
            Ok(true)
        })
    }

    /// Re-run the node's initial evaluation: constants return to their
    /// seed and derivations recompute.
    pub fn reset<S, A>(&self, node: &Node<S, A>) -> Result<()>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        self.batch(|| {
            self.register(&node.erased())?;
            if self.evaluate(node.key())? {
                self.schedule(node.key().clone())?;
            }
            Ok(())
        })
    }

    /// Remove a node from this domain and run its teardown. Dependents keep
    /// their values until they next evaluate.
    pub fn dispose<S, A>(&self, node: &Node<S, A>) -> Result<()>
    where
        S: NodeValue,
        A: Send + 'static,
    {
        let teardown = self.memory()?.remove_node(node.key());
        debug!(node = %node.key(), "disposed");
        if let Some(teardown) = teardown {
            teardown();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listener_fires_once_per_change() {
        let domain = Domain::new();
        let node = Node::value(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = domain
            .add_listener(&node, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        domain.set(&node, 1).unwrap();
        domain.set(&node, 1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(domain.remove_listener(&node, id));
        domain.set(&node, 2).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(domain.listener_count(&node), 0);
    }

    #[test]
    fn update_draft_applies_to_current_value() {
        let domain = Domain::new();
        let node = Node::value(10);
        domain.set(&node, Draft::update(|n: &i32| n * 2)).unwrap();
        assert_eq!(domain.get_value(&node).unwrap(), 20);
    }

    #[test]
    fn hydrate_only_seeds_fresh_nodes() {
        let domain = Domain::new();
        let node = Node::value(1);
        assert!(domain.hydrate(&node, 42).unwrap());
        assert_eq!(domain.get_value(&node).unwrap(), 42);
        assert!(!domain.hydrate(&node, 7).unwrap());
        assert_eq!(domain.get_value(&node).unwrap(), 42);
    }

    #[test]
    fn hydrated_derivation_keeps_reacting() {
        let domain = Domain::new();
        let count = Node::value(1);
        let c = count.clone();
        let doubled = Node::derived(move |ctx| Ok(ctx.get(&c)? * 2));

        assert!(domain.hydrate(&doubled, 100).unwrap());
        assert_eq!(domain.get_value(&doubled).unwrap(), 100);
        assert_eq!(domain.dependencies(&doubled).unwrap(), vec![count.key().clone()]);

        domain.set(&count, 5).unwrap();
        assert_eq!(domain.get_value(&doubled).unwrap(), 10);
    }

    #[test]
    fn hydrated_derivation_runs_its_subscription() {
        let domain = Domain::new();
        let activations = Arc::new(AtomicUsize::new(0));
        let counter = activations.clone();
        let node: Node<i32> = NodeBuilder::derive(move |ctx: &crate::domain::EvalContext<i32>| {
            let counter = counter.clone();
            ctx.subscription(move || -> crate::graph::Teardown {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(|| {})
            });
            Ok(0)
        })
        .build();

        assert!(domain.hydrate(&node, 7).unwrap());
        assert_eq!(activations.load(Ordering::SeqCst), 1);
        assert_eq!(domain.get_value(&node).unwrap(), 7);
    }

    #[test]
    fn reset_restores_seed_and_propagates() {
        let domain = Domain::new();
        let node = Node::value(1);
        let n = node.clone();
        let plus_one = Node::derived(move |ctx| Ok(ctx.get(&n)? + 1));

        domain.set(&node, 5).unwrap();
        assert_eq!(domain.get_value(&plus_one).unwrap(), 6);

        domain.reset(&node).unwrap();
        assert_eq!(domain.get_value(&node).unwrap(), 1);
        assert_eq!(domain.get_value(&plus_one).unwrap(), 2);
    }

    #[test]
    fn reset_rederives_overridden_derivation() {
        let domain = Domain::new();
        let source = Node::value(2);
        let s = source.clone();
        let doubled = Node::derived(move |ctx| Ok(ctx.get(&s)? * 2));
        let d = doubled.clone();
        let plus_one = Node::derived(move |ctx| Ok(ctx.get(&d)? + 1));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        domain
            .add_listener(&plus_one, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        domain.set(&doubled, 100).unwrap();
        assert_eq!(domain.get_value(&plus_one).unwrap(), 101);

        domain.reset(&doubled).unwrap();
        assert_eq!(domain.get_value(&doubled).unwrap(), 4);
        assert_eq!(domain.get_value(&plus_one).unwrap(), 5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn setter_error_leaves_other_nodes_untouched() {
        let domain = Domain::new();
        let bystander = Node::value(1);
        let node = NodeBuilder::value(0)
            .setter(|_ctx: &WriteContext, fail: bool| {
                if fail {
                    Err(GraphError::msg("rejected"))
                } else {
                    Ok(())
                }
            })
            .build();

        let err = domain.dispatch_sync(&node, true).unwrap_err();
        assert_eq!(err.to_string(), "rejected");
        assert_eq!(domain.get_value(&node).unwrap(), 0);
        assert_eq!(domain.get_value(&bystander).unwrap(), 1);
    }

    #[test]
    fn async_setter_rejected_on_sync_path() {
        let domain = Domain::new();
        let node = NodeBuilder::value(0)
            .async_setter(|_ctx: WriteContext, _action: ()| async { Ok(()) })
            .build();
        assert_eq!(
            domain.dispatch_sync(&node, ()),
            Err(GraphError::AsyncSetter(node.key().clone()))
        );
    }

    #[test]
    fn peek_does_not_evaluate() {
        let domain = Domain::new();
        let node = Node::derived(|_| Ok(3));
        assert_eq!(domain.peek(&node).unwrap(), None);
        assert_eq!(domain.status(&node), None);
        domain.get_value(&node).unwrap();
        assert_eq!(domain.peek(&node).unwrap(), Some(3));
        assert_eq!(domain.status(&node), Some(NodeStatus::Ready));
    }

    #[test]
    fn disposed_node_is_unlinked() {
        let domain = Domain::new();
        let source = Node::value(1);
        let s = source.clone();
        let reader = Node::derived(move |ctx| ctx.get(&s));
        domain.get_value(&reader).unwrap();
        assert_eq!(domain.dependents(&source).unwrap().len(), 1);

        domain.dispose(&reader).unwrap();
        assert!(domain.dependents(&source).unwrap().is_empty());
        assert_eq!(domain.status(&reader), None);
    }
}
