//! Evaluation and Write Contexts
//!
//! [`EvalContext`] is handed to derivations. Reads made through it are
//! tracked as dependencies of the evaluating node. [`WriteContext`] is handed
//! to setters; its reads are untracked and its writes join the setter's
//! batch. [`Mutator`] is a detached, weak write handle for subscriptions and
//! timers that outlive a single evaluation.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::memory::{Domain, WeakDomain};
use super::tracking::TrackingScope;
use crate::error::{GraphError, Result};
use crate::graph::{NodeStatus, Teardown};
use crate::node::{Draft, Effect, Node, NodeValue};
use crate::resource::ResourceResult;
use crate::utils::NodeKey;

/// Context of one derivation run.
pub struct EvalContext<S> {
    domain: Domain,
    key: NodeKey,
    effect: RefCell<Option<Effect>>,
    self_write: RefCell<Option<S>>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: NodeValue> EvalContext<S> {
    pub(crate) fn new(domain: Domain, key: NodeKey) -> Self {
        Self {
            domain,
            key,
            effect: RefCell::new(None),
            self_write: RefCell::new(None),
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_parts(self) -> (Option<Effect>, Option<S>) {
        (self.effect.into_inner(), self.self_write.into_inner())
    }

    /// Key of the node being evaluated.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Weak handle to the owning domain, for use inside futures.
    pub fn domain(&self) -> WeakDomain {
        self.domain.downgrade()
    }

    fn track<T: NodeValue, B: Send + 'static>(&self, node: &Node<T, B>) -> Result<()> {
        let key = node.key();
        if TrackingScope::is_evaluating(self.domain.id(), key) {
            return Err(GraphError::CyclicDependency(key.clone()));
        }
        self.domain.ensure(&node.erased())?;
        TrackingScope::track(self.domain.id(), key.clone());
        Ok(())
    }

    /// Read a node and record it as a dependency.
    pub fn get<T: NodeValue, B: Send + 'static>(&self, node: &Node<T, B>) -> Result<T> {
        self.track(node)?;
        self.domain.read_typed(node.key())
    }

    /// Read the settlement state of a node and record it as a dependency.
    ///
    /// An evaluating node is pending even if it still holds an older value.
    pub fn resource_state<T: NodeValue, B: Send + 'static>(
        &self,
        node: &Node<T, B>,
    ) -> Result<ResourceResult<T>> {
        self.track(node)?;
        let memory = self.domain.memory()?;
        let entry = memory.entry(node.key())?;
        if entry.status() == NodeStatus::Evaluating {
            return Ok(ResourceResult::Pending);
        }
        if let Some(error) = entry.failure() {
            return Ok(if error.is_pending() {
                ResourceResult::Pending
            } else {
                ResourceResult::Failure(error.clone())
            });
        }
        match entry.value() {
            Some(value) => value
                .downcast_ref::<T>()
                .cloned()
                .map(ResourceResult::Success)
                .ok_or_else(|| GraphError::TypeMismatch(node.key().clone())),
            None => Err(GraphError::NullishValue(node.key().clone())),
        }
    }

    /// Read the last value a node committed, ignoring pending and failed
    /// states. Recorded as a dependency.
    pub fn last_value<T: NodeValue, B: Send + 'static>(
        &self,
        node: &Node<T, B>,
    ) -> Result<Option<T>> {
        self.track(node)?;
        self.domain.read_last(node.key())
    }

    /// Sequence number of the node's last settling commit. Lower numbers
    /// settled earlier. Not tracked.
    pub fn settled_seq<T: NodeValue, B: Send + 'static>(&self, node: &Node<T, B>) -> Result<u64> {
        Ok(self.domain.memory()?.entry(node.key())?.settled_seq())
    }

    /// The value this node committed before the current evaluation.
    pub fn previous(&self) -> Option<S> {
        self.domain.read_last(&self.key).ok().flatten()
    }

    /// Dispatch an action to another node. The write is processed with the
    /// current tick.
    pub fn set<T: NodeValue, B: Send + 'static>(&self, node: &Node<T, B>, action: B) -> Result<()> {
        self.domain.dispatch_sync(node, action)
    }

    /// Replace this node's value once the current evaluation has committed.
    pub fn mutate_self(&self, value: S) {
        *self.self_write.borrow_mut() = Some(value);
    }

    /// Detached write handle for this node.
    pub fn mutator(&self) -> Mutator<S> {
        Mutator::new(self.domain.downgrade(), self.key.clone())
    }

    /// Register a subscription. It runs once, after the node's first
    /// evaluation in this domain, and its teardown runs on disposal.
    pub fn subscription<F>(&self, f: F)
    where
        F: FnOnce() -> Teardown + Send + 'static,
    {
        *self.effect.borrow_mut() = Some(Box::new(f));
    }
}

impl<S> fmt::Debug for EvalContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalContext")
            .field("domain", &self.domain.id())
            .field("key", &self.key)
            .finish()
    }
}

/// Context handed to custom setters.
#[derive(Clone, Debug)]
pub struct WriteContext {
    domain: Domain,
}

impl WriteContext {
    pub(crate) fn new(domain: Domain) -> Self {
        Self { domain }
    }

    /// Read a node without tracking.
    pub fn get<T: NodeValue, B: Send + 'static>(&self, node: &Node<T, B>) -> Result<T> {
        self.domain.get_value(node)
    }

    /// Dispatch an action to a node, going through its setter.
    pub fn set<T: NodeValue, B: Send + 'static>(&self, node: &Node<T, B>, action: B) -> Result<()> {
        self.domain.dispatch_sync(node, action)
    }

    /// Write a value directly, bypassing the node's setter.
    pub fn write<T: NodeValue, B: Send + 'static>(
        &self,
        node: &Node<T, B>,
        draft: impl Into<Draft<T>>,
    ) -> Result<()> {
        self.domain.set(node, draft)
    }

    pub fn reset<T: NodeValue, B: Send + 'static>(&self, node: &Node<T, B>) -> Result<()> {
        self.domain.reset(node)
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }
}

/// Weak write handle for one node.
///
/// Writes through a mutator of a destroyed domain fail with
/// [`GraphError::Destroyed`].
pub struct Mutator<S> {
    domain: WeakDomain,
    key: NodeKey,
    _marker: PhantomData<fn(S)>,
}

impl<S: NodeValue> Mutator<S> {
    pub(crate) fn new(domain: WeakDomain, key: NodeKey) -> Self {
        Self {
            domain,
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn set(&self, value: S) -> Result<()> {
        let domain = self.domain.upgrade().ok_or(GraphError::Destroyed)?;
        domain.write_value(&self.key, Arc::new(value))
    }

    /// Transform the node's last committed value.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&S) -> S,
    {
        let domain = self.domain.upgrade().ok_or(GraphError::Destroyed)?;
        let prev = domain
            .read_last::<S>(&self.key)?
            .ok_or_else(|| GraphError::NullishValue(self.key.clone()))?;
        domain.write_value(&self.key, Arc::new(f(&prev)))
    }
}

impl<S> Clone for Mutator<S> {
    fn clone(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S> fmt::Debug for Mutator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn previous_sees_last_committed_value() {
        let domain = Domain::new();
        let source = Node::value(1);
        let s = source.clone();
        let history = Arc::new(Mutex::new(Vec::new()));
        let h = history.clone();
        let node = Node::derived(move |ctx: &EvalContext<i32>| {
            h.lock().unwrap().push(ctx.previous());
            ctx.get(&s)
        });

        domain.get_value(&node).unwrap();
        domain.set(&source, 2).unwrap();
        assert_eq!(*history.lock().unwrap(), vec![None, Some(1)]);
    }

    #[test]
    fn subscription_runs_once_and_tears_down_on_dispose() {
        let domain = Domain::new();
        let source = Node::value(0);
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let (s, start, stop) = (source.clone(), started.clone(), stopped.clone());
        let node = Node::derived(move |ctx: &EvalContext<i32>| {
            let (start, stop) = (start.clone(), stop.clone());
            ctx.subscription(move || {
                start.fetch_add(1, Ordering::SeqCst);
                Box::new(move || {
                    stop.fetch_add(1, Ordering::SeqCst);
                })
            });
            ctx.get(&s)
        });

        domain.get_value(&node).unwrap();
        domain.set(&source, 1).unwrap();
        domain.set(&source, 2).unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);

        domain.dispose(&node).unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mutator_writes_through_to_dependents() {
        let domain = Domain::new();
        let counter = NodeBuilder::value(0).key("counter").build();
        let c = counter.clone();
        let doubled = Node::derived(move |ctx| Ok(ctx.get(&c)? * 2));
        assert_eq!(domain.get_value(&doubled).unwrap(), 0);

        let mutator = Mutator::<i32>::new(domain.downgrade(), counter.key().clone());
        mutator.update(|n| n + 3).unwrap();
        assert_eq!(domain.get_value(&doubled).unwrap(), 6);

        domain.destroy();
        assert_eq!(mutator.set(1), Err(GraphError::Destroyed));
    }

    #[test]
    fn mutate_self_applies_after_commit() {
        let domain = Domain::new();
        let node = Node::derived(|ctx: &EvalContext<i32>| {
            if ctx.previous().is_none() {
                ctx.mutate_self(10);
            }
            Ok(1)
        });
        assert_eq!(domain.get_value(&node).unwrap(), 10);
    }

    #[test]
    fn write_context_routes_through_setters() {
        let domain = Domain::new();
        let log = Node::value(Vec::<String>::new());
        let l = log.clone();
        let command = NodeBuilder::value(String::new())
            .setter(move |ctx: &WriteContext, line: String| {
                ctx.write(&l, Draft::update(move |lines: &Vec<String>| {
                    let mut lines = lines.clone();
                    lines.push(line);
                    lines
                }))
            })
            .build();

        domain.dispatch_sync(&command, "a".to_string()).unwrap();
        domain.dispatch_sync(&command, "b".to_string()).unwrap();
        assert_eq!(domain.get_value(&log).unwrap(), vec!["a", "b"]);
    }
}
