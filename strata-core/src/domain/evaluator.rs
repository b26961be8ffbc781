//! Evaluator
//!
//! Runs a node's derivation under dependency tracking and commits the
//! outcome.
//!
//! # Evaluation
//!
//! 1. Bump the node's generation and mark it evaluating.
//! 2. Push a tracking scope and run the derivation outside the arena lock.
//! 3. Pop the scope and diff the recorded reads against the previous edges.
//! 4. Commit a ready value or failure, or spawn the returned future.
//!
//! # Asynchronous results
//!
//! A spawned future rejoins the graph through [`Domain::commit_async`]. The
//! result is committed only if the generation it was started with is still
//! the node's current generation; otherwise a newer evaluation or write has
//! superseded it and the result is dropped.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{trace, warn};

use super::memory::Domain;
use super::tracking::TrackingScope;
use crate::error::{GraphError, Result};
use crate::graph::{NodeState, NodeStatus, Value};
use crate::node::{ErasedDefinition, Evaluation, NodeValue, Outcome};
use crate::utils::NodeKey;

impl Domain {
    /// Create the arena entry for a node without evaluating it.
    pub(crate) fn register(&self, definition: &Arc<dyn ErasedDefinition>) -> Result<()> {
        let mut memory = self.memory()?;
        if !memory.nodes.contains_key(definition.key()) {
            trace!(node = %definition.key(), "registered");
            memory
                .nodes
                .insert(definition.key().clone(), NodeState::new(definition.clone()));
        }
        Ok(())
    }

    /// Register a node and evaluate it if it has never been evaluated.
    pub(crate) fn ensure(&self, definition: &Arc<dyn ErasedDefinition>) -> Result<()> {
        let key = definition.key();
        if TrackingScope::is_evaluating(self.id(), key) {
            return Err(GraphError::CyclicDependency(key.clone()));
        }
        self.register(definition)?;
        let uninitialized = self.memory()?.entry(key)?.status() == NodeStatus::Uninitialized;
        if uninitialized {
            self.evaluate(key)?;
        }
        Ok(())
    }

    /// Evaluate a registered node. Returns true if the committed state
    /// changed in a way dependents must observe.
    pub(crate) fn evaluate(&self, key: &NodeKey) -> Result<bool> {
        self.run_evaluation(key, None)
    }

    /// Run the derivation to record its inputs and activate the node, but
    /// commit `seed` in place of whatever it produced.
    pub(crate) fn evaluate_seeded(&self, key: &NodeKey, seed: Value) -> Result<bool> {
        self.run_evaluation(key, Some(seed))
    }

    fn run_evaluation(&self, key: &NodeKey, seed: Option<Value>) -> Result<bool> {
        if TrackingScope::is_evaluating(self.id(), key) {
            return Err(GraphError::CyclicDependency(key.clone()));
        }

        let (definition, generation) = {
            let mut memory = self.memory()?;
            let Some(entry) = memory.nodes.get_mut(key) else {
                return Ok(false);
            };
            (entry.definition().clone(), entry.begin_evaluation())
        };
        trace!(node = %key, generation, derived = definition.is_derived(), "evaluating");

        let scope = TrackingScope::enter(self.id(), key.clone());
        let Evaluation {
            outcome,
            effect,
            self_write,
        } = definition.evaluate(self);
        let reads = scope.finish();
        let (outcome, self_write) = match seed {
            Some(value) => (Outcome::Ready(Ok(value)), None),
            None => (outcome, self_write),
        };

        let (changed, pending, activate) = {
            let mut memory = self.memory()?;
            let current = memory
                .nodes
                .get(key)
                .is_some_and(|entry| entry.is_current(generation));
            if !current {
                trace!(node = %key, generation, "evaluation superseded");
                return Ok(false);
            }
            memory.install_edges(key, reads);

            let seq = memory.next_seq();
            let entry = memory.entry_mut(key)?;
            let (changed, pending) = match outcome {
                Outcome::Ready(Ok(value)) => (entry.commit_value(value, seq), None),
                Outcome::Ready(Err(error)) => {
                    trace!(node = %key, %error, "derivation failed");
                    (entry.commit_failure(error, seq), None)
                }
                // Entering the pending state is itself a change: resources
                // reading this node must move to pending.
                Outcome::Pending(future) => (true, Some(future)),
            };
            (changed, pending, entry.mark_activated())
        };

        if let Some(future) = pending {
            self.spawn_pending(key.clone(), generation, future);
        }
        if activate {
            self.activate(key, &definition, effect);
        }
        if let Some(value) = self_write {
            self.write_value(key, value)?;
        }
        Ok(changed)
    }

    /// Run the node's subscriptions once and store the combined teardown.
    fn activate(
        &self,
        key: &NodeKey,
        definition: &Arc<dyn ErasedDefinition>,
        effect: Option<crate::node::Effect>,
    ) {
        let mut teardowns = Vec::new();
        if let Some(teardown) = definition.activate(self) {
            teardowns.push(teardown);
        }
        if let Some(effect) = effect {
            teardowns.push(effect());
        }
        if teardowns.is_empty() {
            return;
        }
        trace!(node = %key, "activated");

        let teardown: crate::graph::Teardown = Box::new(move || {
            for teardown in teardowns {
                teardown();
            }
        });
        let rejected = match self.memory() {
            Ok(mut memory) => match memory.nodes.get_mut(key) {
                Some(entry) => {
                    entry.set_disposer(teardown);
                    None
                }
                None => Some(teardown),
            },
            Err(_) => Some(teardown),
        };
        // The node or domain went away while the effect ran.
        if let Some(teardown) = rejected {
            teardown();
        }
    }

    fn spawn_pending(
        &self,
        key: NodeKey,
        generation: u64,
        future: BoxFuture<'static, Result<Value>>,
    ) {
        let weak = self.downgrade();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = future.await;
                    if let Some(domain) = weak.upgrade() {
                        domain.commit_async(&key, generation, result);
                    }
                });
            }
            Err(_) => {
                warn!(node = %key, "no async runtime to drive derivation");
                self.commit_async(
                    &key,
                    generation,
                    Err(GraphError::msg("no async runtime available to drive derivation")),
                );
            }
        }
    }

    /// Commit the result of an asynchronous evaluation if it is still current.
    pub(crate) fn commit_async(&self, key: &NodeKey, generation: u64, result: Result<Value>) {
        {
            let Ok(mut memory) = self.memory() else {
                return;
            };
            let seq = memory.next_seq();
            let Some(entry) = memory.nodes.get_mut(key) else {
                return;
            };
            if !entry.is_current(generation) {
                trace!(node = %key, generation, current = entry.generation(), "discarding superseded result");
                return;
            }
            match result {
                Ok(value) => entry.commit_value(value, seq),
                Err(error) => entry.commit_failure(error, seq),
            };
        }
        trace!(node = %key, generation, "async result committed");
        // Settling always changes the pending status dependents observe.
        if let Err(error) = self.schedule(key.clone()) {
            warn!(node = %key, %error, "failed to propagate async result");
        }
    }

    /// Write a value into a registered node, superseding any in-flight
    /// evaluation, and schedule its dependents if it changed.
    pub(crate) fn write_value(&self, key: &NodeKey, value: Value) -> Result<()> {
        let changed = {
            let mut memory = self.memory()?;
            let seq = memory.next_seq();
            let entry = memory.entry_mut(key)?;
            entry.begin_evaluation();
            entry.commit_value(value, seq)
        };
        trace!(node = %key, changed, "written");
        if changed {
            self.schedule(key.clone())?;
        }
        Ok(())
    }

    /// Read the committed value of a node, propagating its failure.
    pub(crate) fn read_typed<S: NodeValue>(&self, key: &NodeKey) -> Result<S> {
        let memory = self.memory()?;
        let entry = memory.entry(key)?;
        if let Some(error) = entry.failure() {
            return Err(error.clone());
        }
        match entry.value() {
            Some(value) => value
                .downcast_ref::<S>()
                .cloned()
                .ok_or_else(|| GraphError::TypeMismatch(key.clone())),
            None if entry.status() == NodeStatus::Evaluating => Err(GraphError::Pending(key.clone())),
            None => Err(GraphError::NullishValue(key.clone())),
        }
    }

    /// Read the last committed value, ignoring any later failure.
    pub(crate) fn read_last<S: NodeValue>(&self, key: &NodeKey) -> Result<Option<S>> {
        let memory = self.memory()?;
        let entry = memory.entry(key)?;
        Ok(entry
            .value()
            .and_then(|value| value.downcast_ref::<S>())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn derivation_tracks_dynamic_dependencies() {
        let domain = Domain::new();
        let flag = Node::value(true);
        let left = Node::value("left".to_string());
        let right = Node::value("right".to_string());

        let (f, l, r) = (flag.clone(), left.clone(), right.clone());
        let pick = Node::derived(move |ctx| {
            if ctx.get(&f)? {
                ctx.get(&l)
            } else {
                ctx.get(&r)
            }
        });

        assert_eq!(domain.get_value(&pick).unwrap(), "left");
        let deps = domain.dependencies(&pick).unwrap();
        assert!(deps.contains(left.key()));
        assert!(!deps.contains(right.key()));

        domain.set(&flag, false).unwrap();
        assert_eq!(domain.get_value(&pick).unwrap(), "right");
        let deps = domain.dependencies(&pick).unwrap();
        assert!(!deps.contains(left.key()));
        assert!(deps.contains(right.key()));
        assert!(domain.dependents(&left).unwrap().is_empty());
    }

    #[test]
    fn abandoned_dependency_no_longer_triggers() {
        let domain = Domain::new();
        let flag = Node::value(true);
        let left = Node::value(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let (f, l, counter) = (flag.clone(), left.clone(), runs.clone());
        let pick = Node::derived(move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            if ctx.get(&f)? {
                ctx.get(&l)
            } else {
                Ok(0)
            }
        });

        domain.get_value(&pick).unwrap();
        domain.set(&flag, false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        domain.set(&left, 10).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let domain = Domain::new();
        let key = "self-reader";
        let node: Node<i32> = NodeBuilder::derive(move |ctx: &crate::domain::EvalContext<i32>| {
            let me: Node<i32> = NodeBuilder::value(0).key(key).build();
            ctx.get(&me)
        })
        .key(key)
        .build();

        let err = domain.get_value(&node).unwrap_err();
        assert_eq!(err, GraphError::CyclicDependency(NodeKey::from(key)));
    }

    #[test]
    fn mutual_recursion_is_a_cycle() {
        let domain = Domain::new();
        let a_key = NodeKey::from("cycle-a");
        let b_key = NodeKey::from("cycle-b");

        let b_inner = b_key.clone();
        let a_inner = a_key.clone();
        let a: Node<i32> = NodeBuilder::derive(move |ctx: &crate::domain::EvalContext<i32>| {
            let a_key = a_inner.clone();
            let b: Node<i32> = NodeBuilder::derive(move |ctx: &crate::domain::EvalContext<i32>| {
                let a: Node<i32> = NodeBuilder::value(0).key(a_key.clone()).build();
                ctx.get(&a)
            })
            .key(b_inner.clone())
            .build();
            ctx.get(&b)
        })
        .key(a_key.clone())
        .build();

        let err = domain.get_value(&a).unwrap_err();
        assert_eq!(err, GraphError::CyclicDependency(a_key));
    }

    #[test]
    fn failures_are_propagated_to_readers() {
        let domain = Domain::new();
        let broken: Node<i32> = Node::derived(|_| Err(GraphError::msg("broken")));
        let b = broken.clone();
        let reader = Node::derived(move |ctx| Ok(ctx.get(&b)? + 1));

        let err = domain.get_value(&reader).unwrap_err();
        assert_eq!(err.to_string(), "broken");
    }

    #[test]
    fn seeded_evaluation_keeps_seed_and_edges() {
        let domain = Domain::new();
        let count = Node::value(1);
        let c = count.clone();
        let doubled = Node::derived(move |ctx| Ok(ctx.get(&c)? * 2));

        domain.register(&doubled.erased()).unwrap();
        domain.evaluate_seeded(doubled.key(), Arc::new(100)).unwrap();
        assert_eq!(domain.peek(&doubled).unwrap(), Some(100));
        assert_eq!(domain.dependencies(&doubled).unwrap(), vec![count.key().clone()]);
    }

    #[test]
    fn async_derivation_without_runtime_fails() {
        let domain = Domain::new();
        let node: Node<i32> = Node::derived_async(|_| Ok(async { Ok(1) }));
        let err = domain.get_value(&node).unwrap_err();
        assert!(matches!(err, GraphError::Failure(_)));
    }
}
