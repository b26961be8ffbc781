//! Node Definitions
//!
//! A [`Node`] is an immutable descriptor: a key, a way to produce the value
//! (a constant, a synchronous derivation, or an asynchronous one), a way to
//! handle dispatched actions, and an optional activation hook. It holds no
//! state. State lives in whichever [`Domain`] the node is read from.
//!
//! # Example
//!
//! ```rust,ignore
//! let fahrenheit = Node::value(32.0_f64);
//!
//! let f = fahrenheit.clone();
//! let celsius = NodeBuilder::derive(move |ctx| Ok((ctx.get(&f)? - 32.0) * 5.0 / 9.0))
//!     .setter({
//!         let f = fahrenheit.clone();
//!         move |ctx, c: f64| ctx.set(&f, Draft::Value(c * 9.0 / 5.0 + 32.0))
//!     })
//!     .build();
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use crate::domain::{Domain, EvalContext, Mutator, WriteContext};
use crate::error::Result;
use crate::graph::{Teardown, Value};
use crate::utils::{default_should_update, NodeKey};

/// Bound shared by every node value type.
pub trait NodeValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> NodeValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// The default action of a node without a custom setter: either a new value
/// or a transform of the current one.
pub enum Draft<S> {
    Value(S),
    Update(Box<dyn FnOnce(&S) -> S + Send>),
}

impl<S> Draft<S> {
    pub fn update<F>(f: F) -> Self
    where
        F: FnOnce(&S) -> S + Send + 'static,
    {
        Self::Update(Box::new(f))
    }

    /// Resolve the draft against the current value.
    pub fn apply(self, prev: &S) -> S {
        match self {
            Self::Value(value) => value,
            Self::Update(f) => f(prev),
        }
    }
}

impl<S> From<S> for Draft<S> {
    fn from(value: S) -> Self {
        Self::Value(value)
    }
}

impl<S: fmt::Debug> fmt::Debug for Draft<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Update(_) => f.write_str("Update(..)"),
        }
    }
}

type DeriveFn<S> = Arc<dyn Fn(&EvalContext<S>) -> Result<S> + Send + Sync>;
type DeriveAsyncFn<S> =
    Arc<dyn Fn(&EvalContext<S>) -> Result<BoxFuture<'static, Result<S>>> + Send + Sync>;
type SubscribeFn<S> = Arc<dyn Fn(Mutator<S>) -> Teardown + Send + Sync>;
type ShouldUpdateFn<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;

/// One-shot side effect registered during an evaluation.
pub type Effect = Box<dyn FnOnce() -> Teardown + Send>;

enum Getter<S> {
    Value(S),
    Derive(DeriveFn<S>),
    Async(DeriveAsyncFn<S>),
}

pub(crate) enum Setter<S, A> {
    /// No handler: the action is converted into a draft of the next value.
    Direct(Arc<dyn Fn(A) -> Draft<S> + Send + Sync>),
    Sync(Arc<dyn Fn(&WriteContext, A) -> Result<()> + Send + Sync>),
    Async(Arc<dyn Fn(WriteContext, A) -> BoxFuture<'static, Result<()>> + Send + Sync>),
}

impl<S, A> Clone for Setter<S, A> {
    fn clone(&self) -> Self {
        match self {
            Self::Direct(f) => Self::Direct(Arc::clone(f)),
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

struct Definition<S, A> {
    key: NodeKey,
    getter: Getter<S>,
    setter: Setter<S, A>,
    subscribe: Option<SubscribeFn<S>>,
    should_update: ShouldUpdateFn<S>,
}

/// What a single evaluation produced.
pub(crate) enum Outcome {
    Ready(Result<Value>),
    Pending(BoxFuture<'static, Result<Value>>),
}

pub(crate) struct Evaluation {
    pub outcome: Outcome,
    pub effect: Option<Effect>,
    /// Value pushed through `mutate_self`, applied after the commit.
    pub self_write: Option<Value>,
}

/// Type-erased view of a definition, stored in the domain arena.
pub(crate) trait ErasedDefinition: Send + Sync {
    fn key(&self) -> &NodeKey;

    /// True if the value comes from a derivation rather than a constant.
    fn is_derived(&self) -> bool;

    fn evaluate(&self, domain: &Domain) -> Evaluation;

    /// Apply the node's change predicate to two erased values.
    fn should_update(&self, prev: &Value, next: &Value) -> bool;

    /// Run the definition-level subscription, if any.
    fn activate(&self, domain: &Domain) -> Option<Teardown>;
}

impl<S, A> ErasedDefinition for Definition<S, A>
where
    S: NodeValue,
    A: Send + 'static,
{
    fn key(&self) -> &NodeKey {
        &self.key
    }

    fn is_derived(&self) -> bool {
        !matches!(self.getter, Getter::Value(_))
    }

    fn evaluate(&self, domain: &Domain) -> Evaluation {
        let ctx = EvalContext::<S>::new(domain.clone(), self.key.clone());
        let outcome = match &self.getter {
            Getter::Value(value) => Outcome::Ready(Ok(Arc::new(value.clone()) as Value)),
            Getter::Derive(derive) => {
                Outcome::Ready(derive(&ctx).map(|value| Arc::new(value) as Value))
            }
            Getter::Async(derive) => match derive(&ctx) {
                Ok(future) => Outcome::Pending(
                    future
                        .map(|result| result.map(|value| Arc::new(value) as Value))
                        .boxed(),
                ),
                Err(error) => Outcome::Ready(Err(error)),
            },
        };
        let (effect, self_write) = ctx.into_parts();
        Evaluation {
            outcome,
            effect,
            self_write: self_write.map(|value| Arc::new(value) as Value),
        }
    }

    fn should_update(&self, prev: &Value, next: &Value) -> bool {
        match (prev.downcast_ref::<S>(), next.downcast_ref::<S>()) {
            (Some(prev), Some(next)) => (self.should_update)(prev, next),
            _ => true,
        }
    }

    fn activate(&self, domain: &Domain) -> Option<Teardown> {
        let subscribe = self.subscribe.as_ref()?;
        Some(subscribe(Mutator::new(domain.downgrade(), self.key.clone())))
    }
}

/// Handle to a node definition. Cloning shares the definition.
pub struct Node<S, A = Draft<S>> {
    definition: Arc<Definition<S, A>>,
}

impl<S, A> Clone for Node<S, A> {
    fn clone(&self) -> Self {
        Self {
            definition: Arc::clone(&self.definition),
        }
    }
}

impl<S, A> fmt::Debug for Node<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.definition.key)
            .finish()
    }
}

impl<S: NodeValue> Node<S> {
    /// A node seeded with a constant value and a generated key.
    pub fn value(value: S) -> Self {
        NodeBuilder::value(value).build()
    }

    /// A node derived synchronously from other nodes.
    pub fn derived<F>(derive: F) -> Self
    where
        F: Fn(&EvalContext<S>) -> Result<S> + Send + Sync + 'static,
    {
        NodeBuilder::derive(derive).build()
    }

    /// A node derived asynchronously. Reads happen before the future is
    /// returned; the future itself produces the value.
    pub fn derived_async<F, Fut>(derive: F) -> Self
    where
        F: Fn(&EvalContext<S>) -> Result<Fut> + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        NodeBuilder::derive_async(derive).build()
    }
}

impl<S, A> Node<S, A>
where
    S: NodeValue,
    A: Send + 'static,
{
    pub fn key(&self) -> &NodeKey {
        &self.definition.key
    }

    pub(crate) fn erased(&self) -> Arc<dyn ErasedDefinition> {
        self.definition.clone()
    }

    pub(crate) fn setter(&self) -> &Setter<S, A> {
        &self.definition.setter
    }
}

/// Builder for [`Node`].
pub struct NodeBuilder<S, A = Draft<S>> {
    key: Option<NodeKey>,
    getter: Getter<S>,
    setter: Setter<S, A>,
    subscribe: Option<SubscribeFn<S>>,
    should_update: ShouldUpdateFn<S>,
}

impl<S: NodeValue> NodeBuilder<S, Draft<S>> {
    fn with_getter(getter: Getter<S>) -> Self {
        Self {
            key: None,
            getter,
            setter: Setter::Direct(Arc::new(|draft: Draft<S>| draft)),
            subscribe: None,
            should_update: Arc::new(default_should_update::<S>),
        }
    }

    pub fn value(value: S) -> Self {
        Self::with_getter(Getter::Value(value))
    }

    pub fn derive<F>(derive: F) -> Self
    where
        F: Fn(&EvalContext<S>) -> Result<S> + Send + Sync + 'static,
    {
        Self::with_getter(Getter::Derive(Arc::new(derive)))
    }

    pub fn derive_async<F, Fut>(derive: F) -> Self
    where
        F: Fn(&EvalContext<S>) -> Result<Fut> + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        Self::with_getter(Getter::Async(Arc::new(move |ctx: &EvalContext<S>| {
            derive(ctx).map(|future| future.boxed())
        })))
    }
}

impl<S, A> NodeBuilder<S, A>
where
    S: NodeValue,
    A: Send + 'static,
{
    pub fn key(mut self, key: impl Into<NodeKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Replace the change predicate. `f(prev, next)` returns true when
    /// `next` should be committed.
    pub fn should_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&S, &S) -> bool + Send + Sync + 'static,
    {
        self.should_update = Arc::new(f);
        self
    }

    /// Run `f` once when the node is first evaluated in a domain. The
    /// returned teardown runs when the node or the domain is disposed.
    pub fn subscribe<F>(mut self, f: F) -> Self
    where
        F: Fn(Mutator<S>) -> Teardown + Send + Sync + 'static,
    {
        self.subscribe = Some(Arc::new(f));
        self
    }

    /// Handle dispatched actions of type `B`.
    pub fn setter<B, F>(self, f: F) -> NodeBuilder<S, B>
    where
        B: Send + 'static,
        F: Fn(&WriteContext, B) -> Result<()> + Send + Sync + 'static,
    {
        self.with_setter(Setter::Sync(Arc::new(f)))
    }

    /// Handle dispatched actions with an asynchronous handler.
    pub fn async_setter<B, F, Fut>(self, f: F) -> NodeBuilder<S, B>
    where
        B: Send + 'static,
        F: Fn(WriteContext, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.with_setter(Setter::Async(Arc::new(move |ctx: WriteContext, action: B| {
            f(ctx, action).boxed()
        })))
    }

    fn with_setter<B>(self, setter: Setter<S, B>) -> NodeBuilder<S, B> {
        NodeBuilder {
            key: self.key,
            getter: self.getter,
            setter,
            subscribe: self.subscribe,
            should_update: self.should_update,
        }
    }

    pub fn build(self) -> Node<S, A> {
        Node {
            definition: Arc::new(Definition {
                key: self.key.unwrap_or_else(NodeKey::generate),
                getter: self.getter,
                setter: self.setter,
                subscribe: self.subscribe,
                should_update: self.should_update,
            }),
        }
    }
}
