//! Resources
//!
//! A [`Resource`] views a node through its settlement state instead of its
//! raw value. It is itself a derived node of [`ResourceResult`], so it can be
//! read, listened to, and combined like any other node.
//!
//! # States
//!
//! - `Pending`: the source is evaluating, or has never produced a value.
//! - `Success`: the source's latest evaluation committed a value.
//! - `Failure`: the source's latest evaluation failed. Failures are captured
//!   here rather than propagated to the reader.

mod combinators;

pub use combinators::{wait_for_all, wait_for_any};

use std::fmt;

use tokio::sync::watch;

use crate::domain::EvalContext;
use crate::error::{GraphError, Result};
use crate::node::{Node, NodeBuilder, NodeValue};
use crate::utils::NodeKey;

/// Settlement state of an asynchronous node.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceResult<T> {
    Pending,
    Success(T),
    Failure(GraphError),
}

impl<T> ResourceResult<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&GraphError> {
        match self {
            Self::Failure(error) => Some(error),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResourceResult<U> {
        match self {
            Self::Pending => ResourceResult::Pending,
            Self::Success(data) => ResourceResult::Success(f(data)),
            Self::Failure(error) => ResourceResult::Failure(error),
        }
    }

    /// Convert into a plain result, treating `Pending` as an error.
    pub fn into_result(self, key: &NodeKey) -> Result<T> {
        match self {
            Self::Success(data) => Ok(data),
            Self::Failure(error) => Err(error),
            Self::Pending => Err(GraphError::Pending(key.clone())),
        }
    }
}

/// A node of [`ResourceResult`] values.
pub struct Resource<T> {
    node: Node<ResourceResult<T>>,
}

impl<T: NodeValue> Resource<T> {
    pub(crate) fn from_node(node: Node<ResourceResult<T>>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Node<ResourceResult<T>> {
        &self.node
    }

    pub fn key(&self) -> &NodeKey {
        self.node.key()
    }
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resource").field(&self.node).finish()
    }
}

/// Wrap `source` as a resource. The resource's key is the source key with a
/// `:resource` suffix, so wrapping the same node twice yields the same slot.
pub fn resource<T, A>(source: &Node<T, A>) -> Resource<T>
where
    T: NodeValue,
    A: Send + 'static,
{
    let source = source.clone();
    let key = format!("{}:resource", source.key());
    let node = NodeBuilder::derive(move |ctx: &EvalContext<ResourceResult<T>>| {
        ctx.resource_state(&source)
    })
    .key(key)
    .build();
    Resource::from_node(node)
}

/// Why a suspending read did not return data.
#[derive(Debug, thiserror::Error)]
pub enum Suspend {
    /// Still pending. Await the handle, then read again.
    #[error("resource is pending")]
    Pending(Settled),

    #[error(transparent)]
    Failed(GraphError),
}

/// Resolves when a node next commits.
pub struct Settled {
    key: NodeKey,
    receiver: watch::Receiver<u64>,
}

impl Settled {
    pub(crate) fn new(key: NodeKey, receiver: watch::Receiver<u64>) -> Self {
        Self { key, receiver }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Wait for the next commit. Fails if the node is disposed first.
    pub async fn wait(mut self) -> Result<()> {
        self.receiver
            .changed()
            .await
            .map_err(|_| GraphError::NullishValue(self.key.clone()))
    }
}

impl fmt::Debug for Settled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settled").field("key", &self.key).finish()
    }
}
