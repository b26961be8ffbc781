//! Error Types
//!
//! Every fallible engine operation returns [`GraphError`]. Errors are stored
//! inside node slots and inside [`ResourceResult`](crate::ResourceResult), so
//! the type is cheap to clone and comparable.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::utils::NodeKey;

/// Result alias used throughout the crate.
pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Errors produced by the graph engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// A node read itself, directly or transitively, while evaluating.
    #[error("cyclic dependency detected while evaluating `{0}`")]
    CyclicDependency(NodeKey),

    /// A slot that must hold a value was empty.
    #[error("unable to return a nullish value for `{0}`")]
    NullishValue(NodeKey),

    /// The node has no committed value yet and its derivation is in flight.
    #[error("node `{0}` is still pending")]
    Pending(NodeKey),

    /// The domain was destroyed before the operation ran.
    #[error("domain has been destroyed")]
    Destroyed,

    /// The stored value does not have the type the node handle expects.
    /// Happens when two different definitions share one key.
    #[error("node `{0}` holds a value of an unexpected type")]
    TypeMismatch(NodeKey),

    /// An asynchronous setter was invoked from a synchronous write path.
    #[error("node `{0}` has an asynchronous setter and must be dispatched asynchronously")]
    AsyncSetter(NodeKey),

    /// Family parameters could not be serialized into a key.
    #[error("failed to serialize node parameters: {0}")]
    Serialize(String),

    /// A single tick re-evaluated more nodes than the configured limit.
    #[error("tick exceeded {0} evaluations")]
    TickOverflow(usize),

    /// A user derivation or setter failed.
    #[error(transparent)]
    Failure(#[from] Failure),
}

impl GraphError {
    /// Wrap an arbitrary error as a derivation failure.
    pub fn failure<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failure(Failure::new(error))
    }

    /// Build a failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failure(Failure::new(Message(message.into())))
    }

    /// True if the error only means "not settled yet".
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// A user-level failure, shared by reference.
///
/// Two failures compare equal only if they are the same allocation, so a
/// re-thrown error does not look like a new one to the equality check.
#[derive(Clone)]
pub struct Failure(Arc<dyn StdError + Send + Sync>);

impl Failure {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Borrow the inner error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_compare_by_identity() {
        let a = GraphError::msg("boom");
        let b = GraphError::msg("boom");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn failure_display_is_transparent() {
        let err = GraphError::msg("Not found");
        assert_eq!(err.to_string(), "Not found");
    }

    #[test]
    fn pending_is_recognized() {
        assert!(GraphError::Pending(NodeKey::from("a")).is_pending());
        assert!(!GraphError::Destroyed.is_pending());
    }
}
