//! Node Definitions
//!
//! Immutable descriptors of reactive state. A node never holds a value by
//! itself; every [`Domain`](crate::Domain) that reads it keeps its own copy.

mod definition;
mod family;

pub use definition::{Draft, Effect, Node, NodeBuilder, NodeValue};
pub use family::NodeFamily;

pub(crate) use definition::{ErasedDefinition, Evaluation, Outcome, Setter};
