//! Domains
//!
//! A domain is one isolated instance of the graph store: the arena of node
//! state, the scheduler that propagates writes, and the contexts handed to
//! user derivations and setters.

mod context;
mod evaluator;
mod interface;
mod memory;
mod tracking;

pub use context::{EvalContext, Mutator, WriteContext};
pub use memory::{Batcher, Domain, HostEvent, HostHandlerId, WeakDomain};
