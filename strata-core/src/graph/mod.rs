//! Dependency Graph
//!
//! This module holds the building blocks of a domain's arena: the per-node
//! entry and the per-tick work queue.
//!
//! # Overview
//!
//! Nodes are indexed by key. Each entry keeps both forward edges
//! (dependencies, the nodes it read) and reverse edges (dependents, the nodes
//! that read it). Edges are re-diffed after every evaluation, so the graph is
//! dynamic: a derivation may read different nodes each time it runs.
//!
//! When a node changes, the work queue walks its dependents breadth-first
//! and re-evaluates them until nothing else changes.

mod node;
mod scheduler;

pub use node::{Listener, ListenerId, NodeState, NodeStatus, Teardown, Value};
pub use scheduler::WorkQueue;
