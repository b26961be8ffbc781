//! Strata Core
//!
//! This crate provides a reactive dependency-graph store. It implements:
//!
//! - Node definitions (constants, synchronous and asynchronous derivations)
//! - Isolated domains that hold per-instance node state
//! - Automatic dependency tracking and batched, breadth-first propagation
//! - Resources, a pending/success/failure view of asynchronous nodes
//! - `wait_for_all` / `wait_for_any` resource combinators
//! - A stale-while-revalidate caching layer
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `node`: Immutable node definitions and parametrized families
//! - `domain`: Domain memory, the evaluator and the public read/write API
//! - `graph`: Per-node arena entries and the tick work queue
//! - `resource`: Resource wrapper and combinators
//! - `swr`: Stale-while-revalidate layer
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_core::{Domain, Node, NodeBuilder};
//!
//! let fahrenheit = NodeBuilder::value(32.0_f64).key("Fahrenheit").build();
//!
//! let f = fahrenheit.clone();
//! let celsius = Node::derived(move |ctx| Ok((ctx.get(&f)? - 32.0) * 5.0 / 9.0));
//!
//! let domain = Domain::new();
//! domain.set(&fahrenheit, 212.0)?;
//! assert_eq!(domain.get_value(&celsius)?, 100.0);
//! ```

pub mod config;
pub mod domain;
pub mod error;
mod graph;
pub mod node;
pub mod resource;
pub mod swr;
pub mod utils;

pub use config::{DomainConfig, SwrOptions};
pub use domain::{Batcher, Domain, EvalContext, HostEvent, HostHandlerId, Mutator, WeakDomain, WriteContext};
pub use error::{Failure, GraphError, Result};
pub use graph::{ListenerId, NodeStatus, Teardown};
pub use node::{Draft, Node, NodeBuilder, NodeFamily, NodeValue};
pub use resource::{resource, wait_for_all, wait_for_any, Resource, ResourceResult, Settled, Suspend};
pub use swr::{swr, Fetched, Swr, SwrStatus};
pub use utils::NodeKey;
