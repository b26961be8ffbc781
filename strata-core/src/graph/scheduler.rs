//! Work Queue
//!
//! The work queue orders the re-evaluations performed by one tick.
//!
//! # Algorithm
//!
//! 1. A write marks the written node as changed and enqueues its direct
//!    dependents.
//! 2. Pop a node and re-evaluate it.
//! 3. If its value changed, mark it changed and enqueue its dependents.
//! 4. Repeat until the queue drains.
//!
//! Order is breadth-first by discovery. There is no topological pre-sort:
//! a node that is popped before one of its inputs updates is simply queued
//! again when that input changes, and its second evaluation overwrites the
//! first. A key that is already waiting in the queue is not queued twice.
//!
//! The set of changed nodes is what the tick notifies once it drains.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexSet;

use crate::error::{GraphError, Result};
use crate::utils::NodeKey;

/// Per-tick queue of nodes awaiting re-evaluation.
#[derive(Debug, Default)]
pub struct WorkQueue {
    queue: VecDeque<NodeKey>,

    /// Keys currently waiting in `queue`.
    queued: HashSet<NodeKey>,

    /// Nodes whose value changed during this tick, in discovery order.
    changed: IndexSet<NodeKey>,

    evaluations: usize,
    limit: usize,
}

impl WorkQueue {
    /// Create an empty queue that allows at most `limit` evaluations.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Queue a node. Returns false if it is already waiting.
    pub fn enqueue(&mut self, key: NodeKey) -> bool {
        if self.queued.contains(&key) {
            return false;
        }
        self.queued.insert(key.clone());
        self.queue.push_back(key);
        true
    }

    pub fn enqueue_all<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = NodeKey>,
    {
        for key in keys {
            self.enqueue(key);
        }
    }

    /// Take the next node to evaluate.
    pub fn pop(&mut self) -> Option<NodeKey> {
        let key = self.queue.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    /// Record that a node's value changed this tick.
    pub fn mark_changed(&mut self, key: NodeKey) {
        self.changed.insert(key);
    }

    /// Count one evaluation against the tick limit.
    pub fn record_evaluation(&mut self) -> Result<()> {
        self.evaluations += 1;
        if self.evaluations > self.limit {
            return Err(GraphError::TickOverflow(self.limit));
        }
        Ok(())
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Finish the tick and return the changed set.
    pub fn into_changed(self) -> IndexSet<NodeKey> {
        self.changed
    }
}
