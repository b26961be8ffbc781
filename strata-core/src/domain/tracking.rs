//! Dependency Tracking
//!
//! Tracks which node is currently evaluating, so that reads performed by a
//! derivation are recorded as dependencies of that derivation.
//!
//! # Implementation
//!
//! A thread-local stack holds one entry per in-progress evaluation. Starting
//! an evaluation pushes a fresh, empty read set; each tracked read appends
//! to the top entry; finishing pops the entry and hands the read set to the
//! evaluator, which diffs it against the node's previous edges.
//!
//! Nested evaluations (a derivation reading a node that has never been
//! evaluated) push their own entry, so reads never leak between levels. The
//! stack doubles as the cycle detector: a node already on the stack for the
//! same domain is being evaluated further up the call chain.

use std::cell::RefCell;

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::utils::NodeKey;

thread_local! {
    static TRACKING_STACK: RefCell<Vec<TrackingEntry>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
struct TrackingEntry {
    domain: u64,
    key: NodeKey,
    reads: SmallVec<[NodeKey; 4]>,
}

/// Guard for one evaluation's tracking entry.
///
/// The entry is popped by [`finish`](Self::finish), or on drop if the
/// derivation panicked.
#[derive(Debug)]
pub struct TrackingScope {
    domain: u64,
    key: NodeKey,
    finished: bool,
}

impl TrackingScope {
    /// Push a new tracking entry for `key` in `domain`.
    pub fn enter(domain: u64, key: NodeKey) -> Self {
        TRACKING_STACK.with(|stack| {
            stack.borrow_mut().push(TrackingEntry {
                domain,
                key: key.clone(),
                reads: SmallVec::new(),
            });
        });

        Self {
            domain,
            key,
            finished: false,
        }
    }

    /// Check if `key` is currently evaluating in `domain` on this thread.
    pub fn is_evaluating(domain: u64, key: &NodeKey) -> bool {
        TRACKING_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|entry| entry.domain == domain && &entry.key == key)
        })
    }

    /// Record a read of `key` against the current evaluation.
    pub fn track(domain: u64, key: NodeKey) {
        TRACKING_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                if entry.domain == domain {
                    entry.reads.push(key);
                }
            }
        });
    }

    /// Pop the entry and return the deduplicated read set.
    pub fn finish(mut self) -> IndexSet<NodeKey> {
        self.finished = true;
        self.pop().map(|entry| entry.reads.into_iter().collect()).unwrap_or_default()
    }

    fn pop(&self) -> Option<TrackingEntry> {
        TRACKING_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = &popped {
                debug_assert!(
                    entry.domain == self.domain && entry.key == self.key,
                    "tracking scope mismatch: expected {}, got {}",
                    self.key,
                    entry.key
                );
            }
            popped
        })
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        if !self.finished {
            self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> NodeKey {
        NodeKey::from(s)
    }

    #[test]
    fn scope_marks_node_as_evaluating() {
        assert!(!TrackingScope::is_evaluating(1, &key("a")));

        {
            let _scope = TrackingScope::enter(1, key("a"));
            assert!(TrackingScope::is_evaluating(1, &key("a")));
            assert!(!TrackingScope::is_evaluating(2, &key("a")));
        }

        assert!(!TrackingScope::is_evaluating(1, &key("a")));
    }

    #[test]
    fn reads_are_collected_and_deduplicated() {
        let scope = TrackingScope::enter(1, key("a"));
        TrackingScope::track(1, key("x"));
        TrackingScope::track(1, key("y"));
        TrackingScope::track(1, key("x"));

        let reads = scope.finish();
        assert_eq!(reads.len(), 2);
        assert!(reads.contains(&key("x")));
        assert!(reads.contains(&key("y")));
        assert!(!TrackingScope::is_evaluating(1, &key("a")));
    }

    #[test]
    fn nested_scopes_keep_reads_separate() {
        let outer = TrackingScope::enter(1, key("outer"));
        TrackingScope::track(1, key("x"));

        {
            let inner = TrackingScope::enter(1, key("inner"));
            TrackingScope::track(1, key("y"));
            let inner_reads = inner.finish();
            assert_eq!(inner_reads.len(), 1);
            assert!(inner_reads.contains(&key("y")));
        }

        let outer_reads = outer.finish();
        assert_eq!(outer_reads.len(), 1);
        assert!(outer_reads.contains(&key("x")));
    }

    #[test]
    fn reads_from_other_domains_are_ignored() {
        let scope = TrackingScope::enter(1, key("a"));
        TrackingScope::track(2, key("x"));
        assert!(scope.finish().is_empty());
    }
}
