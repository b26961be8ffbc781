//! Domain Memory
//!
//! A [`Domain`] is one isolated instance of the graph store. It owns the
//! arena of node entries, the pending write roots, and the batching hook
//! that delivers change notifications to the host.
//!
//! # Lifecycle
//!
//! Domains are created explicitly and destroyed explicitly. Destroying a
//! domain runs every registered subscription teardown exactly once and
//! drops all edges and listeners. Dropping the last handle does the same.
//!
//! # Locking
//!
//! The arena sits behind a single mutex that is never held while user code
//! runs: derivations, setters, listeners, teardowns and the batching hook
//! are all invoked after the guard is released.
//!
//! Batches are tracked per thread. A write only defers to a batch opened on
//! its own thread, so a batch held open elsewhere never delays it.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::config::DomainConfig;
use crate::error::{GraphError, Result};
use crate::graph::{Listener, ListenerId, NodeState, Teardown, WorkQueue};
use crate::utils::NodeKey;

/// Host hook that receives one batched notification job per tick.
///
/// The host decides when the job runs; it may defer it to its own frame
/// or paint cycle.
pub type Batcher = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Host-level events that resources may revalidate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEvent {
    /// The host regained focus.
    Focus,
    /// Network connectivity was restored.
    Reconnect,
}

/// Identifier of a host event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandlerId(u64);

type HostHandler = Arc<dyn Fn() + Send + Sync>;

thread_local! {
    /// Open batch count per domain on this thread.
    static OPEN_BATCHES: RefCell<Vec<(u64, u32)>> = const { RefCell::new(Vec::new()) };
}

/// Guard for one open batch on the current thread. Closes on drop, so a
/// panicking derivation cannot leave the batch open.
struct BatchScope {
    domain: u64,
}

impl BatchScope {
    fn open(domain: u64) -> Self {
        OPEN_BATCHES.with(|batches| {
            let mut batches = batches.borrow_mut();
            match batches.iter_mut().find(|(id, _)| *id == domain) {
                Some((_, depth)) => *depth += 1,
                None => batches.push((domain, 1)),
            }
        });
        Self { domain }
    }

    fn is_open(domain: u64) -> bool {
        OPEN_BATCHES.with(|batches| batches.borrow().iter().any(|(id, _)| *id == domain))
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        OPEN_BATCHES.with(|batches| {
            let mut batches = batches.borrow_mut();
            if let Some(index) = batches.iter().position(|(id, _)| *id == self.domain) {
                batches[index].1 -= 1;
                if batches[index].1 == 0 {
                    batches.swap_remove(index);
                }
            }
        });
    }
}

/// Mutable state of a domain, guarded by the domain mutex.
pub(crate) struct Memory {
    pub nodes: IndexMap<NodeKey, NodeState>,

    /// Number of ticks run so far.
    pub tick: u64,

    /// Sequence number stamped on value-changing commits.
    pub seq: u64,

    /// Changed nodes whose dependents still need to be processed.
    pub pending_roots: IndexSet<NodeKey>,

    pub host_handlers: IndexMap<HostHandlerId, (HostEvent, HostHandler)>,
    next_handler: u64,

    pub destroyed: bool,
}

impl Memory {
    fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            tick: 0,
            seq: 0,
            pending_roots: IndexSet::new(),
            host_handlers: IndexMap::new(),
            next_handler: 0,
            destroyed: false,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn entry(&self, key: &NodeKey) -> Result<&NodeState> {
        self.nodes
            .get(key)
            .ok_or_else(|| GraphError::NullishValue(key.clone()))
    }

    pub fn entry_mut(&mut self, key: &NodeKey) -> Result<&mut NodeState> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| GraphError::NullishValue(key.clone()))
    }

    /// Replace the dependency edges of `key` with `reads`, unlinking the
    /// edges that were not read this time and linking the new ones.
    pub fn install_edges(&mut self, key: &NodeKey, reads: IndexSet<NodeKey>) {
        let previous = match self.nodes.get(key) {
            Some(entry) => entry.dependencies().clone(),
            None => return,
        };

        for stale in previous.difference(&reads) {
            if let Some(dependency) = self.nodes.get_mut(stale) {
                dependency.remove_dependent(key);
            }
            trace!(node = %key, dependency = %stale, "unlinked");
        }
        for fresh in reads.difference(&previous) {
            if let Some(dependency) = self.nodes.get_mut(fresh) {
                dependency.add_dependent(key.clone());
            }
            trace!(node = %key, dependency = %fresh, "linked");
        }

        if let Some(entry) = self.nodes.get_mut(key) {
            for stale in previous.difference(&reads) {
                entry.remove_dependency(stale);
            }
            for fresh in reads {
                entry.add_dependency(fresh);
            }
        }
    }

    /// Remove a node and every edge it participates in. Returns its teardown.
    pub fn remove_node(&mut self, key: &NodeKey) -> Option<Teardown> {
        let mut entry = self.nodes.shift_remove(key)?;
        let (dependencies, dependents, disposer) = entry.dispose();

        for dependency in &dependencies {
            if let Some(node) = self.nodes.get_mut(dependency) {
                node.remove_dependent(key);
            }
        }
        for dependent in &dependents {
            if let Some(node) = self.nodes.get_mut(dependent) {
                node.remove_dependency(key);
            }
        }
        self.pending_roots.shift_remove(key);
        disposer
    }

    /// Dispose every node. Returns the teardowns to run.
    fn clear(&mut self) -> Vec<Teardown> {
        let teardowns = self
            .nodes
            .values_mut()
            .filter_map(|entry| entry.dispose().2)
            .collect();
        self.nodes.clear();
        self.pending_roots.clear();
        self.host_handlers.clear();
        teardowns
    }
}

pub(crate) struct Inner {
    id: u64,
    config: DomainConfig,
    batcher: Batcher,
    memory: Mutex<Memory>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let memory = self.memory.get_mut();
        if memory.destroyed {
            return;
        }
        memory.destroyed = true;
        for teardown in memory.clear() {
            teardown();
        }
    }
}

/// Handle to one graph store instance. Clones share the same store.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Domain`].
#[derive(Clone)]
pub struct WeakDomain {
    inner: Weak<Inner>,
}

impl WeakDomain {
    pub fn upgrade(&self) -> Option<Domain> {
        self.inner.upgrade().map(|inner| Domain { inner })
    }
}

impl fmt::Debug for WeakDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakDomain")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain {
    /// Create a domain that delivers notifications synchronously.
    pub fn new() -> Self {
        Self::with_batcher(DomainConfig::default(), Arc::new(|job: Box<dyn FnOnce() + Send>| job()))
    }

    /// Create a domain with a host-supplied batching hook.
    pub fn with_batcher(config: DomainConfig, batcher: Batcher) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        debug!(domain = id, name = config.name.as_deref().unwrap_or(""), "domain created");

        Self {
            inner: Arc::new(Inner {
                id,
                config,
                batcher,
                memory: Mutex::new(Memory::new()),
            }),
        }
    }

    /// Create a domain with a config and synchronous notification delivery.
    pub fn with_config(config: DomainConfig) -> Self {
        Self::with_batcher(config, Arc::new(|job: Box<dyn FnOnce() + Send>| job()))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &DomainConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakDomain {
        WeakDomain {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of ticks this domain has run.
    pub fn tick(&self) -> u64 {
        self.inner.memory.lock().tick
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.memory.lock().destroyed
    }

    /// Lock the arena, failing if the domain was destroyed.
    pub(crate) fn memory(&self) -> Result<MutexGuard<'_, Memory>> {
        let memory = self.inner.memory.lock();
        if memory.destroyed {
            return Err(GraphError::Destroyed);
        }
        Ok(memory)
    }

    /// Destroy the domain: run every teardown once, drop all state.
    pub fn destroy(&self) {
        let teardowns = {
            let mut memory = self.inner.memory.lock();
            if memory.destroyed {
                return;
            }
            memory.destroyed = true;
            memory.clear()
        };
        debug!(domain = self.inner.id, teardowns = teardowns.len(), "domain destroyed");
        for teardown in teardowns {
            teardown();
        }
    }

    /// Run `f` as one batch: writes made inside it are processed by a single
    /// tick once the outermost batch closes.
    pub fn batch<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.memory()?;
        let result = {
            let _scope = BatchScope::open(self.inner.id);
            f()
        };
        let flush = !BatchScope::is_open(self.inner.id) && {
            let memory = self.inner.memory.lock();
            !memory.pending_roots.is_empty() && !memory.destroyed
        };
        if flush {
            let tick = self.run_tick();
            if result.is_ok() {
                tick?;
            }
        }
        result
    }

    /// Record that `key` changed and run a tick unless this thread has a
    /// batch open.
    pub(crate) fn schedule(&self, key: NodeKey) -> Result<()> {
        self.memory()?.pending_roots.insert(key);
        if BatchScope::is_open(self.inner.id) {
            return Ok(());
        }
        self.run_tick()
    }

    /// Drain the pending roots, re-evaluating dependents breadth-first, then
    /// deliver one batched notification for everything that changed.
    fn run_tick(&self) -> Result<()> {
        let mut queue = WorkQueue::new(self.inner.config.max_tick_evaluations);
        let tick = {
            let mut memory = self.memory()?;
            memory.tick += 1;
            memory.tick
        };
        let mut overflow = None;

        // Writes made by evaluations join this tick. Listeners run after the
        // scope closes, so their writes start a new one.
        let scope = BatchScope::open(self.inner.id);
        loop {
            let roots = {
                let mut memory = self.inner.memory.lock();
                if memory.pending_roots.is_empty() || memory.destroyed {
                    break;
                }
                let roots = std::mem::take(&mut memory.pending_roots);
                for root in &roots {
                    if let Some(entry) = memory.nodes.get(root) {
                        queue.enqueue_all(entry.dependents().iter().cloned());
                    }
                }
                roots
            };
            for root in roots {
                queue.mark_changed(root);
            }

            while let Some(key) = queue.pop() {
                if let Err(error) = queue.record_evaluation() {
                    warn!(tick, limit = self.inner.config.max_tick_evaluations, "tick overflow");
                    self.inner.memory.lock().pending_roots.clear();
                    overflow = Some(error);
                    break;
                }
                match self.evaluate(&key) {
                    Ok(true) => {
                        let dependents = self
                            .memory()
                            .ok()
                            .and_then(|memory| {
                                memory.nodes.get(&key).map(|entry| entry.dependents().clone())
                            })
                            .unwrap_or_default();
                        queue.mark_changed(key);
                        queue.enqueue_all(dependents);
                    }
                    Ok(false) => {}
                    Err(error) => {
                        trace!(tick, node = %key, %error, "re-evaluation failed");
                    }
                }
            }
        }

        drop(scope);
        debug!(tick, evaluations = queue.evaluations(), "tick drained");
        self.flush(queue.into_changed());
        overflow.map_or(Ok(()), Err)
    }

    /// Hand the listeners of every changed node to the batching hook, each
    /// listener exactly once.
    fn flush(&self, changed: IndexSet<NodeKey>) {
        if changed.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = {
            let Ok(memory) = self.memory() else {
                return;
            };
            let mut seen: IndexMap<ListenerId, Listener> = IndexMap::new();
            for key in &changed {
                if let Some(entry) = memory.nodes.get(key) {
                    for (id, listener) in entry.listeners() {
                        seen.entry(*id).or_insert_with(|| listener.clone());
                    }
                }
            }
            seen.into_values().collect()
        };
        if listeners.is_empty() {
            return;
        }
        trace!(changed = changed.len(), listeners = listeners.len(), "flushing notifications");
        (self.inner.batcher)(Box::new(move || {
            for listener in listeners {
                listener();
            }
        }));
    }

    /// Register a handler for a host event.
    pub fn on_host_event<F>(&self, event: HostEvent, handler: F) -> Result<HostHandlerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut memory = self.memory()?;
        let id = HostHandlerId(memory.next_handler);
        memory.next_handler += 1;
        memory.host_handlers.insert(id, (event, Arc::new(handler)));
        Ok(id)
    }

    pub fn off_host_event(&self, id: HostHandlerId) -> bool {
        self.inner
            .memory
            .lock()
            .host_handlers
            .shift_remove(&id)
            .is_some()
    }

    /// Report a host event. Every matching handler runs inside one batch.
    pub fn emit(&self, event: HostEvent) -> Result<()> {
        let handlers: Vec<HostHandler> = self
            .memory()?
            .host_handlers
            .values()
            .filter(|(kind, _)| *kind == event)
            .map(|(_, handler)| handler.clone())
            .collect();
        debug!(domain = self.inner.id, ?event, handlers = handlers.len(), "host event");
        self.batch(|| {
            for handler in handlers {
                handler();
            }
            Ok(())
        })
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let memory = self.inner.memory.lock();
        f.debug_struct("Domain")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("nodes", &memory.nodes.len())
            .field("tick", &memory.tick)
            .field("destroyed", &memory.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn domains_are_isolated() {
        let node = Node::value(1);
        let a = Domain::new();
        let b = Domain::new();

        a.set(&node, 5).unwrap();
        assert_eq!(a.get_value(&node).unwrap(), 5);
        assert_eq!(b.get_value(&node).unwrap(), 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn destroyed_domain_rejects_operations() {
        let node = Node::value(1);
        let domain = Domain::new();
        domain.destroy();

        assert!(domain.is_destroyed());
        assert_eq!(domain.get_value(&node), Err(GraphError::Destroyed));
        // Destroying twice is harmless.
        domain.destroy();
    }

    #[test]
    fn batcher_receives_one_job_per_tick() {
        let jobs = Arc::new(AtomicUsize::new(0));
        let counter = jobs.clone();
        let domain = Domain::with_batcher(
            DomainConfig::default(),
            Arc::new(move |job: Box<dyn FnOnce() + Send>| {
                counter.fetch_add(1, Ordering::SeqCst);
                job();
            }),
        );

        let a = Node::value(0);
        let b = Node::value(0);
        domain.add_listener(&a, || {}).unwrap();
        domain.add_listener(&b, || {}).unwrap();

        domain
            .batch(|| {
                domain.set(&a, 1)?;
                domain.set(&b, 1)
            })
            .unwrap();

        assert_eq!(jobs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_on_another_thread_does_not_defer_writes() {
        let domain = Domain::new();
        let source = Node::value(100);
        let s = source.clone();
        let derived = Node::derived(move |ctx| Ok(ctx.get(&s)? + 1));
        assert_eq!(domain.get_value(&derived).unwrap(), 101);

        let (opened_tx, opened_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let other = domain.clone();
        let holder = std::thread::spawn(move || {
            other
                .batch(|| {
                    opened_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });

        opened_rx.recv().unwrap();
        domain.set(&source, 101).unwrap();
        assert_eq!(domain.get_value(&derived).unwrap(), 102);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(domain.get_value(&derived).unwrap(), 102);
    }

    #[test]
    fn destroy_releases_listeners() {
        let domain = Domain::new();
        let node = Node::value(0);
        let token = Arc::new(());
        let held = token.clone();
        domain
            .add_listener(&node, move || {
                let _ = &held;
            })
            .unwrap();
        assert_eq!(Arc::strong_count(&token), 2);

        domain.destroy();
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn host_events_reach_matching_handlers() {
        let domain = Domain::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = domain
            .on_host_event(HostEvent::Focus, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        domain.emit(HostEvent::Reconnect).unwrap();
        domain.emit(HostEvent::Focus).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(domain.off_host_event(id));
        domain.emit(HostEvent::Focus).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_limits_tick_evaluations() {
        let domain = Domain::with_config(DomainConfig {
            name: Some("bounded".into()),
            max_tick_evaluations: 1,
        });
        let source = Node::value(0);
        let s = source.clone();
        let a = Node::derived(move |ctx| Ok(ctx.get(&s)? + 1));
        let s = source.clone();
        let b = Node::derived(move |ctx| Ok(ctx.get(&s)? + 2));

        domain.get_value(&a).unwrap();
        domain.get_value(&b).unwrap();

        assert_eq!(domain.set(&source, 1), Err(GraphError::TickOverflow(1)));
    }
}
