//! Stale-While-Revalidate
//!
//! A caching policy built from three ordinary nodes:
//!
//! - a revision counter; bumping it forces a refetch,
//! - an asynchronous source that reads the revision and stamps each result
//!   with the time it was fetched,
//! - a resource that serves the source's last good value while a refetch
//!   runs, as long as that value is younger than the stale window.
//!
//! # Windows
//!
//! Data younger than `fresh_age` is fresh. Older data is stale: still served,
//! but [`Swr::get`] starts a revalidation. Data older than `stale_age` is
//! expired and a read refetches instead of serving it.
//!
//! Windows are checked whenever the cache is read through [`Swr`]. While the
//! serving resource has listeners, a timer also revalidates the entry as
//! soon as its fresh window elapses, so subscribers see it move from stale
//! to revalidating without reading it.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::SwrOptions;
use crate::domain::{Domain, EvalContext, HostEvent, Mutator, WeakDomain};
use crate::error::Result;
use crate::graph::{NodeStatus, Teardown};
use crate::node::{Draft, Node, NodeBuilder, NodeValue};
use crate::resource::{Resource, ResourceResult, Suspend};
use crate::utils::NodeKey;

/// Fetched data stamped with its fetch time.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data: T,
    pub fetched_at: Instant,
}

/// Where a cache entry sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwrStatus {
    /// Nothing has been fetched yet.
    Empty,
    Fresh,
    /// Servable, but due for revalidation.
    Stale,
    /// A refetch is in flight. Cached data, if any, is still served.
    Revalidating,
    /// Too old to serve.
    Expired,
}

/// A stale-while-revalidate resource.
pub struct Swr<T> {
    options: SwrOptions,
    revision: Node<u64>,
    source: Node<Fetched<T>>,
    resource: Resource<T>,
}

/// Build a stale-while-revalidate resource around `fetch`.
///
/// `fetch` runs like an asynchronous derivation: reads made through the
/// context before the future is returned are tracked, so the cache also
/// refetches when those nodes change.
pub fn swr<T, F, Fut>(options: SwrOptions, fetch: F) -> Swr<T>
where
    T: NodeValue,
    F: Fn(&EvalContext<Fetched<T>>) -> Result<Fut> + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let prefix = options
        .key
        .clone()
        .unwrap_or_else(|| NodeKey::generate().to_string());

    let mut events = Vec::new();
    if options.revalidate_on_focus {
        events.push(HostEvent::Focus);
    }
    if options.revalidate_on_reconnect {
        events.push(HostEvent::Reconnect);
    }

    let source_key = NodeKey::from(format!("{prefix}:source"));
    let serving_key = NodeKey::from(format!("{prefix}:swr"));
    let fresh_age = options.fresh_age;

    let revision = NodeBuilder::derive(move |ctx: &EvalContext<u64>| {
        let events = events.clone();
        let mutator = ctx.mutator();
        let weak = ctx.domain();
        let (source_key, serving_key) = (source_key.clone(), serving_key.clone());
        ctx.subscription(move || -> Teardown {
            let Some(domain) = weak.upgrade() else {
                return Box::new(|| {});
            };
            let mut handlers = Vec::new();
            for event in events {
                let mutator = mutator.clone();
                let registered = domain.on_host_event(event, move || {
                    debug!(node = %mutator.key(), ?event, "revalidating on host event");
                    if let Err(error) = mutator.update(|revision| revision + 1) {
                        warn!(node = %mutator.key(), %error, "revalidation failed");
                    }
                });
                if let Ok(id) = registered {
                    handlers.push(id);
                }
            }
            let timer = tokio::runtime::Handle::try_current().ok().map(|handle| {
                handle.spawn(revalidate_when_stale::<T>(
                    domain.downgrade(),
                    source_key,
                    serving_key,
                    mutator,
                    fresh_age,
                ))
            });
            let weak = domain.downgrade();
            Box::new(move || {
                if let Some(timer) = timer {
                    timer.abort();
                }
                if let Some(domain) = weak.upgrade() {
                    for id in handlers {
                        domain.off_host_event(id);
                    }
                }
            })
        });
        Ok(ctx.previous().unwrap_or(0))
    })
    .key(format!("{prefix}:revision"))
    .build();

    let rev = revision.clone();
    let source = NodeBuilder::derive_async(move |ctx: &EvalContext<Fetched<T>>| {
        ctx.get(&rev)?;
        let future = fetch(ctx)?;
        Ok(async move {
            let data = future.await?;
            Ok(Fetched {
                data,
                fetched_at: Instant::now(),
            })
        })
    })
    .key(format!("{prefix}:source"))
    .build();

    let src = source.clone();
    let stale_age = options.stale_age;
    let node = NodeBuilder::derive(move |ctx: &EvalContext<ResourceResult<T>>| {
        match ctx.resource_state(&src)? {
            ResourceResult::Success(fetched) => Ok(ResourceResult::Success(fetched.data)),
            unsettled => Ok(match ctx.last_value(&src)? {
                Some(cached) if cached.fetched_at.elapsed() < stale_age => {
                    ResourceResult::Success(cached.data)
                }
                _ => unsettled.map(|fetched| fetched.data),
            }),
        }
    })
    .key(format!("{prefix}:swr"))
    .build();

    Swr {
        options,
        revision,
        source,
        resource: Resource::from_node(node),
    }
}

/// Bump `revision` each time the latest fetch leaves its fresh window while
/// the serving resource has listeners. Runs until the domain or the source
/// entry goes away.
async fn revalidate_when_stale<T: NodeValue>(
    weak: WeakDomain,
    source: NodeKey,
    serving: NodeKey,
    revision: Mutator<u64>,
    fresh_age: Duration,
) {
    let mut revalidated: Option<Instant> = None;
    loop {
        let (mut settled, fetched_at) = {
            let Some(domain) = weak.upgrade() else {
                return;
            };
            let Ok(memory) = domain.memory() else {
                return;
            };
            let Ok(entry) = memory.entry(&source) else {
                return;
            };
            let settled = entry.watch_settled();
            let fetched_at = entry
                .value()
                .and_then(|value| value.downcast_ref::<Fetched<T>>())
                .map(|fetched| fetched.fetched_at);
            (settled, fetched_at)
        };

        // A failed revalidation keeps the old timestamp; wait for the next
        // commit instead of retrying it.
        if let Some(at) = fetched_at.filter(|at| revalidated != Some(*at)) {
            tokio::time::sleep_until(at + fresh_age).await;
            let Some(domain) = weak.upgrade() else {
                return;
            };
            let listened = domain
                .memory()
                .ok()
                .and_then(|memory| memory.nodes.get(&serving).map(|entry| entry.listener_count()))
                .unwrap_or(0)
                > 0;
            let latest = domain
                .read_last::<Fetched<T>>(&source)
                .ok()
                .flatten()
                .map(|fetched| fetched.fetched_at);
            if listened && latest == Some(at) {
                trace!(node = %source, "fresh window elapsed");
                revalidated = Some(at);
                if let Err(error) = revision.update(|revision| revision + 1) {
                    warn!(node = %source, %error, "revalidation failed");
                    return;
                }
            }
            if latest != Some(at) {
                continue;
            }
        }
        if settled.changed().await.is_err() {
            return;
        }
    }
}

impl<T: NodeValue> Swr<T> {
    pub fn options(&self) -> &SwrOptions {
        &self.options
    }

    /// The underlying resource. Reading it directly never revalidates.
    pub fn resource(&self) -> &Resource<T> {
        &self.resource
    }

    pub fn status(&self, domain: &Domain) -> Result<SwrStatus> {
        let Some(cached) = domain.peek(&self.source)? else {
            return Ok(SwrStatus::Empty);
        };
        if domain.status(&self.source) == Some(NodeStatus::Evaluating) {
            return Ok(SwrStatus::Revalidating);
        }
        let age = cached.fetched_at.elapsed();
        Ok(if age < self.options.fresh_age {
            SwrStatus::Fresh
        } else if age < self.options.stale_age {
            SwrStatus::Stale
        } else {
            SwrStatus::Expired
        })
    }

    /// Force a refetch regardless of freshness.
    pub fn trigger(&self, domain: &Domain) -> Result<()> {
        debug!(node = %self.source.key(), "revalidation triggered");
        domain.set(&self.revision, Draft::update(|revision: &u64| revision + 1))
    }

    fn revalidate_if_due(&self, domain: &Domain) -> Result<()> {
        match self.status(domain)? {
            SwrStatus::Stale | SwrStatus::Expired => self.trigger(domain),
            _ => Ok(()),
        }
    }

    /// Read the cache, revalidating stale data and refetching expired data.
    pub fn get(&self, domain: &Domain) -> Result<ResourceResult<T>> {
        self.revalidate_if_due(domain)?;
        domain.get_resource(&self.resource)
    }

    /// Suspending read with the same revalidation policy as [`Swr::get`].
    pub fn read(&self, domain: &Domain) -> Result<T, Suspend> {
        self.revalidate_if_due(domain).map_err(Suspend::Failed)?;
        domain.read(&self.resource)
    }

    pub async fn read_async(&self, domain: &Domain) -> Result<T> {
        self.revalidate_if_due(domain)?;
        domain.read_async(&self.resource).await
    }
}

impl<T> Clone for Swr<T> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            revision: self.revision.clone(),
            source: self.source.clone(),
            resource: self.resource.clone(),
        }
    }
}

impl<T> fmt::Debug for Swr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swr")
            .field("options", &self.options)
            .field("resource", &self.resource)
            .finish()
    }
}
