//! Node Families
//!
//! A family builds one node per distinct parameter value. Keys are derived
//! from the family key plus the serialized parameters, and built nodes are
//! memoized so equal parameters always resolve to the same definition.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::definition::{Draft, Node, NodeBuilder, NodeValue};
use crate::error::Result;
use crate::utils::{serialize_params, NodeKey};

type Factory<P, S, A> = Arc<dyn Fn(&P) -> NodeBuilder<S, A> + Send + Sync>;

/// A parametrized set of nodes.
///
/// # Example
///
/// ```rust,ignore
/// let user = NodeFamily::new("user", |id: &u32| {
///     let id = *id;
///     NodeBuilder::derive_async(move |_| Ok(fetch_user(id)))
/// });
/// let alice = user.get(&1)?;
/// ```
pub struct NodeFamily<P, S, A = Draft<S>> {
    key: NodeKey,
    factory: Factory<P, S, A>,
    nodes: DashMap<String, Node<S, A>>,
}

impl<P, S, A> NodeFamily<P, S, A>
where
    P: Serialize,
    S: NodeValue,
    A: Send + 'static,
{
    pub fn new<F>(key: impl Into<NodeKey>, factory: F) -> Self
    where
        F: Fn(&P) -> NodeBuilder<S, A> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            factory: Arc::new(factory),
            nodes: DashMap::new(),
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Get the node for `params`, building it on first use.
    pub fn get(&self, params: &P) -> Result<Node<S, A>> {
        let id = serialize_params(params)?;
        if let Some(node) = self.nodes.get(&id) {
            return Ok(node.clone());
        }
        let key = format!("{}-{}", self.key, id);
        let node = (self.factory)(params).key(key).build();
        Ok(self.nodes.entry(id).or_insert(node).clone())
    }

    /// Forget the node built for `params`. Domains that already hold it are
    /// unaffected; the next `get` builds a new definition.
    pub fn remove(&self, params: &P) -> Result<Option<Node<S, A>>> {
        let id = serialize_params(params)?;
        Ok(self.nodes.remove(&id).map(|(_, node)| node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<P, S, A> fmt::Debug for NodeFamily<P, S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeFamily")
            .field("key", &self.key)
            .field("len", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_params_share_a_node() {
        let family = NodeFamily::new("square", |n: &i64| NodeBuilder::value(n * n));
        let a = family.get(&3).unwrap();
        let b = family.get(&3).unwrap();
        let c = family.get(&4).unwrap();

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().as_str(), "square-3");
        assert_eq!(family.len(), 2);
    }

    #[test]
    fn composite_params_serialize_into_key() {
        let family = NodeFamily::new("pair", |p: &(String, u8)| {
            NodeBuilder::value(format!("{}:{}", p.0, p.1))
        });
        let node = family.get(&("a".to_string(), 1)).unwrap();
        assert_eq!(node.key().as_str(), r#"pair-["a",1]"#);
    }

    #[test]
    fn removed_params_are_rebuilt() {
        let family = NodeFamily::new("n", |n: &u8| NodeBuilder::value(*n));
        family.get(&1).unwrap();
        assert!(family.remove(&1).unwrap().is_some());
        assert!(family.is_empty());
        assert!(family.remove(&1).unwrap().is_none());
    }
}
