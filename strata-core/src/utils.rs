//! Utilities
//!
//! Key generation, the default equality predicate, and deterministic
//! serialization of family parameters.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{GraphError, Result};

/// Identity of a node inside a domain.
///
/// Keys are either supplied by the author or generated. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Generate a new key that is unique for the lifetime of the process.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("node-{}", to_base36(id)).into())
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for NodeKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

impl Borrow<str> for NodeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Default change predicate: returns `true` when `next` should replace `prev`.
///
/// Values that are unequal to themselves (NaN) are treated as the same value,
/// so writing NaN over NaN does not schedule anything.
pub fn default_should_update<S: PartialEq>(prev: &S, next: &S) -> bool {
    #[allow(clippy::eq_op)]
    let both_unordered = prev != prev && next != next;
    prev != next && !both_unordered
}

/// Serialize call parameters into a stable string.
///
/// Used to derive keys for parametrized node families; equal parameters
/// always produce equal strings.
pub fn serialize_params<P: Serialize + ?Sized>(params: &P) -> Result<String> {
    serde_json::to_string(params).map_err(|e| GraphError::Serialize(e.to_string()))
}
