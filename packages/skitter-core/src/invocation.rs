//! Invocation tokens.
//!
//! An invocation identifies one logical firing of a workflow. Records that
//! belong to the same firing carry the same token, which is how multi-input
//! operations correlate their arrivals. The `External` sentinel marks
//! records that entered the system from outside.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Token tagging a logical firing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Invocation {
    /// Record entered from outside the system.
    External,
    /// Firing allocated by a node-local source.
    Ref { node: String, seq: u64 },
}

impl Invocation {
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Invocation::External)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::External => write!(f, "external"),
            Invocation::Ref { node, seq } => write!(f, "{node}#{seq}"),
        }
    }
}

/// Node-local allocator of fresh invocation tokens.
///
/// Tokens are unique cluster-wide because they embed the allocating node's
/// name next to a monotonic counter.
#[derive(Debug)]
pub struct InvocationSource {
    node: String,
    seq: AtomicU64,
}

impl InvocationSource {
    #[must_use]
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Allocates the next invocation token.
    pub fn next(&self) -> Invocation {
        Invocation::Ref {
            node: self.node.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}
