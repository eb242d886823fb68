//! Multi-input matcher.
//!
//! Operations with more than one in port fire once a value has arrived on
//! every port for the same invocation. The matcher buffers partial token
//! sets per invocation and reports `Ready` exactly when the set is
//! complete, handing back the argument vector in port-index order.

use std::collections::{BTreeMap, HashMap};

use crate::invocation::Invocation;
use crate::value::Value;

/// Outcome of adding one token.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// All ports for the invocation have arrived; the entry was removed.
    /// Arguments are ordered by port index.
    Ready {
        invocation: Invocation,
        args: Vec<Value>,
    },
    /// More ports are still missing.
    Pending,
}

#[derive(Debug)]
struct PartialEntry {
    partial: BTreeMap<usize, Value>,
    arity: usize,
}

/// Buffers partial token sets until an invocation is complete.
///
/// Duplicate tokens for the same `(invocation, port)` overwrite the
/// buffered value; strategies use this for replay.
#[derive(Debug, Default)]
pub struct Matcher {
    entries: HashMap<Invocation, PartialEntry>,
}

impl Matcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Adds a token `(invocation, port, value)` for an operation of the
    /// given arity.
    pub fn add(
        &mut self,
        invocation: Invocation,
        port: usize,
        value: Value,
        arity: usize,
    ) -> MatchOutcome {
        let complete = {
            let entry = self
                .entries
                .entry(invocation.clone())
                .or_insert_with(|| PartialEntry {
                    partial: BTreeMap::new(),
                    arity,
                });
            entry.partial.insert(port, value);
            entry.partial.len() == entry.arity
        };

        if complete {
            if let Some(entry) = self.entries.remove(&invocation) {
                // BTreeMap iteration is ordered by key, i.e. by port index.
                let args = entry.partial.into_values().collect();
                return MatchOutcome::Ready { invocation, args };
            }
        }
        MatchOutcome::Pending
    }

    /// Number of invocations with buffered partial sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
