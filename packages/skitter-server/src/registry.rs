//! Strategy registry.
//!
//! Strategies are registered by name at program start, like operations.
//! Flattened workflows carry strategy names; every node resolves them
//! against its own registry at deploy time, which keeps the mutual
//! references between operations and strategies out of the object graph.

use std::sync::Arc;

use dashmap::DashMap;

use skitter_core::DefinitionError;

use crate::strategy::{GlobalState, KeyedState, Stateless, Strategy};

/// Name-keyed registry of strategies.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: DashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: DashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in strategies.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(Stateless::new()));
        registry.register(Arc::new(GlobalState::new()));
        registry.register(Arc::new(KeyedState::new()));
        registry
    }

    /// Registers a strategy under its name, replacing any previous entry.
    pub fn register(&self, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(name).map(|entry| entry.value().clone())
    }

    /// Resolves a name, failing with `UnknownStrategy` when absent.
    ///
    /// # Errors
    ///
    /// `UnknownStrategy` when no strategy is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Strategy>, DefinitionError> {
        self.get(name).ok_or_else(|| DefinitionError::UnknownStrategy {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = StrategyRegistry::with_builtins();
        assert!(registry.get("stateless").is_some());
        assert!(registry.get("global_state").is_some());
        assert!(registry.get("keyed_state").is_some());
    }

    #[test]
    fn unknown_strategy_fails_resolution() {
        let registry = StrategyRegistry::new();
        assert!(registry.get("stateless").is_none());
        assert_eq!(
            registry.resolve("stateless").unwrap_err(),
            DefinitionError::UnknownStrategy {
                name: "stateless".to_string()
            }
        );
    }
}
