//! Keyed-state strategy: state partitioned by a key callback.
//!
//! One aggregator worker per worker core. Deliver runs the operation's
//! pure `key` callback on each record and hashes the key, so records with
//! equal keys always land on the same aggregator and each aggregator owns
//! the state of its key slice.

use std::collections::BTreeMap;

use async_trait::async_trait;
use skitter_core::Value;

use super::{
    build_config, data_config, data_record, data_workers, require_callback, stable_hash,
    token_from_message, token_message, ProcessResult, Strategy, StrategyContext, StrategyError,
};
use crate::placement::Placement;
use crate::worker::Lifetime;

/// Hash-partitioned aggregators, one per worker core.
#[derive(Debug, Default)]
pub struct KeyedState;

impl KeyedState {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for KeyedState {
    fn name(&self) -> &'static str {
        "keyed_state"
    }

    async fn deploy(&self, cx: &StrategyContext, args: &Value) -> Result<Value, StrategyError> {
        let operation = cx.operation()?;
        if operation.arity() != 1 {
            return Err(StrategyError::Unsupported {
                strategy: self.name(),
                operation: operation.name().to_string(),
                reason: "keyed state requires exactly one in port".to_string(),
            });
        }
        require_callback(self.name(), &operation, "key", 1)?;
        require_callback(self.name(), &operation, "react", 1)?;
        let config = build_config(&operation, args)?;

        // Aggregators hold one state entry per key, so they start with an
        // empty key table rather than the operation's initial state.
        let mut workers = Vec::with_capacity(cx.worker_capacity());
        for _ in 0..cx.worker_capacity() {
            let worker = cx
                .create_remote(
                    Value::Record(BTreeMap::new()),
                    "aggregator",
                    Lifetime::Deployment,
                    Placement::default(),
                )
                .await?;
            workers.push(worker);
        }
        Ok(data_record(config, &workers))
    }

    async fn deliver(
        &self,
        cx: &StrategyContext,
        record: Value,
        port: usize,
    ) -> Result<(), StrategyError> {
        let data = cx.deployment_data()?;
        let workers = data_workers(&data)?;
        if workers.is_empty() {
            return Err(StrategyError::MalformedDeploymentData {
                reason: "empty worker table".to_string(),
            });
        }

        let operation = cx.operation()?;
        let config = data_config(&data);
        // `key` is pure: it ignores the state we pass.
        let key = operation
            .call("key", operation.initial_state(), &config, &[record.clone()])?
            .value;
        #[allow(clippy::cast_possible_truncation)]
        let index = (stable_hash(&key) % workers.len() as u64) as usize;

        cx.send(
            &workers[index],
            token_message(port, record),
            cx.invocation.clone(),
        )
        .await?;
        Ok(())
    }

    async fn process(
        &self,
        cx: &StrategyContext,
        message: Value,
        state: &Value,
        _tag: &str,
    ) -> Result<ProcessResult, StrategyError> {
        let (_port, value) = token_from_message(&message)?;
        let operation = cx.operation()?;
        let config = data_config(&cx.deployment_data()?);

        // Several keys can hash onto one aggregator; each keeps its own
        // state slot so they never observe each other.
        let key = operation
            .call("key", operation.initial_state(), &config, &[value.clone()])?
            .value;
        let slot = format!("{:016x}", stable_hash(&key));
        let current = state
            .field(&slot)
            .cloned()
            .unwrap_or_else(|| operation.initial_state().clone());

        let result = operation.call("react", &current, &config, &[value])?;

        let mut table = state.as_record().cloned().unwrap_or_default();
        table.insert(slot, result.state);
        Ok(ProcessResult::unchanged()
            .with_state(Value::Record(table))
            .with_emit(result.emit))
    }
}
