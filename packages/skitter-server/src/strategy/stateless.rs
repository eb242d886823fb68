//! Stateless strategy: immutable workers spread over every worker core.
//!
//! The operation's state is never written, so records can go to any
//! worker. Single-input operations round-robin; multi-input operations
//! route by invocation so an invocation's tokens converge on one worker's
//! matcher.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use skitter_core::{MatchOutcome, Value};

use super::{
    build_config, data_config, data_record, data_workers, require_callback, stable_hash,
    token_from_message, token_message, MatchTable, ProcessResult, Strategy, StrategyContext,
    StrategyError,
};
use crate::placement::Placement;
use crate::worker::Lifetime;

/// One worker per advertised worker core; deliver spreads records across
/// them.
#[derive(Debug, Default)]
pub struct Stateless {
    cursor: AtomicUsize,
    inbox: MatchTable,
}

impl Stateless {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            inbox: MatchTable::new(),
        }
    }
}

#[async_trait]
impl Strategy for Stateless {
    fn name(&self) -> &'static str {
        "stateless"
    }

    async fn deploy(&self, cx: &StrategyContext, args: &Value) -> Result<Value, StrategyError> {
        let operation = cx.operation()?;
        require_callback(self.name(), &operation, "react", operation.arity())?;
        let config = build_config(&operation, args)?;

        let mut workers = Vec::with_capacity(cx.worker_capacity());
        for i in 0..cx.worker_capacity() {
            let worker = cx
                .create_remote(
                    operation.initial_state().clone(),
                    &format!("w{i}"),
                    Lifetime::Deployment,
                    Placement::default(),
                )
                .await?;
            workers.push(worker);
        }
        Ok(data_record(config, &workers))
    }

    #[allow(clippy::cast_possible_truncation)]
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
        let index = if operation.arity() > 1 {
            // Tokens of one invocation must meet in a single matcher.
            (stable_hash(&cx.invocation) % workers.len() as u64) as usize
        } else {
            self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len()
        };

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
        tag: &str,
    ) -> Result<ProcessResult, StrategyError> {
        let (port, value) = token_from_message(&message)?;
        let operation = cx.operation()?;
        let arity = operation.arity();

        let args = if arity <= 1 {
            vec![value]
        } else {
            let key = (cx.deployment, cx.node_idx, tag.to_string());
            match self
                .inbox
                .add(key, cx.invocation.clone(), port, value, arity)
            {
                MatchOutcome::Ready { args, .. } => args,
                MatchOutcome::Pending => return Ok(ProcessResult::unchanged()),
            }
        };

        let config = data_config(&cx.deployment_data()?);
        let result = operation.call("react", state, &config, &args)?;
        // Immutable workers: any state the callback wrote is discarded.
        Ok(ProcessResult::unchanged().with_emit(result.emit))
    }
}
