//! Global-state strategy: one worker holds the operation's state.
//!
//! All records funnel to a single worker, so the operation observes a
//! totally ordered stream and its state never needs merging. Multi-input
//! operations gather their argument vectors through the matcher on the
//! worker's node before `react` fires.

use async_trait::async_trait;
use skitter_core::{MatchOutcome, Value};

use super::{
    build_config, data_config, data_record, data_workers, require_callback, token_from_message,
    token_message, MatchTable, ProcessResult, Strategy, StrategyContext, StrategyError,
};
use crate::placement::Placement;
use crate::worker::Lifetime;

/// One deployment-lifetime worker per operation instance.
#[derive(Debug, Default)]
pub struct GlobalState {
    inbox: MatchTable,
}

impl GlobalState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inbox: MatchTable::new(),
        }
    }
}

#[async_trait]
impl Strategy for GlobalState {
    fn name(&self) -> &'static str {
        "global_state"
    }

    async fn deploy(&self, cx: &StrategyContext, args: &Value) -> Result<Value, StrategyError> {
        let operation = cx.operation()?;
        require_callback(self.name(), &operation, "react", operation.arity())?;
        let config = build_config(&operation, args)?;
        let worker = cx
            .create_remote(
                operation.initial_state().clone(),
                "global",
                Lifetime::Deployment,
                Placement::default(),
            )
            .await?;
        Ok(data_record(config, &[worker]))
    }

    async fn deliver(
        &self,
        cx: &StrategyContext,
        record: Value,
        port: usize,
    ) -> Result<(), StrategyError> {
        let data = cx.deployment_data()?;
        let workers = data_workers(&data)?;
        let target = workers
            .first()
            .ok_or_else(|| StrategyError::MalformedDeploymentData {
                reason: "empty worker table".to_string(),
            })?;
        cx.send(target, token_message(port, record), cx.invocation.clone())
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
        Ok(ProcessResult::unchanged()
            .with_state(result.state)
            .with_emit(result.emit))
    }
}
