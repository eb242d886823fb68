//! The strategy protocol.
//!
//! A strategy is a distribution policy an operation plugs into. The
//! runtime never routes a record directly: deployment goes through
//! `deploy`, every record crossing a workflow edge goes through the
//! destination's `deliver`, and every worker message goes through
//! `process`. Strategies are registered by name and resolved at deploy
//! time.

pub mod global;
pub mod keyed;
pub mod stateless;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use skitter_core::{
    CallbackError, EmitMap, Invocation, MatchOutcome, Matcher, Operation, Value,
};

use crate::node::NodeRuntime;
use crate::placement::{Placement, PlacementError};
use crate::store::{Deployment, DeploymentRef};
use crate::worker::{self, Lifetime, SendError, WorkerRef};

pub use global::GlobalState;
pub use keyed::KeyedState;
pub use stateless::Stateless;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Runtime failures of strategy hooks.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// The operation does not satisfy the strategy's requirements. Fatal
    /// for the deployment.
    #[error("operation `{operation}` lacks callback `{callback}/{arity}` required by `{strategy}`")]
    MissingCallback {
        strategy: &'static str,
        operation: String,
        callback: &'static str,
        arity: usize,
    },
    /// The operation cannot be managed by this strategy at all.
    #[error("strategy `{strategy}` cannot manage operation `{operation}`: {reason}")]
    Unsupported {
        strategy: &'static str,
        operation: String,
        reason: String,
    },
    /// User callback code failed; the worker restarts with initial state.
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Send(#[from] SendError),
    /// A port appeared in both `emit` and `emit_invocation` of one result.
    #[error("port `{port}` appears in both emit and emit_invocation")]
    EmitCollision { port: String },
    /// A process result emitted on a port the operation does not declare.
    #[error("emit to unknown out port `{port}`")]
    UnknownEmitPort { port: String },
    /// The deployment was torn down under the hook.
    #[error("deployment is no longer live")]
    DeploymentGone,
    /// Deployment data was read before publication finished.
    #[error("deployment data for node {node_idx} is not yet published")]
    MissingDeploymentData { node_idx: usize },
    /// The strategy's own deployment data did not have the expected shape.
    #[error("malformed deployment data: {reason}")]
    MalformedDeploymentData { reason: String },
    /// Creating a worker on a remote node failed.
    #[error("remote worker creation failed: {reason}")]
    RemoteCreate { reason: String },
}

// ---------------------------------------------------------------------------
// ProcessResult
// ---------------------------------------------------------------------------

/// What a `process` hook asks the worker runtime to do. Missing pieces
/// mean "no change" / "no emit".
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    /// Replacement worker state, if any.
    pub state: Option<Value>,
    /// Emissions inheriting the current invocation.
    pub emit: EmitMap,
    /// Emissions stamped with their own invocations (source strategies).
    pub emit_invocation: Vec<(String, Vec<(Value, Invocation)>)>,
}

impl ProcessResult {
    /// No state change, nothing emitted.
    #[must_use]
    pub fn unchanged() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn with_emit(mut self, emit: EmitMap) -> Self {
        self.emit = emit;
        self
    }

    /// The two emit forms combine additively per port; the same port in
    /// both is rejected.
    ///
    /// # Errors
    ///
    /// `EmitCollision` naming the offending port.
    pub fn check_collisions(&self) -> Result<(), StrategyError> {
        for (port, _) in &self.emit_invocation {
            if self.emit.contains_key(port) {
                return Err(StrategyError::EmitCollision { port: port.clone() });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StrategyContext
// ---------------------------------------------------------------------------

/// Immutable environment passed into every strategy hook: the deployment
/// and operation instance the hook runs for, the invocation being
/// processed, and handles into the hosting runtime.
pub struct StrategyContext {
    runtime: Arc<NodeRuntime>,
    pub deployment: DeploymentRef,
    pub node_idx: usize,
    pub invocation: Invocation,
}

impl StrategyContext {
    pub(crate) fn new(
        runtime: Arc<NodeRuntime>,
        deployment: DeploymentRef,
        node_idx: usize,
        invocation: Invocation,
    ) -> Self {
        Self {
            runtime,
            deployment,
            node_idx,
            invocation,
        }
    }

    fn entry(&self) -> Result<Arc<Deployment>, StrategyError> {
        self.runtime
            .deployments
            .get(self.deployment)
            .ok_or(StrategyError::DeploymentGone)
    }

    /// The operation this hook runs for.
    ///
    /// # Errors
    ///
    /// `DeploymentGone` after teardown.
    pub fn operation(&self) -> Result<Arc<Operation>, StrategyError> {
        Ok(self.entry()?.nodes[self.node_idx].operation.clone())
    }

    /// The workflow arguments of this operation instance.
    ///
    /// # Errors
    ///
    /// `DeploymentGone` after teardown.
    pub fn args(&self) -> Result<Value, StrategyError> {
        Ok(self.entry()?.nodes[self.node_idx].args.clone())
    }

    /// The deployment data this instance's `deploy` hook returned.
    /// Written exactly once during deployment, read-only thereafter.
    ///
    /// # Errors
    ///
    /// `MissingDeploymentData` before publication, `DeploymentGone` after
    /// teardown.
    pub fn deployment_data(&self) -> Result<Value, StrategyError> {
        self.entry()?
            .data_for(self.node_idx)
            .ok_or(StrategyError::MissingDeploymentData {
                node_idx: self.node_idx,
            })
    }

    /// Name of the node this hook is running on.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.runtime.config.name
    }

    /// Total worker cores in the current membership view, floored at one.
    #[must_use]
    pub fn worker_capacity(&self) -> usize {
        self.runtime
            .placement
            .capacity(&self.runtime.members.snapshot())
    }

    /// Creates a worker on this node.
    #[must_use]
    pub fn create_local(&self, state: Value, tag: &str, lifetime: Lifetime) -> WorkerRef {
        worker::spawn(
            &self.runtime,
            self.deployment,
            self.node_idx,
            state,
            tag.to_string(),
            lifetime,
        )
    }

    /// Creates a worker on a node chosen by the placement service.
    ///
    /// # Errors
    ///
    /// Placement failures, or `RemoteCreate` when the chosen node cannot
    /// spawn the worker.
    pub async fn create_remote(
        &self,
        state: Value,
        tag: &str,
        lifetime: Lifetime,
        placement: Placement,
    ) -> Result<WorkerRef, StrategyError> {
        let view = self.runtime.members.snapshot();
        let target = self.runtime.placement.pick(&view, &placement)?;
        if target == self.runtime.config.name {
            return Ok(self.create_local(state, tag, lifetime));
        }
        self.runtime
            .remote_create(
                &target,
                self.deployment,
                self.node_idx,
                state,
                tag.to_string(),
                lifetime,
            )
            .await
    }

    /// Fire-and-forget send to a worker, local or remote. Ordering is
    /// FIFO per sender pair.
    ///
    /// # Errors
    ///
    /// `Stopped` for dead local workers, `NodeDown` for unreachable
    /// remote nodes.
    pub async fn send(
        &self,
        target: &WorkerRef,
        message: Value,
        invocation: Invocation,
    ) -> Result<(), SendError> {
        self.runtime.send_to_worker(target, message, invocation).await
    }

    /// Stops a worker, local or remote.
    ///
    /// # Errors
    ///
    /// `NodeDown` when a remote target's node is unreachable.
    pub async fn stop(&self, target: &WorkerRef) -> Result<(), SendError> {
        self.runtime.stop_worker(target).await
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name()).finish()
    }
}

/// Distribution policy plugged into an operation: the three hooks the
/// runtime drives.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Registry name of this strategy.
    fn name(&self) -> &'static str;

    /// Called once per operation instance during workflow deployment. May
    /// allocate workers; the returned value becomes the instance's
    /// deployment data for all later hooks.
    async fn deploy(&self, cx: &StrategyContext, args: &Value) -> Result<Value, StrategyError>;

    /// Called by the router each time a record crosses an edge into this
    /// operation. Must not compute results; it forwards the record to an
    /// appropriate worker.
    async fn deliver(
        &self,
        cx: &StrategyContext,
        record: Value,
        port: usize,
    ) -> Result<(), StrategyError>;

    /// Called on the worker's node when the worker dequeues a message.
    async fn process(
        &self,
        cx: &StrategyContext,
        message: Value,
        state: &Value,
        tag: &str,
    ) -> Result<ProcessResult, StrategyError>;
}

// ---------------------------------------------------------------------------
// Shared strategy helpers
// ---------------------------------------------------------------------------

/// Per-worker matchers for strategies whose workers gather multi-input
/// argument sets. Keyed by `(deployment, node-idx, worker tag)`, which is
/// unique on the worker's node for the built-in strategies.
#[derive(Debug, Default)]
pub(crate) struct MatchTable {
    tables: DashMap<(DeploymentRef, usize, String), Mutex<Matcher>>,
}

impl MatchTable {
    pub(crate) fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    pub(crate) fn add(
        &self,
        key: (DeploymentRef, usize, String),
        invocation: Invocation,
        port: usize,
        value: Value,
        arity: usize,
    ) -> MatchOutcome {
        let entry = self.tables.entry(key).or_insert_with(|| Mutex::new(Matcher::new()));
        let outcome = entry.lock().add(invocation, port, value, arity);
        outcome
    }
}

/// Fails unless the operation defines `callback/arity`.
pub(crate) fn require_callback(
    strategy: &'static str,
    operation: &Operation,
    callback: &'static str,
    arity: usize,
) -> Result<(), StrategyError> {
    if operation.has_callback(callback, arity) {
        Ok(())
    } else {
        Err(StrategyError::MissingCallback {
            strategy,
            operation: operation.name().to_string(),
            callback,
            arity,
        })
    }
}

/// Builds the configuration for an operation instance by running its
/// optional `conf` callback on the workflow arguments.
pub(crate) fn build_config(operation: &Operation, args: &Value) -> Result<Value, StrategyError> {
    let result = operation.call_if_exists(
        "conf",
        operation.initial_state(),
        &Value::Nil,
        &[args.clone()],
    )?;
    Ok(result.value)
}

/// Standard deployment data of the built-in strategies: the instance
/// configuration plus the worker table.
pub(crate) fn data_record(config: Value, workers: &[WorkerRef]) -> Value {
    Value::record([
        ("config", config),
        (
            "workers",
            Value::List(workers.iter().map(WorkerRef::to_value).collect()),
        ),
    ])
}

/// Configuration slot of [`data_record`] data.
pub(crate) fn data_config(data: &Value) -> Value {
    data.field("config").cloned().unwrap_or(Value::Nil)
}

/// Worker table slot of [`data_record`] data.
pub(crate) fn data_workers(data: &Value) -> Result<Vec<WorkerRef>, StrategyError> {
    let malformed = |reason: &str| StrategyError::MalformedDeploymentData {
        reason: reason.to_string(),
    };
    let list = data
        .field("workers")
        .and_then(Value::as_list)
        .ok_or_else(|| malformed("missing worker table"))?;
    list.iter()
        .map(|v| WorkerRef::from_value(v).ok_or_else(|| malformed("bad worker ref")))
        .collect()
}

/// Message shape the built-in strategies send to their workers: the
/// in-port index plus the record.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn token_message(port: usize, value: Value) -> Value {
    Value::record([("port", Value::Int(port as i64)), ("value", value)])
}

/// Inverse of [`token_message`].
pub(crate) fn token_from_message(message: &Value) -> Result<(usize, Value), StrategyError> {
    let malformed = || StrategyError::MalformedDeploymentData {
        reason: "worker message is not a port token".to_string(),
    };
    let port = message
        .field("port")
        .and_then(Value::as_int)
        .and_then(|p| usize::try_from(p).ok())
        .ok_or_else(malformed)?;
    let value = message.field("value").cloned().ok_or_else(malformed)?;
    Ok((port, value))
}

/// Deterministic 64-bit FNV-1a over the MsgPack encoding of a value.
/// Every node hashes a key identically, unlike `RandomState`.
pub(crate) fn stable_hash<T: serde::Serialize>(value: &T) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let bytes = rmp_serde::to_vec_named(value).unwrap_or_default();
    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skitter_core::{CallbackInfo, OperationBuilder};

    #[test]
    fn process_result_collision_detected() {
        let mut result = ProcessResult::unchanged();
        result.emit.insert("out".to_string(), vec![Value::Int(1)]);
        result
            .emit_invocation
            .push(("out".to_string(), vec![(Value::Int(2), Invocation::External)]));
        let err = result.check_collisions().unwrap_err();
        assert!(matches!(err, StrategyError::EmitCollision { .. }));

        let mut disjoint = ProcessResult::unchanged();
        disjoint.emit.insert("a".to_string(), vec![Value::Int(1)]);
        disjoint
            .emit_invocation
            .push(("b".to_string(), vec![(Value::Int(2), Invocation::External)]));
        assert!(disjoint.check_collisions().is_ok());
    }

    #[test]
    fn require_callback_checks_name_and_arity() {
        let op = OperationBuilder::new("op")
            .in_ports(["a"])
            .callback("react", 1, CallbackInfo::pure(), |_, _| Ok(Value::Nil))
            .build()
            .unwrap();
        assert!(require_callback("s", &op, "react", 1).is_ok());
        assert!(matches!(
            require_callback("s", &op, "react", 2),
            Err(StrategyError::MissingCallback { .. })
        ));
        assert!(matches!(
            require_callback("s", &op, "key", 1),
            Err(StrategyError::MissingCallback { .. })
        ));
    }

    #[test]
    fn data_record_round_trips_workers() {
        let workers = vec![
            WorkerRef {
                node: "w1".to_string(),
                id: 1,
            },
            WorkerRef {
                node: "w2".to_string(),
                id: 9,
            },
        ];
        let data = data_record(Value::from("cfg"), &workers);
        assert_eq!(data_config(&data), Value::from("cfg"));
        assert_eq!(data_workers(&data).unwrap(), workers);
    }

    #[test]
    fn data_workers_rejects_malformed_data() {
        assert!(data_workers(&Value::Nil).is_err());
        let bad = Value::record([("workers", Value::List(vec![Value::Int(1)]))]);
        assert!(data_workers(&bad).is_err());
    }

    #[test]
    fn token_message_round_trip() {
        let message = token_message(2, Value::from("v"));
        let (port, value) = token_from_message(&message).unwrap();
        assert_eq!(port, 2);
        assert_eq!(value, Value::from("v"));
        assert!(token_from_message(&Value::Nil).is_err());
    }

    #[test]
    fn stable_hash_is_deterministic_and_discriminating() {
        let a = Value::Int(1);
        let b = Value::Int(2);
        assert_eq!(stable_hash(&a), stable_hash(&a));
        assert_ne!(stable_hash(&a), stable_hash(&b));
    }

    #[test]
    fn build_config_uses_conf_when_present() {
        let op = OperationBuilder::new("print")
            .in_ports(["_"])
            .out_ports(["_"])
            .callback("conf", 1, CallbackInfo::pure(), |_, args| {
                Ok(args[0].clone())
            })
            .build()
            .unwrap();
        assert_eq!(
            build_config(&op, &Value::from("L")).unwrap(),
            Value::from("L")
        );

        let bare = OperationBuilder::new("bare").in_ports(["_"]).build().unwrap();
        assert_eq!(build_config(&bare, &Value::from("L")).unwrap(), Value::Nil);
    }
}
