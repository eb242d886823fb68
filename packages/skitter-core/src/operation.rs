//! Operation descriptors and the operation registry.
//!
//! An operation is the static description of a computation unit: ordered,
//! uniquely named ports, an optional default strategy, an initial state,
//! and a table of callbacks keyed by `(name, arity)`. Operations are
//! registered by name at program start and are immutable afterwards;
//! workflows and strategies refer to them by name and resolve through the
//! registry at deploy time.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::callback::{Callback, CallbackError, CallbackInfo, CallbackResult, EmitMap};
use crate::value::Value;

// ---------------------------------------------------------------------------
// DefinitionError
// ---------------------------------------------------------------------------

/// Load-time errors: malformed operations or workflows.
///
/// Fatal where raised; these never surface during record processing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("duplicate port `{port}` on operation `{operation}`")]
    DuplicatePort { operation: String, port: String },
    #[error("duplicate callback `{name}/{arity}` on operation `{operation}`")]
    DuplicateCallback {
        operation: String,
        name: String,
        arity: usize,
    },
    #[error("operation `{name}` is not registered")]
    UnknownOperation { name: String },
    #[error("operation `{name}` is already registered")]
    AlreadyRegistered { name: String },
    #[error("strategy `{name}` is not registered")]
    UnknownStrategy { name: String },
    #[error("operation `{operation}` has no strategy: none given and no default")]
    MissingStrategy { operation: String },
    #[error("workflow has no node named `{node}`")]
    UnknownNode { node: String },
    #[error("node `{node}` has no port named `{port}`")]
    UnknownPort { node: String, port: String },
    #[error("workflow already has a node named `{node}`")]
    DuplicateNode { node: String },
    #[error("workflow has no in port named `{port}`")]
    UnknownWorkflowPort { port: String },
    #[error("workflow in/out passthrough links form a cycle")]
    PassthroughCycle,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Static descriptor of a computation unit.
#[derive(Debug)]
pub struct Operation {
    name: String,
    in_ports: Vec<String>,
    out_ports: Vec<String>,
    default_strategy: Option<String>,
    initial_state: Value,
    callbacks: HashMap<(String, usize), Callback>,
}

impl Operation {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn in_ports(&self) -> &[String] {
        &self.in_ports
    }

    #[must_use]
    pub fn out_ports(&self) -> &[String] {
        &self.out_ports
    }

    /// Number of in ports, which is also the argument count of `react`.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.in_ports.len()
    }

    #[must_use]
    pub fn default_strategy(&self) -> Option<&str> {
        self.default_strategy.as_deref()
    }

    #[must_use]
    pub fn initial_state(&self) -> &Value {
        &self.initial_state
    }

    /// Port-name to 0-based index, by position in the in-port list.
    #[must_use]
    pub fn in_port_index(&self, port: &str) -> Option<usize> {
        self.in_ports.iter().position(|p| p == port)
    }

    #[must_use]
    pub fn out_port_index(&self, port: &str) -> Option<usize> {
        self.out_ports.iter().position(|p| p == port)
    }

    #[must_use]
    pub fn in_port_name(&self, index: usize) -> Option<&str> {
        self.in_ports.get(index).map(String::as_str)
    }

    /// The `(name, arity)` pairs of all defined callbacks.
    pub fn callbacks(&self) -> impl Iterator<Item = (&str, usize)> {
        self.callbacks.keys().map(|(name, arity)| (name.as_str(), *arity))
    }

    #[must_use]
    pub fn has_callback(&self, name: &str, arity: usize) -> bool {
        self.callbacks.contains_key(&(name.to_string(), arity))
    }

    #[must_use]
    pub fn callback_info(&self, name: &str, arity: usize) -> Option<CallbackInfo> {
        self.callbacks
            .get(&(name.to_string(), arity))
            .map(Callback::info)
    }

    #[must_use]
    pub fn callback(&self, name: &str, arity: usize) -> Option<&Callback> {
        self.callbacks.get(&(name.to_string(), arity))
    }

    /// Invokes the callback `(name, args.len())` on `(state, config, args)`.
    ///
    /// # Errors
    ///
    /// `UnknownCallback` when the operation does not define it; otherwise
    /// any failure of the body or its primitives.
    pub fn call(
        &self,
        name: &str,
        state: &Value,
        config: &Value,
        args: &[Value],
    ) -> Result<CallbackResult, CallbackError> {
        let callback = self.callbacks.get(&(name.to_string(), args.len())).ok_or(
            CallbackError::UnknownCallback {
                name: name.to_string(),
                arity: args.len(),
            },
        )?;
        callback.call(state, config, &self.out_ports, args)
    }

    /// Like [`Operation::call`], but an absent callback yields the neutral
    /// result: nil value, the operation's initial state, no emissions.
    ///
    /// # Errors
    ///
    /// Any failure of the body or its primitives when the callback exists.
    pub fn call_if_exists(
        &self,
        name: &str,
        state: &Value,
        config: &Value,
        args: &[Value],
    ) -> Result<CallbackResult, CallbackError> {
        match self.callbacks.get(&(name.to_string(), args.len())) {
            Some(callback) => callback.call(state, config, &self.out_ports, args),
            None => Ok(CallbackResult {
                value: Value::Nil,
                state: self.initial_state.clone(),
                emit: EmitMap::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationBuilder
// ---------------------------------------------------------------------------

/// Builder validating port and callback uniqueness.
#[derive(Debug)]
pub struct OperationBuilder {
    name: String,
    in_ports: Vec<String>,
    out_ports: Vec<String>,
    default_strategy: Option<String>,
    initial_state: Value,
    callbacks: HashMap<(String, usize), Callback>,
    error: Option<DefinitionError>,
}

impl OperationBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_ports: Vec::new(),
            out_ports: Vec::new(),
            default_strategy: None,
            initial_state: Value::Nil,
            callbacks: HashMap::new(),
            error: None,
        }
    }

    #[must_use]
    pub fn in_ports<S: Into<String>>(mut self, ports: impl IntoIterator<Item = S>) -> Self {
        self.in_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn out_ports<S: Into<String>>(mut self, ports: impl IntoIterator<Item = S>) -> Self {
        self.out_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn default_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.default_strategy = Some(strategy.into());
        self
    }

    #[must_use]
    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }

    /// Adds a callback under `(name, arity)`.
    #[must_use]
    pub fn callback<F>(mut self, name: impl Into<String>, arity: usize, info: CallbackInfo, body: F) -> Self
    where
        F: Fn(&mut crate::callback::CallbackContext<'_>, &[Value]) -> Result<Value, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let key = (name.clone(), arity);
        if self.callbacks.contains_key(&key) && self.error.is_none() {
            self.error = Some(DefinitionError::DuplicateCallback {
                operation: self.name.clone(),
                name,
                arity,
            });
            return self;
        }
        self.callbacks.insert(key, Callback::new(info, body));
        self
    }

    /// Finalizes the descriptor.
    ///
    /// # Errors
    ///
    /// `DuplicatePort` when a port name repeats within either port list,
    /// or the first error recorded while adding callbacks.
    pub fn build(self) -> Result<Operation, DefinitionError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        for ports in [&self.in_ports, &self.out_ports] {
            for (i, port) in ports.iter().enumerate() {
                if ports[..i].contains(port) {
                    return Err(DefinitionError::DuplicatePort {
                        operation: self.name,
                        port: port.clone(),
                    });
                }
            }
        }
        Ok(Operation {
            name: self.name,
            in_ports: self.in_ports,
            out_ports: self.out_ports,
            default_strategy: self.default_strategy,
            initial_state: self.initial_state,
            callbacks: self.callbacks,
        })
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Name-keyed registry of operation descriptors.
///
/// Populated at program start on every node; lookups are lock-free reads.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: DashMap<String, Arc<Operation>>,
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
        }
    }

    /// Registers an operation under its name.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` when the name is taken.
    pub fn register(&self, operation: Operation) -> Result<(), DefinitionError> {
        let name = operation.name().to_string();
        if self.operations.contains_key(&name) {
            return Err(DefinitionError::AlreadyRegistered { name });
        }
        self.operations.insert(name, Arc::new(operation));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Operation>> {
        self.operations.get(name).map(|entry| entry.value().clone())
    }

    /// Resolves a name, failing with `UnknownOperation` when absent.
    ///
    /// # Errors
    ///
    /// `UnknownOperation` when no operation is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<Operation>, DefinitionError> {
        self.get(name).ok_or_else(|| DefinitionError::UnknownOperation {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackTrace;

    fn average_operation() -> Operation {
        OperationBuilder::new("average")
            .in_ports(["value"])
            .out_ports(["current"])
            .initial_state(Value::record([
                ("total", Value::Int(0)),
                ("count", Value::Int(0)),
            ]))
            .callback(
                "react",
                1,
                CallbackInfo {
                    reads_state: true,
                    writes_state: true,
                    emits: true,
                },
                |ctx, args| {
                    let total = ctx.read_field("total")?.as_int().unwrap_or(0)
                        + args[0].as_int().unwrap_or(0);
                    let count = ctx.read_field("count")?.as_int().unwrap_or(0) + 1;
                    ctx.write_field("total", Value::Int(total))?;
                    ctx.write_field("count", Value::Int(count))?;
                    #[allow(clippy::cast_precision_loss)]
                    ctx.emit("current", vec![Value::Float(total as f64 / count as f64)])?;
                    Ok(Value::Nil)
                },
            )
            .build()
            .unwrap()
    }

    #[test]
    fn ports_are_indexed_by_position() {
        let op = OperationBuilder::new("op")
            .in_ports(["a", "b"])
            .out_ports(["x"])
            .build()
            .unwrap();
        assert_eq!(op.arity(), 2);
        assert_eq!(op.in_port_index("a"), Some(0));
        assert_eq!(op.in_port_index("b"), Some(1));
        assert_eq!(op.in_port_index("x"), None);
        assert_eq!(op.out_port_index("x"), Some(0));
        assert_eq!(op.in_port_name(1), Some("b"));
    }

    #[test]
    fn duplicate_port_is_a_definition_error() {
        let err = OperationBuilder::new("op")
            .in_ports(["a", "a"])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::DuplicatePort {
                operation: "op".to_string(),
                port: "a".to_string(),
            }
        );
    }

    #[test]
    fn duplicate_callback_is_a_definition_error() {
        let err = OperationBuilder::new("op")
            .callback("react", 1, CallbackInfo::pure(), |_, _| Ok(Value::Nil))
            .callback("react", 1, CallbackInfo::pure(), |_, _| Ok(Value::Nil))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateCallback { .. }));
    }

    #[test]
    fn call_runs_the_callback_against_state() {
        let op = average_operation();
        let first = op
            .call("react", op.initial_state(), &Value::Nil, &[Value::Int(10)])
            .unwrap();
        assert_eq!(
            first.state,
            Value::record([("total", Value::Int(10)), ("count", Value::Int(1))])
        );
        assert_eq!(first.emit.get("current"), Some(&vec![Value::Float(10.0)]));

        let second = op
            .call("react", &first.state, &Value::Nil, &[Value::Int(20)])
            .unwrap();
        assert_eq!(second.emit.get("current"), Some(&vec![Value::Float(15.0)]));
    }

    #[test]
    fn call_unknown_callback_fails() {
        let op = average_operation();
        let err = op
            .call("missing", &Value::Nil, &Value::Nil, &[])
            .unwrap_err();
        assert_eq!(
            err,
            CallbackError::UnknownCallback {
                name: "missing".to_string(),
                arity: 0,
            }
        );
    }

    #[test]
    fn call_if_exists_returns_neutral_result_when_absent() {
        let op = average_operation();
        let result = op
            .call_if_exists("conf", &Value::Int(99), &Value::Nil, &[Value::Nil])
            .unwrap();
        assert_eq!(result.value, Value::Nil);
        assert_eq!(result.state, op.initial_state().clone());
        assert!(result.emit.is_empty());
    }

    #[test]
    fn callback_info_matches_declared_effects() {
        let op = average_operation();
        let info = op.callback_info("react", 1).unwrap();
        assert!(info.reads_state && info.writes_state && info.emits);
        assert!(op.callback_info("react", 2).is_none());
    }

    /// The declared info must agree with a dynamic trace over random
    /// inputs: each flag set iff the trace observes the primitive class.
    #[test]
    fn callback_info_agrees_with_dynamic_trace() {
        use rand::Rng;

        let op = average_operation();
        let callback = op.callback("react", 1).unwrap();
        let info = callback.info();
        let mut rng = rand::thread_rng();
        let mut observed = CallbackTrace::default();

        for _ in 0..100 {
            let state = Value::record([
                ("total", Value::Int(rng.gen_range(-1000..1000))),
                ("count", Value::Int(rng.gen_range(0..1000))),
            ]);
            let arg = Value::Int(rng.gen_range(-1000..1000));
            let (_, trace) = callback
                .call_traced(&state, &Value::Nil, op.out_ports(), &[arg])
                .unwrap();
            assert!(trace.permitted_by(&info));
            observed.read_state |= trace.read_state;
            observed.wrote_state |= trace.wrote_state;
            observed.emitted |= trace.emitted;
        }

        assert_eq!(observed.read_state, info.reads_state);
        assert_eq!(observed.wrote_state, info.writes_state);
        assert_eq!(observed.emitted, info.emits);
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let registry = OperationRegistry::new();
        registry.register(average_operation()).unwrap();
        let err = registry.register(average_operation()).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::AlreadyRegistered {
                name: "average".to_string()
            }
        );
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = OperationRegistry::new();
        registry.register(average_operation()).unwrap();
        assert!(registry.get("average").is_some());
        assert!(registry.resolve("average").is_ok());
        assert_eq!(
            registry.resolve("nope").unwrap_err(),
            DefinitionError::UnknownOperation {
                name: "nope".to_string()
            }
        );
    }
}
