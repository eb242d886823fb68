//! Callback IR and executor.
//!
//! A callback body is an explicit function over a [`CallbackContext`] that
//! exposes exactly five primitives: `read_state`, `read_field`,
//! `write_state`, `write_field`, and `emit`. Surface tooling lowers user
//! code to this form; the runtime only ever sees the IR. The context
//! accumulates `(state', emit-map)` while the body runs and records which
//! primitives were used, so a callback's static [`CallbackInfo`] can be
//! checked against its dynamic behavior.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Map from out-port name to the ordered records emitted on it.
pub type EmitMap = BTreeMap<String, Vec<Value>>;

/// Static description of a callback's effects.
///
/// Must be faithful: a strategy may assume a callback marked
/// `reads_state: false` ignores any state passed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackInfo {
    pub reads_state: bool,
    pub writes_state: bool,
    pub emits: bool,
}

impl CallbackInfo {
    /// A pure callback: no state access, no emissions.
    #[must_use]
    pub fn pure() -> Self {
        Self {
            reads_state: false,
            writes_state: false,
            emits: false,
        }
    }
}

/// Which primitives actually ran during one callback execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackTrace {
    pub read_state: bool,
    pub wrote_state: bool,
    pub emitted: bool,
}

impl CallbackTrace {
    /// Whether this trace is consistent with the declared info: every
    /// observed primitive class must be declared.
    #[must_use]
    pub fn permitted_by(&self, info: &CallbackInfo) -> bool {
        (!self.read_state || info.reads_state)
            && (!self.wrote_state || info.writes_state)
            && (!self.emitted || info.emits)
    }
}

/// Errors raised by callback primitives or bodies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    /// `read_field`/`write_field` on a missing field or non-record state.
    #[error("state has no field `{field}`")]
    MissingField { field: String },
    /// `emit` named a port that is not one of the operation's out ports.
    #[error("emit to unknown out port `{port}`")]
    UnknownPort { port: String },
    /// `call` named a callback the operation does not define.
    #[error("operation defines no callback `{name}/{arity}`")]
    UnknownCallback { name: String, arity: usize },
    /// The callback body itself failed.
    #[error("callback failed: {0}")]
    Failure(String),
}

/// Execution environment handed to a callback body.
///
/// Owns the in-progress state and emit map; the five primitives are the
/// only way a body can touch them.
pub struct CallbackContext<'a> {
    state: Value,
    config: &'a Value,
    out_ports: &'a [String],
    emit: EmitMap,
    trace: CallbackTrace,
}

impl<'a> CallbackContext<'a> {
    fn new(state: Value, config: &'a Value, out_ports: &'a [String]) -> Self {
        Self {
            state,
            config,
            out_ports,
            emit: EmitMap::new(),
            trace: CallbackTrace::default(),
        }
    }

    /// `read_state` primitive: returns the current state.
    pub fn read_state(&mut self) -> Value {
        self.trace.read_state = true;
        self.state.clone()
    }

    /// `read_field` primitive: returns a field of the (record) state.
    ///
    /// # Errors
    ///
    /// `MissingField` when the state is not a record or lacks the field.
    pub fn read_field(&mut self, field: &str) -> Result<Value, CallbackError> {
        self.trace.read_state = true;
        self.state
            .field(field)
            .cloned()
            .ok_or_else(|| CallbackError::MissingField {
                field: field.to_string(),
            })
    }

    /// `write_state` primitive: replaces the state.
    pub fn write_state(&mut self, value: Value) {
        self.trace.wrote_state = true;
        self.state = value;
    }

    /// `write_field` primitive: updates one existing field of the state.
    ///
    /// # Errors
    ///
    /// `MissingField` when the state is not a record or lacks the field.
    pub fn write_field(&mut self, field: &str, value: Value) -> Result<(), CallbackError> {
        self.trace.wrote_state = true;
        match &mut self.state {
            Value::Record(fields) if fields.contains_key(field) => {
                fields.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(CallbackError::MissingField {
                field: field.to_string(),
            }),
        }
    }

    /// `emit` primitive: sets the records for an out port, overwriting any
    /// prior emission on the same port.
    ///
    /// # Errors
    ///
    /// `UnknownPort` when the port is not declared by the operation.
    pub fn emit(&mut self, port: &str, values: Vec<Value>) -> Result<(), CallbackError> {
        if !self.out_ports.iter().any(|p| p == port) {
            return Err(CallbackError::UnknownPort {
                port: port.to_string(),
            });
        }
        self.trace.emitted = true;
        self.emit.insert(port.to_string(), values);
        Ok(())
    }

    /// The operation configuration for this execution. Not a primitive;
    /// configuration is part of the callback's input.
    #[must_use]
    pub fn config(&self) -> &Value {
        self.config
    }
}

/// Result of executing one callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackResult {
    /// Value of the final expression of the body.
    pub value: Value,
    /// Final state: the last `write_state`/`write_field` result, or the
    /// input state when the body never wrote.
    pub state: Value,
    /// Accumulated emissions, port by port.
    pub emit: EmitMap,
}

/// Body of a callback in IR form.
pub type CallbackBody =
    Arc<dyn Fn(&mut CallbackContext<'_>, &[Value]) -> Result<Value, CallbackError> + Send + Sync>;

/// A named entry point of an operation: declared effects plus the body.
#[derive(Clone)]
pub struct Callback {
    info: CallbackInfo,
    body: CallbackBody,
}

impl Callback {
    pub fn new<F>(info: CallbackInfo, body: F) -> Self
    where
        F: Fn(&mut CallbackContext<'_>, &[Value]) -> Result<Value, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            info,
            body: Arc::new(body),
        }
    }

    #[must_use]
    pub fn info(&self) -> CallbackInfo {
        self.info
    }

    /// Executes the body against `(state, config, args)`.
    ///
    /// # Errors
    ///
    /// Propagates any primitive or body failure unchanged.
    pub fn call(
        &self,
        state: &Value,
        config: &Value,
        out_ports: &[String],
        args: &[Value],
    ) -> Result<CallbackResult, CallbackError> {
        self.call_traced(state, config, out_ports, args)
            .map(|(result, _)| result)
    }

    /// Executes the body and additionally returns the primitive trace.
    ///
    /// # Errors
    ///
    /// Propagates any primitive or body failure unchanged.
    pub fn call_traced(
        &self,
        state: &Value,
        config: &Value,
        out_ports: &[String],
        args: &[Value],
    ) -> Result<(CallbackResult, CallbackTrace), CallbackError> {
        let mut ctx = CallbackContext::new(state.clone(), config, out_ports);
        let value = (self.body)(&mut ctx, args)?;
        let trace = ctx.trace;
        Ok((
            CallbackResult {
                value,
                state: ctx.state,
                emit: ctx.emit,
            },
            trace,
        ))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("info", &self.info).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out_ports() -> Vec<String> {
        vec!["out".to_string(), "other".to_string()]
    }

    #[test]
    fn untouched_state_passes_through() {
        let cb = Callback::new(CallbackInfo::pure(), |_ctx, _args| Ok(Value::Int(1)));
        let result = cb
            .call(&Value::Int(42), &Value::Nil, &out_ports(), &[])
            .unwrap();
        assert_eq!(result.value, Value::Int(1));
        assert_eq!(result.state, Value::Int(42));
        assert!(result.emit.is_empty());
    }

    #[test]
    fn write_state_replaces_and_read_sees_it() {
        let info = CallbackInfo {
            reads_state: true,
            writes_state: true,
            emits: false,
        };
        let cb = Callback::new(info, |ctx, _args| {
            ctx.write_state(Value::Int(7));
            Ok(ctx.read_state())
        });
        let result = cb.call(&Value::Nil, &Value::Nil, &out_ports(), &[]).unwrap();
        assert_eq!(result.state, Value::Int(7));
        assert_eq!(result.value, Value::Int(7));
    }

    #[test]
    fn write_field_updates_existing_field_only() {
        let info = CallbackInfo {
            reads_state: true,
            writes_state: true,
            emits: false,
        };
        let cb = Callback::new(info, |ctx, args| {
            ctx.write_field("count", args[0].clone())?;
            ctx.read_field("count")
        });
        let state = Value::record([("count", Value::Int(0))]);
        let result = cb
            .call(&state, &Value::Nil, &out_ports(), &[Value::Int(3)])
            .unwrap();
        assert_eq!(result.state, Value::record([("count", Value::Int(3))]));
        assert_eq!(result.value, Value::Int(3));
    }

    #[test]
    fn field_access_fails_with_missing_field() {
        let info = CallbackInfo {
            reads_state: true,
            writes_state: true,
            emits: false,
        };
        let cb = Callback::new(info, |ctx, _args| ctx.read_field("absent"));
        let err = cb
            .call(&Value::record([("x", Value::Int(1))]), &Value::Nil, &out_ports(), &[])
            .unwrap_err();
        assert_eq!(
            err,
            CallbackError::MissingField {
                field: "absent".to_string()
            }
        );

        let cb = Callback::new(info, |ctx, _args| {
            ctx.write_field("x", Value::Nil)?;
            Ok(Value::Nil)
        });
        let err = cb
            .call(&Value::Int(1), &Value::Nil, &out_ports(), &[])
            .unwrap_err();
        assert!(matches!(err, CallbackError::MissingField { .. }));
    }

    #[test]
    fn emit_accumulates_and_overwrites_per_port() {
        let info = CallbackInfo {
            reads_state: false,
            writes_state: false,
            emits: true,
        };
        let cb = Callback::new(info, |ctx, _args| {
            ctx.emit("out", vec![Value::Int(1)])?;
            ctx.emit("other", vec![Value::Int(2), Value::Int(3)])?;
            ctx.emit("out", vec![Value::Int(9)])?;
            Ok(Value::Nil)
        });
        let result = cb.call(&Value::Nil, &Value::Nil, &out_ports(), &[]).unwrap();
        assert_eq!(result.emit.get("out"), Some(&vec![Value::Int(9)]));
        assert_eq!(
            result.emit.get("other"),
            Some(&vec![Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn emit_to_undeclared_port_fails() {
        let info = CallbackInfo {
            reads_state: false,
            writes_state: false,
            emits: true,
        };
        let cb = Callback::new(info, |ctx, _args| {
            ctx.emit("nope", vec![Value::Nil])?;
            Ok(Value::Nil)
        });
        let err = cb.call(&Value::Nil, &Value::Nil, &out_ports(), &[]).unwrap_err();
        assert_eq!(
            err,
            CallbackError::UnknownPort {
                port: "nope".to_string()
            }
        );
    }

    #[test]
    fn trace_records_only_used_primitives() {
        let info = CallbackInfo {
            reads_state: true,
            writes_state: false,
            emits: false,
        };
        let cb = Callback::new(info, |ctx, _args| Ok(ctx.read_state()));
        let (_, trace) = cb
            .call_traced(&Value::Int(1), &Value::Nil, &out_ports(), &[])
            .unwrap();
        assert!(trace.read_state);
        assert!(!trace.wrote_state);
        assert!(!trace.emitted);
        assert!(trace.permitted_by(&info));
        assert!(!CallbackTrace {
            read_state: false,
            wrote_state: true,
            emitted: false,
        }
        .permitted_by(&info));
    }

    #[test]
    fn config_is_visible_to_the_body() {
        let cb = Callback::new(CallbackInfo::pure(), |ctx, _args| Ok(ctx.config().clone()));
        let result = cb
            .call(&Value::Nil, &Value::from("cfg"), &out_ports(), &[])
            .unwrap();
        assert_eq!(result.value, Value::from("cfg"));
    }
}
