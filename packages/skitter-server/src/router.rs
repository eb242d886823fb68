//! Record routing.
//!
//! The router translates emissions into `deliver` calls using the link
//! table of the deployment, which is replicated read-only on every node,
//! so no cross-node coordination happens on the hot path. Every element
//! is delivered exactly once per destination; a port with no destinations
//! is a sink and its elements are discarded. Delivery failures caused by
//! a node going down are logged and dropped.

use std::sync::Arc;

use tracing::{debug, warn};

use skitter_core::{DefinitionError, Destination, EmitMap, Invocation, Value};

use crate::node::NodeRuntime;
use crate::store::Deployment;
use crate::strategy::{StrategyContext, StrategyError};
use crate::worker::SendError;

/// Delivers each value to each destination, exactly once per pair.
async fn deliver_all(
    runtime: &Arc<NodeRuntime>,
    deployment: &Arc<Deployment>,
    destinations: &[Destination],
    values: &[Value],
    invocation: &Invocation,
) {
    if destinations.is_empty() {
        // Sink behavior: no destinations, elements are discarded.
        return;
    }
    for value in values {
        for destination in destinations {
            let cx = StrategyContext::new(
                runtime.clone(),
                deployment.reference,
                destination.node,
                invocation.clone(),
            );
            let strategy = deployment.nodes[destination.node].strategy.clone();
            match strategy.deliver(&cx, value.clone(), destination.port).await {
                Ok(()) => {}
                Err(StrategyError::Send(SendError::NodeDown)) => {
                    warn!(
                        deployment = %deployment.reference,
                        node = destination.node,
                        "destination node down; record dropped"
                    );
                }
                Err(err) => {
                    warn!(
                        deployment = %deployment.reference,
                        node = destination.node,
                        %err,
                        "deliver failed; record dropped"
                    );
                }
            }
        }
    }
}

/// Routes one port's emissions from an operation instance.
pub(crate) async fn route_emit(
    runtime: &Arc<NodeRuntime>,
    deployment: &Arc<Deployment>,
    src_idx: usize,
    port_idx: usize,
    values: &[Value],
    invocation: &Invocation,
) {
    let destinations = &deployment.nodes[src_idx].links[port_idx];
    deliver_all(runtime, deployment, destinations, values, invocation).await;
}

/// Applies the emit halves of a `process` result.
///
/// # Errors
///
/// `UnknownEmitPort` when a port name does not belong to the operation;
/// fatal for the deployment.
pub(crate) async fn route_process_result(
    runtime: &Arc<NodeRuntime>,
    deployment: &Arc<Deployment>,
    src_idx: usize,
    emit: EmitMap,
    emit_invocation: Vec<(String, Vec<(Value, Invocation)>)>,
    invocation: &Invocation,
) -> Result<(), StrategyError> {
    let operation = &deployment.nodes[src_idx].operation;

    for (port_name, values) in &emit {
        let port_idx = operation.out_port_index(port_name).ok_or_else(|| {
            StrategyError::UnknownEmitPort {
                port: port_name.clone(),
            }
        })?;
        route_emit(runtime, deployment, src_idx, port_idx, values, invocation).await;
    }

    for (port_name, pairs) in &emit_invocation {
        let port_idx = operation.out_port_index(port_name).ok_or_else(|| {
            StrategyError::UnknownEmitPort {
                port: port_name.clone(),
            }
        })?;
        for (value, own_invocation) in pairs {
            route_emit(
                runtime,
                deployment,
                src_idx,
                port_idx,
                std::slice::from_ref(value),
                own_invocation,
            )
            .await;
        }
    }

    Ok(())
}

/// Routes a record arriving on a workflow in port (external records, or a
/// test harness feeding a deployment).
///
/// # Errors
///
/// `UnknownWorkflowPort` when the deployment's workflow has no such in
/// port.
pub(crate) async fn route_external(
    runtime: &Arc<NodeRuntime>,
    deployment: &Arc<Deployment>,
    in_port: &str,
    value: Value,
    invocation: &Invocation,
) -> Result<(), DefinitionError> {
    let destinations = deployment.in_links.get(in_port).ok_or_else(|| {
        DefinitionError::UnknownWorkflowPort {
            port: in_port.to_string(),
        }
    })?;
    debug!(deployment = %deployment.reference, in_port, "external record");
    deliver_all(
        runtime,
        deployment,
        destinations,
        std::slice::from_ref(&value),
        invocation,
    )
    .await;
    Ok(())
}
