//! Workflow deployment.
//!
//! Deploying a workflow flattens it, publishes the link table on every
//! node, drives each operation instance's `deploy` hook in flattened
//! order, publishes the resulting deployment data vector, and returns a
//! manager handle that owns the instance.

use std::sync::Arc;

use tracing::info;

use skitter_core::{flatten, DefinitionError, Invocation, Value, Workflow};

use crate::cluster::messages::StoreKey;
use crate::node::NodeRuntime;
use crate::router;
use crate::store::DeploymentRef;
use crate::strategy::{StrategyContext, StrategyError};

/// Why a deployment failed.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("deploy hook for node `{node}` failed: {source}")]
    Hook {
        node: String,
        #[source]
        source: StrategyError,
    },
}

/// Deploys a workflow on the cluster this runtime belongs to.
///
/// Hooks run sequentially in flattened order, so the hook for node `i`
/// may observe the deployment data of any node `j < i` through the
/// partially populated vector.
///
/// # Errors
///
/// `DeployError::Definition` when flattening or name resolution fails;
/// `DeployError::Hook` when a strategy's `deploy` hook fails, in which
/// case everything created so far is torn down.
pub async fn deploy(
    runtime: &Arc<NodeRuntime>,
    workflow: &Workflow,
) -> Result<Manager, DeployError> {
    let flat = flatten(workflow, &runtime.operations)?;
    let reference = DeploymentRef::fresh();
    let deployment = runtime
        .deployments
        .publish(reference, &flat, &runtime.operations, &runtime.strategies)?;

    // Replicate the link table before any hook can create remote workers:
    // per-connection FIFO guarantees peers see it before the first
    // DEPLOY_REMOTE_CREATE.
    runtime
        .broadcast_registry_put(StoreKey::Links { deployment: reference }, &flat)
        .await;

    for (idx, node) in deployment.nodes.iter().enumerate() {
        let cx = StrategyContext::new(runtime.clone(), reference, idx, Invocation::External);
        match node.strategy.deploy(&cx, &node.args).await {
            Ok(data) => deployment.set_data_slot(idx, data),
            Err(source) => {
                let node = node.name.clone();
                runtime.teardown(reference);
                return Err(DeployError::Hook { node, source });
            }
        }
    }

    runtime
        .broadcast_registry_put(
            StoreKey::Deployment { deployment: reference },
            &deployment.data_vector(),
        )
        .await;

    info!(deployment = %reference, nodes = deployment.nodes.len(), "workflow deployed");
    Ok(Manager {
        runtime: runtime.clone(),
        reference,
    })
}

/// Handle owning a deployed workflow instance.
///
/// Dropping the manager does not stop the workflow; call
/// [`Manager::stop`] to tear it down.
pub struct Manager {
    runtime: Arc<NodeRuntime>,
    reference: DeploymentRef,
}

impl Manager {
    #[must_use]
    pub fn reference(&self) -> DeploymentRef {
        self.reference
    }

    /// Feeds a record into a workflow in port. External records carry the
    /// `External` invocation sentinel. After teardown the record is
    /// silently dropped, like any other send to a stopped workflow.
    ///
    /// # Errors
    ///
    /// `UnknownWorkflowPort` when the workflow declares no such in port.
    pub async fn send(&self, in_port: &str, value: Value) -> Result<(), DefinitionError> {
        self.send_invoked(in_port, value, Invocation::External).await
    }

    /// Feeds a record with an explicit invocation, for callers that
    /// correlate multi-input arrivals themselves.
    ///
    /// # Errors
    ///
    /// Same as [`Manager::send`].
    pub async fn send_invoked(
        &self,
        in_port: &str,
        value: Value,
        invocation: Invocation,
    ) -> Result<(), DefinitionError> {
        let Some(deployment) = self.runtime.deployments.get(self.reference) else {
            // Torn down: behave like a sink.
            return Ok(());
        };
        router::route_external(&self.runtime, &deployment, in_port, value, &invocation).await
    }

    /// Tears the workflow down: stops every deployment-lifetime worker on
    /// every node and unpublishes the constant entries.
    pub fn stop(self) {
        self.runtime.teardown(self.reference);
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("reference", &self.reference)
            .finish()
    }
}
