//! Workers: addressable, single-threaded actors owned by strategies.
//!
//! Each worker is a tokio task draining its own mailbox, so messages are
//! processed one at a time against the worker's state and ordering is
//! FIFO per sender pair. The [`WorkerTable`] is the node-local routing
//! table from worker id to mailbox.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use skitter_core::{Invocation, Value};

use crate::node::NodeRuntime;
use crate::router;
use crate::store::DeploymentRef;
use crate::strategy::{StrategyContext, StrategyError};

/// Node-local worker identifier. Globally routable as part of a
/// [`WorkerRef`].
pub type WorkerId = u64;

/// Routable address of a worker: the hosting node plus its local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRef {
    pub node: String,
    pub id: WorkerId,
}

impl WorkerRef {
    /// Encodes the ref as a record so strategies can keep worker tables
    /// inside their (publishable) deployment data.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::record([
            ("node", Value::from(self.node.clone())),
            ("id", Value::Int(i64::from_ne_bytes(self.id.to_ne_bytes()))),
        ])
    }

    /// Decodes a ref encoded by [`WorkerRef::to_value`].
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let node = value.field("node")?.as_str()?.to_string();
        let id = value.field("id")?.as_int()?;
        Some(Self {
            node,
            id: u64::from_ne_bytes(id.to_ne_bytes()),
        })
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.id)
    }
}

/// How long a worker lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lifetime {
    /// Lives until workflow teardown.
    Deployment,
    /// Cancelled after its single `process` completes.
    Invocation,
}

/// One mailbox entry: a message stamped with its invocation.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Value,
    pub invocation: Invocation,
}

/// Why a send did not reach a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The target worker does not exist or has stopped.
    #[error("worker is stopped")]
    Stopped,
    /// The target worker's node is unreachable.
    #[error("node is down")]
    NodeDown,
}

// ---------------------------------------------------------------------------
// WorkerHandle / WorkerTable
// ---------------------------------------------------------------------------

/// Node-local handle to a live worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub tag: String,
    pub lifetime: Lifetime,
    pub deployment: DeploymentRef,
    pub node_idx: usize,
    tx: mpsc::UnboundedSender<Envelope>,
    abort: AbortHandle,
}

/// All live workers on this node.
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: DashMap<WorkerId, Arc<WorkerHandle>>,
    next_id: AtomicU64,
}

impl WorkerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
            // 0 is reserved as "no worker".
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> WorkerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueues an envelope on a worker's mailbox.
    ///
    /// # Errors
    ///
    /// `Stopped` when the worker does not exist or its mailbox is closed.
    pub fn send(&self, id: WorkerId, envelope: Envelope) -> Result<(), SendError> {
        let handle = self.workers.get(&id).ok_or(SendError::Stopped)?;
        handle.tx.send(envelope).map_err(|_| SendError::Stopped)
    }

    /// Stops a worker, discarding any queued messages.
    pub fn stop(&self, id: WorkerId) {
        if let Some((_, handle)) = self.workers.remove(&id) {
            handle.abort.abort();
        }
    }

    /// Removes a worker entry without aborting its task; used by the
    /// worker loop itself when it exits.
    fn remove_entry(&self, id: WorkerId) {
        self.workers.remove(&id);
    }

    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<Arc<WorkerHandle>> {
        self.workers.get(&id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Spawning and the mailbox loop
// ---------------------------------------------------------------------------

/// Spawns a worker on this node and returns its routable ref.
pub(crate) fn spawn(
    runtime: &Arc<NodeRuntime>,
    deployment: DeploymentRef,
    node_idx: usize,
    state: Value,
    tag: String,
    lifetime: Lifetime,
) -> WorkerRef {
    let id = runtime.workers.allocate_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(worker_loop(
        runtime.clone(),
        deployment,
        node_idx,
        state,
        tag.clone(),
        lifetime,
        id,
        rx,
    ));
    let handle = Arc::new(WorkerHandle {
        id,
        tag,
        lifetime,
        deployment,
        node_idx,
        tx,
        abort: task.abort_handle(),
    });
    runtime.workers.workers.insert(id, handle);
    if let Some(entry) = runtime.deployments.get(deployment) {
        entry.supervisor.register(id);
    }
    WorkerRef {
        node: runtime.config.name.clone(),
        id,
    }
}

/// The worker's single task: dequeue one envelope at a time, run the
/// strategy's `process` hook, apply the result, repeat.
#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    runtime: Arc<NodeRuntime>,
    deployment: DeploymentRef,
    node_idx: usize,
    mut state: Value,
    tag: String,
    lifetime: Lifetime,
    id: WorkerId,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut consecutive_failures: u32 = 0;

    while let Some(envelope) = rx.recv().await {
        let Some(entry) = runtime.deployments.get(deployment) else {
            // Torn down while messages were queued; discard them.
            break;
        };
        let node = &entry.nodes[node_idx];
        let cx = StrategyContext::new(
            runtime.clone(),
            deployment,
            node_idx,
            envelope.invocation.clone(),
        );

        match node
            .strategy
            .process(&cx, envelope.message, &state, &tag)
            .await
        {
            Ok(result) => {
                consecutive_failures = 0;
                if let Err(err) = result.check_collisions() {
                    error!(worker = id, %err, "invalid process result; tearing down workflow");
                    runtime.teardown(deployment);
                    break;
                }
                if let Some(new_state) = result.state {
                    state = new_state;
                }
                if let Err(err) = router::route_process_result(
                    &runtime,
                    &entry,
                    node_idx,
                    result.emit,
                    result.emit_invocation,
                    &envelope.invocation,
                )
                .await
                {
                    error!(worker = id, %err, "emit routing failed; tearing down workflow");
                    runtime.teardown(deployment);
                    break;
                }
            }
            Err(StrategyError::Callback(err)) => {
                // User code failure: drop the message and restart with the
                // operation's initial state.
                consecutive_failures += 1;
                warn!(
                    worker = id,
                    failures = consecutive_failures,
                    %err,
                    "callback failed; worker restarted with initial state"
                );
                state = node.operation.initial_state().clone();
                if consecutive_failures >= runtime.config.cluster.worker_failure_limit {
                    error!(
                        worker = id,
                        deployment = %deployment,
                        "recurring callback failures; tearing down workflow"
                    );
                    runtime.teardown(deployment);
                    break;
                }
            }
            Err(err) => {
                error!(worker = id, %err, "process hook failed; tearing down workflow");
                runtime.teardown(deployment);
                break;
            }
        }

        if lifetime == Lifetime::Invocation {
            debug!(worker = id, "invocation-lifetime worker done");
            break;
        }
    }

    runtime.workers.remove_entry(id);
    if let Some(entry) = runtime.deployments.get(deployment) {
        entry.supervisor.unregister(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ref_value_round_trip() {
        let worker = WorkerRef {
            node: "w1".to_string(),
            id: u64::MAX - 3,
        };
        let encoded = worker.to_value();
        assert_eq!(WorkerRef::from_value(&encoded), Some(worker));
    }

    #[test]
    fn worker_ref_from_malformed_value_is_none() {
        assert_eq!(WorkerRef::from_value(&Value::Nil), None);
        assert_eq!(
            WorkerRef::from_value(&Value::record([("node", Value::from("w1"))])),
            None
        );
    }

    #[test]
    fn table_send_to_unknown_worker_is_stopped() {
        let table = WorkerTable::new();
        let err = table
            .send(
                42,
                Envelope {
                    message: Value::Nil,
                    invocation: Invocation::External,
                },
            )
            .unwrap_err();
        assert_eq!(err, SendError::Stopped);
    }

    #[test]
    fn table_ids_start_at_one() {
        let table = WorkerTable::new();
        assert_eq!(table.allocate_id(), 1);
        assert_eq!(table.allocate_id(), 2);
    }
}
