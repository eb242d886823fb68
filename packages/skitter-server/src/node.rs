//! Node runtime and lifecycle.
//!
//! [`NodeRuntime`] is the shared hub every component hangs off: the
//! registries, the stores, the worker table, the peer transport, and the
//! membership view. [`Node`] wraps it with the deferred-startup
//! lifecycle: `new()` allocates, `start()` binds, `serve()` joins the
//! cluster and begins accepting.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use skitter_core::{Invocation, InvocationSource, OperationRegistry, Value};

use crate::cluster::codec::Frame;
use crate::cluster::messages::{
    DeployRemoteCreatePayload, NodeMessage, RegistryDelPayload, RegistryPutPayload, StoreKey,
    WorkerMsgBody, WorkerMsgPayload,
};
use crate::cluster::types::{NodeInfo, NodeMode, RemoteState};
use crate::cluster::{membership, ClusterError, DeadlineFailureDetector, FailureDetector};
use crate::config::NodeConfig;
use crate::placement::PlacementService;
use crate::registry::StrategyRegistry;
use crate::shutdown::ShutdownController;
use crate::store::{DeploymentRef, DeploymentStore, MemberStore, TagsStore};
use crate::strategy::StrategyError;
use crate::worker::{self, Lifetime, SendError, WorkerId, WorkerRef, WorkerTable};

// ---------------------------------------------------------------------------
// NodeRuntime
// ---------------------------------------------------------------------------

/// Shared state of one running node.
pub struct NodeRuntime {
    pub config: Arc<NodeConfig>,
    pub operations: Arc<OperationRegistry>,
    pub strategies: Arc<StrategyRegistry>,
    pub deployments: DeploymentStore,
    pub workers: WorkerTable,
    pub peers: crate::cluster::PeerRegistry,
    pub members: MemberStore,
    pub tags: TagsStore,
    pub placement: PlacementService,
    pub invocations: InvocationSource,
    pub detector: Arc<dyn FailureDetector>,
    /// Address peers dial; fixed after `Node::start` binds the listener.
    advertised: ArcSwap<String>,
    /// Name of the current master, on worker nodes.
    master: ArcSwapOption<String>,
    /// Connection state machine per remote, on the master.
    remote_states: DashMap<String, RemoteState>,
}

impl NodeRuntime {
    #[must_use]
    pub fn new(
        config: NodeConfig,
        operations: Arc<OperationRegistry>,
        strategies: Arc<StrategyRegistry>,
    ) -> Arc<Self> {
        let detector = Arc::new(DeadlineFailureDetector::new(config.cluster.ping_deadline_ms));
        let advertised = ArcSwap::from_pointee(config.addr.clone());
        let invocations = InvocationSource::new(config.name.clone());
        Arc::new(Self {
            config: Arc::new(config),
            operations,
            strategies,
            deployments: DeploymentStore::new(),
            workers: WorkerTable::new(),
            peers: crate::cluster::PeerRegistry::new(),
            members: MemberStore::new(),
            tags: TagsStore::new(),
            placement: PlacementService::new(),
            invocations,
            detector,
            advertised,
            master: ArcSwapOption::empty(),
            remote_states: DashMap::new(),
        })
    }

    /// This node's identity as exchanged in handshakes and up events.
    #[must_use]
    pub fn local_info(&self) -> NodeInfo {
        NodeInfo {
            name: self.config.name.clone(),
            addr: (**self.advertised.load()).clone(),
            mode: self.config.mode,
            tags: self.config.tags.clone(),
            cores: self.config.cores,
        }
    }

    pub(crate) fn set_advertised_addr(&self, addr: String) {
        self.advertised.store(Arc::new(addr));
    }

    #[must_use]
    pub fn master_name(&self) -> Option<String> {
        self.master.load_full().map(|name| (*name).clone())
    }

    pub(crate) fn set_master(&self, name: Option<String>) {
        self.master.store(name.map(Arc::new));
    }

    pub(crate) fn take_master(&self) -> Option<String> {
        self.master.swap(None).map(|name| (*name).clone())
    }

    /// Connection state of a remote; `Disconnected` when never seen.
    #[must_use]
    pub fn remote_state(&self, name: &str) -> RemoteState {
        self.remote_states
            .get(name)
            .map_or(RemoteState::Disconnected, |entry| *entry.value())
    }

    pub(crate) fn set_remote_state(&self, name: &str, state: RemoteState) {
        self.remote_states.insert(name.to_string(), state);
    }

    // -- Record plane -------------------------------------------------------

    /// Routes a message to a worker, local or remote. Fire-and-forget;
    /// ordering is FIFO per sender pair.
    ///
    /// # Errors
    ///
    /// `Stopped` for dead local workers, `NodeDown` when the hosting node
    /// is unreachable.
    pub async fn send_to_worker(
        &self,
        target: &WorkerRef,
        message: Value,
        invocation: Invocation,
    ) -> Result<(), SendError> {
        if target.node == self.config.name {
            self.workers.send(
                target.id,
                crate::worker::Envelope {
                    message,
                    invocation,
                },
            )
        } else {
            self.peers
                .send(
                    &target.node,
                    Frame::invoked(
                        invocation,
                        NodeMessage::WorkerMsg(WorkerMsgPayload {
                            target: target.id,
                            body: WorkerMsgBody::Record { value: message },
                        }),
                    ),
                )
                .await
        }
    }

    /// Stops a worker, local or remote.
    ///
    /// # Errors
    ///
    /// `NodeDown` when a remote target's node is unreachable.
    pub async fn stop_worker(&self, target: &WorkerRef) -> Result<(), SendError> {
        if target.node == self.config.name {
            self.workers.stop(target.id);
            Ok(())
        } else {
            self.peers
                .send(
                    &target.node,
                    Frame::plain(NodeMessage::WorkerMsg(WorkerMsgPayload {
                        target: target.id,
                        body: WorkerMsgBody::Stop,
                    })),
                )
                .await
        }
    }

    // -- Deployment plane ---------------------------------------------------

    /// Creates a worker on a remote node through the
    /// `DEPLOY_REMOTE_CREATE` round trip.
    ///
    /// # Errors
    ///
    /// `Send(NodeDown)` when the node is unreachable, `RemoteCreate` when
    /// it refuses or the reply times out.
    pub(crate) async fn remote_create(
        self: &Arc<Self>,
        node: &str,
        deployment: DeploymentRef,
        node_idx: usize,
        state: Value,
        tag: String,
        lifetime: Lifetime,
    ) -> Result<WorkerRef, StrategyError> {
        let (call_id, reply) = self.peers.register_call();
        let payload = DeployRemoteCreatePayload {
            call_id,
            deployment,
            node_idx,
            state,
            tag,
            lifetime,
        };
        if let Err(err) = self
            .peers
            .send(node, Frame::plain(NodeMessage::DeployRemoteCreate(payload)))
            .await
        {
            self.peers.drop_call(call_id);
            return Err(StrategyError::Send(err));
        }

        let deadline = Duration::from_millis(self.config.cluster.rpc_timeout_ms);
        match timeout(deadline, reply).await {
            Ok(Ok(created)) => match created.worker {
                Some(id) => Ok(WorkerRef {
                    node: node.to_string(),
                    id,
                }),
                None => Err(StrategyError::RemoteCreate {
                    reason: created.error.unwrap_or_else(|| "unknown".to_string()),
                }),
            },
            Ok(Err(_)) => {
                self.peers.drop_call(call_id);
                Err(StrategyError::RemoteCreate {
                    reason: "connection lost".to_string(),
                })
            }
            Err(_) => {
                self.peers.drop_call(call_id);
                Err(StrategyError::RemoteCreate {
                    reason: "timed out".to_string(),
                })
            }
        }
    }

    /// Serves a peer's `DEPLOY_REMOTE_CREATE` request.
    pub(crate) fn create_for_peer(
        self: &Arc<Self>,
        payload: &DeployRemoteCreatePayload,
    ) -> Result<WorkerId, String> {
        let Some(deployment) = self.deployments.get(payload.deployment) else {
            return Err(format!("unknown deployment {}", payload.deployment));
        };
        if payload.node_idx >= deployment.nodes.len() {
            return Err(format!(
                "node index {} out of range for {}",
                payload.node_idx, payload.deployment
            ));
        }
        let created = worker::spawn(
            self,
            payload.deployment,
            payload.node_idx,
            payload.state.clone(),
            payload.tag.clone(),
            payload.lifetime,
        );
        Ok(created.id)
    }

    /// Replicates a constant-store entry to every connected peer, in
    /// connection order (FIFO per peer).
    pub(crate) async fn broadcast_registry_put<T: serde::Serialize>(
        &self,
        key: StoreKey,
        value: &T,
    ) {
        let Ok(bytes) = rmp_serde::to_vec_named(value) else {
            warn!("unencodable constant-store entry");
            return;
        };
        for name in self.peers.names() {
            let frame = Frame::plain(NodeMessage::RegistryPut(RegistryPutPayload {
                key,
                value: bytes.clone(),
            }));
            if self.peers.send(&name, frame).await.is_err() {
                warn!(peer = %name, "constant-store replication skipped a dead peer");
            }
        }
    }

    /// Tears a deployment down on this node only: stops its workers and
    /// unpublishes its constants.
    pub(crate) fn teardown_local(&self, reference: DeploymentRef) {
        if let Some(deployment) = self.deployments.remove(reference) {
            let workers = deployment.supervisor.workers();
            info!(deployment = %reference, workers = workers.len(), "tearing down deployment");
            for id in workers {
                self.workers.stop(id);
            }
        }
    }

    /// Tears a deployment down cluster-wide.
    pub fn teardown(&self, reference: DeploymentRef) {
        self.teardown_local(reference);
        self.peers
            .broadcast(&Frame::plain(NodeMessage::RegistryDel(RegistryDelPayload {
                key: StoreKey::Links {
                    deployment: reference,
                },
            })));
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("node", &self.config.name)
            .field("mode", &self.config.mode)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One Skitter node with its lifecycle.
///
/// Deferred startup: `new()` allocates shared state, `start()` binds the
/// listener (worker mode), `serve()` joins the cluster and starts the
/// background tasks.
pub struct Node {
    runtime: Arc<NodeRuntime>,
    shutdown: Arc<ShutdownController>,
    listener: Option<TcpListener>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    #[must_use]
    pub fn new(
        config: NodeConfig,
        operations: Arc<OperationRegistry>,
        strategies: Arc<StrategyRegistry>,
    ) -> Self {
        Self {
            runtime: NodeRuntime::new(config, operations, strategies),
            shutdown: Arc::new(ShutdownController::new()),
            listener: None,
            tasks: Vec::new(),
        }
    }

    /// A served local-mode node, ready for deployments. Test and
    /// single-process entry point.
    ///
    /// # Errors
    ///
    /// Never fails in practice: local mode neither binds nor joins.
    pub async fn local(
        name: &str,
        operations: Arc<OperationRegistry>,
        strategies: Arc<StrategyRegistry>,
    ) -> Result<Self, ClusterError> {
        let mut node = Self::new(NodeConfig::local(name), operations, strategies);
        node.start().await?;
        node.serve().await?;
        Ok(node)
    }

    #[must_use]
    pub fn runtime(&self) -> Arc<NodeRuntime> {
        self.runtime.clone()
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        self.shutdown.clone()
    }

    /// Binds the listener in worker mode. Returns the bound port (0 in
    /// master and local modes, which do not listen).
    ///
    /// # Errors
    ///
    /// I/O failure binding the configured address.
    pub async fn start(&mut self) -> Result<u16, ClusterError> {
        if self.runtime.config.mode != NodeMode::Worker {
            return Ok(0);
        }
        let listener = TcpListener::bind(&self.runtime.config.addr).await?;
        let port = listener.local_addr()?.port();

        // With an ephemeral port the advertised address must follow the
        // actual binding.
        let host = self
            .runtime
            .config
            .addr
            .rsplit_once(':')
            .map_or("127.0.0.1", |(host, _)| host);
        self.runtime
            .set_advertised_addr(format!("{host}:{port}"));

        info!(node = %self.runtime.config.name, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Joins the cluster and starts the node's background tasks.
    ///
    /// # Errors
    ///
    /// In master mode, a failed worker connection aborts the join (exit
    /// code 65 in the binary).
    pub async fn serve(&mut self) -> Result<(), ClusterError> {
        match self.runtime.config.mode {
            NodeMode::Local => {
                self.runtime.members.add(self.runtime.local_info());
                self.runtime
                    .tags
                    .put(self.runtime.config.name.clone(), self.runtime.config.tags.clone());
            }
            NodeMode::Worker => {
                self.runtime.members.add(self.runtime.local_info());
                self.runtime
                    .tags
                    .put(self.runtime.config.name.clone(), self.runtime.config.tags.clone());
                self.spawn_accept_loop()?;
                self.tasks.push(membership::spawn_worker_monitor(
                    self.runtime.clone(),
                    self.shutdown.receiver(),
                ));
            }
            NodeMode::Master => {
                membership::join_cluster(&self.runtime).await?;
                self.tasks.push(membership::spawn_master_monitor(
                    self.runtime.clone(),
                    self.shutdown.receiver(),
                ));
            }
        }
        self.shutdown.set_ready();
        info!(node = %self.runtime.config.name, mode = %self.runtime.config.mode, "node serving");
        Ok(())
    }

    fn spawn_accept_loop(&mut self) -> Result<(), ClusterError> {
        let listener = self.listener.take().ok_or(ClusterError::NotStarted)?;
        let runtime = self.runtime.clone();
        let mut shutdown = self.shutdown.receiver();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(membership::handle_inbound(runtime.clone(), stream));
                        }
                        Err(err) => {
                            warn!(%err, "accept failed");
                        }
                    },
                }
            }
        }));
        Ok(())
    }

    /// Blocks until shutdown is triggered.
    pub async fn wait(&self) {
        self.shutdown.wait().await;
    }

    /// Stops the node: tears down local deployments (cluster-wide when
    /// this node deployed them), disconnects every peer, and stops the
    /// background tasks.
    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        for reference in self.runtime.deployments.references() {
            self.runtime.teardown(reference);
        }
        self.runtime.peers.drain();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Give peer tasks a beat to flush their close.
        tokio::task::yield_now().await;
        self.shutdown.set_stopped();
        info!(node = %self.runtime.config.name, "node stopped");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node", &self.runtime.config.name)
            .field("mode", &self.runtime.config.mode)
            .field("health", &self.shutdown.health())
            .finish()
    }
}
