//! Cluster membership.
//!
//! The master dials every configured worker, verifies it during the
//! handshake (worker role, matching cookie), records it in the Registry
//! and Tags stores, and fans out up/down events so each worker node knows
//! every other worker. Workers track their master; losing it clears the
//! cluster view down to the node itself.
//!
//! Per remote, on the master:
//!
//! ```text
//! disconnected --connect--> verifying --ok--> connected --loss--> disconnected
//!                               |
//!                               +--mode-mismatch/rejected--> disconnected
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use skitter_core::{FlattenedWorkflow, Invocation, Value};

use super::codec::{Frame, FrameCodec};
use super::failure_detector::now_ms;
use super::messages::{
    DeployRemoteCreatedPayload, HelloPayload, NodeMessage, PongPayload, RegistryPutPayload,
    RejectPayload, StoreKey, SubscribeDownPayload, SubscribeUpPayload, TagsPutPayload,
    WelcomePayload, WorkerMsgBody,
};
use super::types::{DownReason, NodeInfo, NodeMode, RemoteState};
use super::{transport, ClusterError};
use crate::config::parse_nodename;
use crate::node::NodeRuntime;
use crate::worker::Envelope;

// ---------------------------------------------------------------------------
// Master side: connect and verify workers
// ---------------------------------------------------------------------------

/// Connects the master to every worker named in its configuration.
///
/// # Errors
///
/// The first connection or verification failure aborts the join.
pub(crate) async fn join_cluster(runtime: &Arc<NodeRuntime>) -> Result<(), ClusterError> {
    for nodename in &runtime.config.workers {
        let (name, addr) = parse_nodename(nodename)
            .map_err(|_| ClusterError::BadNodename {
                value: nodename.clone(),
            })?;
        connect_worker(runtime, &name, &addr).await?;
    }
    Ok(())
}

/// Dials one worker and runs the verify step of the state machine.
///
/// # Errors
///
/// `ModeMismatch` when the peer is not a worker, `CookieMismatch` or
/// `Rejected` on failed verification, and transport errors.
pub(crate) async fn connect_worker(
    runtime: &Arc<NodeRuntime>,
    name: &str,
    addr: &str,
) -> Result<(), ClusterError> {
    runtime.set_remote_state(name, RemoteState::Verifying);
    debug!(node = name, addr, "connecting to worker");

    let hello = Frame::plain(NodeMessage::Hello(HelloPayload {
        node: runtime.local_info(),
        cookie: runtime.config.cookie.clone(),
    }));
    let (framed, reply) = match transport::connect(addr, hello, &runtime.config.cluster).await {
        Ok(ok) => ok,
        Err(err) => {
            runtime.set_remote_state(name, RemoteState::Disconnected);
            return Err(err);
        }
    };

    match reply.message {
        NodeMessage::Welcome(welcome) => {
            if welcome.cookie != runtime.config.cookie {
                runtime.set_remote_state(name, RemoteState::Disconnected);
                return Err(ClusterError::CookieMismatch {
                    node: welcome.node.name,
                });
            }
            if welcome.node.mode != NodeMode::Worker {
                runtime.set_remote_state(name, RemoteState::Disconnected);
                return Err(ClusterError::ModeMismatch {
                    node: welcome.node.name,
                });
            }
            register_worker(runtime, welcome.node, framed).await;
            Ok(())
        }
        NodeMessage::Reject(reject) => {
            runtime.set_remote_state(name, RemoteState::Disconnected);
            Err(ClusterError::Rejected {
                node: name.to_string(),
                reason: reject.reason,
            })
        }
        _ => {
            runtime.set_remote_state(name, RemoteState::Disconnected);
            Err(ClusterError::UnexpectedHandshake)
        }
    }
}

/// Verification succeeded: record the worker in the Registry and Tags
/// stores, exchange up events with the rest of the cluster, replicate
/// live deployments, and hand the connection to its task.
async fn register_worker(
    runtime: &Arc<NodeRuntime>,
    info: NodeInfo,
    framed: Framed<TcpStream, FrameCodec>,
) {
    let capacity = runtime.config.cluster.outbound_channel_capacity;
    let (handle, rx) = runtime.peers.register(info.clone(), capacity);

    // The newcomer learns about existing workers, existing workers learn
    // about the newcomer.
    let view = runtime.members.snapshot();
    for existing in &view.members {
        let _ = handle
            .send(Frame::plain(NodeMessage::SubscribeUp(SubscribeUpPayload {
                node: existing.clone(),
            })))
            .await;
        let _ = runtime
            .peers
            .send(
                &existing.name,
                Frame::plain(NodeMessage::SubscribeUp(SubscribeUpPayload {
                    node: info.clone(),
                })),
            )
            .await;
        let _ = runtime
            .peers
            .send(
                &existing.name,
                Frame::plain(NodeMessage::TagsPut(TagsPutPayload {
                    node: info.name.clone(),
                    tags: info.tags.clone(),
                })),
            )
            .await;
    }

    // Late joiners receive the constant stores of live deployments.
    for reference in runtime.deployments.references() {
        if let Some(deployment) = runtime.deployments.get(reference) {
            if let Ok(links) = rmp_serde::to_vec_named(&deployment.flat) {
                let _ = handle
                    .send(Frame::plain(NodeMessage::RegistryPut(RegistryPutPayload {
                        key: StoreKey::Links { deployment: reference },
                        value: links,
                    })))
                    .await;
            }
            if let Ok(data) = rmp_serde::to_vec_named(&deployment.data_vector()) {
                let _ = handle
                    .send(Frame::plain(NodeMessage::RegistryPut(RegistryPutPayload {
                        key: StoreKey::Deployment { deployment: reference },
                        value: data,
                    })))
                    .await;
            }
        }
    }

    runtime.members.add(info.clone());
    runtime.tags.put(info.name.clone(), info.tags.clone());
    runtime.detector.heartbeat(&info.name, now_ms());
    runtime.set_remote_state(&info.name, RemoteState::Connected);
    info!(node = %info.name, cores = info.cores, "worker connected");

    transport::spawn_peer_task(runtime.clone(), framed, info, rx);
}

// ---------------------------------------------------------------------------
// Inbound handshake (worker side, and worker-to-worker mesh)
// ---------------------------------------------------------------------------

/// Handles one inbound connection from its first frame.
pub(crate) async fn handle_inbound(runtime: Arc<NodeRuntime>, stream: TcpStream) {
    let mut framed = Framed::new(
        stream,
        FrameCodec::new(runtime.config.cluster.max_frame_len),
    );
    let deadline = Duration::from_millis(runtime.config.cluster.connect_timeout_ms);

    let first = match timeout(deadline, framed.next()).await {
        Ok(Some(Ok(frame))) => frame,
        _ => {
            debug!("inbound connection closed before handshake");
            return;
        }
    };
    let NodeMessage::Hello(hello) = first.message else {
        debug!("inbound connection did not start with HELLO");
        return;
    };

    if hello.cookie != runtime.config.cookie {
        warn!(node = %hello.node.name, "rejecting peer: cookie mismatch");
        let _ = framed
            .send(Frame::plain(NodeMessage::Reject(RejectPayload {
                reason: "cookie mismatch".to_string(),
            })))
            .await;
        return;
    }

    let welcome = Frame::plain(NodeMessage::Welcome(WelcomePayload {
        node: runtime.local_info(),
        cookie: runtime.config.cookie.clone(),
    }));

    match hello.node.mode {
        NodeMode::Master => {
            if framed.send(welcome).await.is_err() {
                return;
            }
            master_up(&runtime, hello.node, framed);
        }
        NodeMode::Worker => {
            if framed.send(welcome).await.is_err() {
                return;
            }
            let capacity = runtime.config.cluster.outbound_channel_capacity;
            let (_handle, rx) = runtime.peers.register(hello.node.clone(), capacity);
            debug!(peer = %hello.node.name, "worker peer connected");
            transport::spawn_peer_task(runtime.clone(), framed, hello.node, rx);
        }
        NodeMode::Local => {
            let _ = framed
                .send(Frame::plain(NodeMessage::Reject(RejectPayload {
                    reason: "local nodes cannot join a cluster".to_string(),
                })))
                .await;
        }
    }
}

/// The master connected to this worker.
fn master_up(runtime: &Arc<NodeRuntime>, info: NodeInfo, framed: Framed<TcpStream, FrameCodec>) {
    info!(master = %info.name, "master up");
    runtime.set_master(Some(info.name.clone()));
    runtime.detector.heartbeat(&info.name, now_ms());
    let capacity = runtime.config.cluster.outbound_channel_capacity;
    let (_handle, rx) = runtime.peers.register(info.clone(), capacity);
    transport::spawn_peer_task(runtime.clone(), framed, info, rx);
}

/// Dials a fellow worker after a node-up event. The lexicographically
/// smaller name dials, giving exactly one connection per pair.
async fn dial_worker_peer(runtime: Arc<NodeRuntime>, info: NodeInfo) {
    if runtime.peers.contains(&info.name) {
        return;
    }
    let hello = Frame::plain(NodeMessage::Hello(HelloPayload {
        node: runtime.local_info(),
        cookie: runtime.config.cookie.clone(),
    }));
    match transport::connect(&info.addr, hello, &runtime.config.cluster).await {
        Ok((framed, reply)) => match reply.message {
            NodeMessage::Welcome(welcome) if welcome.cookie == runtime.config.cookie => {
                let capacity = runtime.config.cluster.outbound_channel_capacity;
                let (_handle, rx) = runtime.peers.register(info.clone(), capacity);
                debug!(peer = %info.name, "worker peer dialed");
                transport::spawn_peer_task(runtime, framed, info, rx);
            }
            NodeMessage::Welcome(_) => {
                warn!(peer = %info.name, "worker peer cookie mismatch");
            }
            NodeMessage::Reject(reject) => {
                warn!(peer = %info.name, reason = %reject.reason, "worker peer rejected us");
            }
            _ => warn!(peer = %info.name, "unexpected handshake reply from worker peer"),
        },
        Err(err) => {
            // Sends toward this peer fail with NodeDown until the master
            // re-announces it.
            warn!(peer = %info.name, %err, "failed to dial worker peer");
        }
    }
}

// ---------------------------------------------------------------------------
// Steady-state frame dispatch
// ---------------------------------------------------------------------------

/// Dispatches one frame from an established peer connection.
pub(crate) async fn handle_frame(runtime: &Arc<NodeRuntime>, from: &str, frame: Frame) {
    match frame.message {
        NodeMessage::WorkerMsg(payload) => {
            let invocation = frame.invocation.unwrap_or(Invocation::External);
            match payload.body {
                WorkerMsgBody::Record { value } => {
                    let envelope = Envelope {
                        message: value,
                        invocation,
                    };
                    if runtime.workers.send(payload.target, envelope).is_err() {
                        debug!(worker = payload.target, "message for stopped worker dropped");
                    }
                }
                WorkerMsgBody::Stop => runtime.workers.stop(payload.target),
            }
        }
        NodeMessage::DeployRemoteCreate(payload) => {
            let call_id = payload.call_id;
            let reply = match runtime.create_for_peer(&payload) {
                Ok(worker) => DeployRemoteCreatedPayload {
                    call_id,
                    worker: Some(worker),
                    error: None,
                },
                Err(reason) => DeployRemoteCreatedPayload {
                    call_id,
                    worker: None,
                    error: Some(reason),
                },
            };
            let _ = runtime
                .peers
                .send(from, Frame::plain(NodeMessage::DeployRemoteCreated(reply)))
                .await;
        }
        NodeMessage::DeployRemoteCreated(payload) => {
            if !runtime.peers.complete_call(payload) {
                debug!("late DEPLOY_REMOTE_CREATE reply dropped");
            }
        }
        NodeMessage::RegistryPut(payload) => apply_registry_put(runtime, payload),
        NodeMessage::RegistryDel(payload) => match payload.key {
            StoreKey::Links { deployment } => runtime.teardown_local(deployment),
            StoreKey::Deployment { .. } => {}
        },
        NodeMessage::TagsPut(payload) => runtime.tags.put(payload.node, payload.tags),
        NodeMessage::TagsDel(payload) => runtime.tags.remove(&payload.node),
        NodeMessage::SubscribeUp(payload) => {
            if payload.node.name != runtime.config.name {
                runtime.tags.put(payload.node.name.clone(), payload.node.tags.clone());
                runtime.members.add(payload.node.clone());
                if runtime.config.name < payload.node.name {
                    tokio::spawn(dial_worker_peer(runtime.clone(), payload.node));
                }
            }
        }
        NodeMessage::SubscribeDown(payload) => {
            info!(node = %payload.node, reason = %payload.reason, "node down event");
            runtime.members.remove(&payload.node);
            runtime.tags.remove(&payload.node);
            runtime.peers.remove(&payload.node);
        }
        NodeMessage::Ping(payload) => {
            runtime.detector.heartbeat(from, now_ms());
            let _ = runtime
                .peers
                .send(
                    from,
                    Frame::plain(NodeMessage::Pong(PongPayload { seq: payload.seq })),
                )
                .await;
        }
        NodeMessage::Pong(_) => runtime.detector.heartbeat(from, now_ms()),
        NodeMessage::Hello(_) | NodeMessage::Welcome(_) | NodeMessage::Reject(_) => {
            warn!(peer = from, "unexpected handshake frame on established connection");
        }
    }
}

/// Applies a replicated constant-store entry.
fn apply_registry_put(runtime: &Arc<NodeRuntime>, payload: RegistryPutPayload) {
    match payload.key {
        StoreKey::Links { deployment } => {
            match rmp_serde::from_slice::<FlattenedWorkflow>(&payload.value) {
                Ok(flat) => {
                    if let Err(err) = runtime.deployments.publish(
                        deployment,
                        &flat,
                        &runtime.operations,
                        &runtime.strategies,
                    ) {
                        error!(%deployment, %err, "cannot resolve replicated workflow");
                    }
                }
                Err(err) => error!(%deployment, %err, "malformed links entry"),
            }
        }
        StoreKey::Deployment { deployment } => {
            match rmp_serde::from_slice::<Vec<Option<Value>>>(&payload.value) {
                Ok(data) => match runtime.deployments.get(deployment) {
                    Some(entry) => entry.set_data(data),
                    None => warn!(%deployment, "deployment data without a links entry"),
                },
                Err(err) => error!(%deployment, %err, "malformed deployment entry"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loss handling
// ---------------------------------------------------------------------------

/// A peer connection terminated.
pub(crate) fn peer_lost(runtime: &Arc<NodeRuntime>, name: &str) {
    runtime.peers.remove(name);
    match runtime.config.mode {
        NodeMode::Master => node_down(runtime, name, DownReason::ConnectionLost),
        NodeMode::Worker => {
            if runtime.master_name().as_deref() == Some(name) {
                master_down(runtime);
            }
        }
        NodeMode::Local => {}
    }
}

/// Master-side down transition: remove the node from both stores and
/// notify the surviving workers. Further sends toward the node's workers
/// fail with `NodeDown`.
pub(crate) fn node_down(runtime: &Arc<NodeRuntime>, name: &str, reason: DownReason) {
    if !runtime.members.remove(name) {
        return;
    }
    runtime.set_remote_state(name, RemoteState::Disconnected);
    runtime.tags.remove(name);
    runtime.detector.forget(name);
    runtime.peers.remove(name);
    warn!(node = name, %reason, "worker node down");
    runtime
        .peers
        .broadcast(&Frame::plain(NodeMessage::SubscribeDown(
            SubscribeDownPayload {
                node: name.to_string(),
                reason,
            },
        )));
}

/// Worker-side master loss: clear the cluster view down to this node.
/// The master owned every workflow, so local deployments die with it;
/// the node self-heals when a master reconnects.
pub(crate) fn master_down(runtime: &Arc<NodeRuntime>) {
    let Some(master) = runtime.take_master() else {
        return;
    };
    warn!(%master, "master down; clearing cluster view");
    runtime.detector.forget(&master);
    runtime.peers.drain();
    runtime.members.clear_except(&runtime.config.name);
    for (node, _) in runtime.tags.snapshot() {
        if node != runtime.config.name {
            runtime.tags.remove(&node);
        }
    }
    for reference in runtime.deployments.references() {
        runtime.teardown_local(reference);
    }
}

// ---------------------------------------------------------------------------
// Monitors
// ---------------------------------------------------------------------------

/// Master liveness loop: ping every connected worker and declare
/// suspects down.
pub(crate) fn spawn_master_monitor(
    runtime: Arc<NodeRuntime>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(
            runtime.config.cluster.ping_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            seq += 1;
            for name in runtime.peers.names() {
                let _ = runtime
                    .peers
                    .send(
                        &name,
                        Frame::plain(NodeMessage::Ping(super::messages::PingPayload { seq })),
                    )
                    .await;
            }
            for suspect in runtime.detector.suspects(now_ms()) {
                node_down(&runtime, &suspect, DownReason::ConnectionLost);
            }
        }
    })
}

/// Worker liveness loop: watch the master's pings.
pub(crate) fn spawn_worker_monitor(
    runtime: Arc<NodeRuntime>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(
            runtime.config.cluster.ping_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Some(master) = runtime.master_name() {
                if !runtime.detector.is_alive(&master, now_ms()) {
                    master_down(&runtime);
                }
            }
        }
    })
}
