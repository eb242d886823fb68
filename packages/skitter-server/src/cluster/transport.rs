//! Peer transport: one framed TCP connection per peer pair.
//!
//! Each connected peer gets a bounded outbound queue; a single task owns
//! the connection and multiplexes outbound frames with inbound dispatch,
//! which preserves FIFO ordering per peer pair in both directions. The
//! pending-call table correlates `DEPLOY_REMOTE_CREATE` requests with
//! their replies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::codec::{Frame, FrameCodec};
use super::messages::DeployRemoteCreatedPayload;
use super::types::{ClusterConfig, NodeInfo};
use super::membership;
use super::ClusterError;
use crate::node::NodeRuntime;
use crate::worker::SendError;

// ---------------------------------------------------------------------------
// PeerHandle / PeerRegistry
// ---------------------------------------------------------------------------

/// Handle to a connected peer: identity plus the sender end of its
/// bounded outbound queue.
#[derive(Debug)]
pub struct PeerHandle {
    pub info: NodeInfo,
    tx: mpsc::Sender<Frame>,
}

impl PeerHandle {
    /// Queues a frame for the peer's connection task.
    ///
    /// # Errors
    ///
    /// `NodeDown` when the connection task has exited.
    pub async fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.tx.send(frame).await.map_err(|_| SendError::NodeDown)
    }

    /// Non-blocking send, used by broadcasts so one slow peer cannot
    /// stall the rest. Returns whether the frame was queued.
    #[must_use]
    pub fn try_send(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

/// All connected peers, keyed by node name.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<PeerHandle>>,
    pending: DashMap<u64, oneshot::Sender<DeployRemoteCreatedPayload>>,
    next_call_id: AtomicU64,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            pending: DashMap::new(),
            next_call_id: AtomicU64::new(1),
        }
    }

    /// Registers a peer, returning its handle and the receiver the
    /// connection task drains.
    pub fn register(
        &self,
        info: NodeInfo,
        capacity: usize,
    ) -> (Arc<PeerHandle>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(PeerHandle { info: info.clone(), tx });
        self.peers.insert(info.name, handle.clone());
        (handle, rx)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<PeerHandle>> {
        self.peers.remove(name).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PeerHandle>> {
        self.peers.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Sends a frame to a named peer.
    ///
    /// # Errors
    ///
    /// `NodeDown` when the peer is unknown or its connection is gone.
    pub async fn send(&self, name: &str, frame: Frame) -> Result<(), SendError> {
        let handle = self.get(name).ok_or(SendError::NodeDown)?;
        handle.send(frame).await
    }

    /// Best-effort fan-out to every connected peer. Full queues are
    /// skipped.
    pub fn broadcast(&self, frame: &Frame) {
        for entry in &self.peers {
            if !entry.value().try_send(frame.clone()) {
                warn!(peer = %entry.key(), "outbound queue full; broadcast frame dropped");
            }
        }
    }

    /// Removes every peer, closing their outbound queues.
    pub fn drain(&self) {
        let names = self.names();
        for name in names {
            self.peers.remove(&name);
        }
    }

    /// Allocates a call id and the channel its reply will arrive on.
    pub fn register_call(&self) -> (u64, oneshot::Receiver<DeployRemoteCreatedPayload>) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);
        (call_id, rx)
    }

    /// Completes a pending call; returns whether a waiter existed.
    pub fn complete_call(&self, payload: DeployRemoteCreatedPayload) -> bool {
        match self.pending.remove(&payload.call_id) {
            Some((_, tx)) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Abandons a pending call (timeout path).
    pub fn drop_call(&self, call_id: u64) {
        self.pending.remove(&call_id);
    }
}

// ---------------------------------------------------------------------------
// Connection establishment and the per-peer task
// ---------------------------------------------------------------------------

/// Dials a peer and performs the first frame exchange of the handshake.
///
/// # Errors
///
/// `ClusterError` on connect/handshake timeout, I/O failure, or a closed
/// connection before the reply.
pub(crate) async fn connect(
    addr: &str,
    hello: Frame,
    cluster: &ClusterConfig,
) -> Result<(Framed<TcpStream, FrameCodec>, Frame), ClusterError> {
    let deadline = Duration::from_millis(cluster.connect_timeout_ms);
    let stream = timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| ClusterError::Timeout { what: "connect" })??;
    let mut framed = Framed::new(stream, FrameCodec::new(cluster.max_frame_len));
    framed.send(hello).await?;
    let reply = timeout(deadline, framed.next())
        .await
        .map_err(|_| ClusterError::Timeout {
            what: "handshake reply",
        })?
        .ok_or(ClusterError::ClosedDuringHandshake)??;
    Ok((framed, reply))
}

/// Spawns the task owning a verified peer connection: drains the
/// outbound queue and dispatches inbound frames until either side closes.
pub(crate) fn spawn_peer_task(
    runtime: Arc<NodeRuntime>,
    mut framed: Framed<TcpStream, FrameCodec>,
    info: NodeInfo,
    mut rx: mpsc::Receiver<Frame>,
) {
    tokio::spawn(async move {
        let name = info.name.clone();
        loop {
            tokio::select! {
                inbound = framed.next() => match inbound {
                    Some(Ok(frame)) => membership::handle_frame(&runtime, &name, frame).await,
                    Some(Err(err)) => {
                        warn!(peer = %name, %err, "peer read failed");
                        break;
                    }
                    None => {
                        debug!(peer = %name, "peer closed the connection");
                        break;
                    }
                },
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(err) = framed.send(frame).await {
                            warn!(peer = %name, %err, "peer write failed");
                            break;
                        }
                    }
                    // Handle dropped from the registry: close gracefully.
                    None => break,
                },
            }
        }
        membership::peer_lost(&runtime, &name);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::messages::{NodeMessage, PingPayload};
    use crate::cluster::types::NodeMode;

    fn info(name: &str) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            addr: "127.0.0.1:0".to_string(),
            mode: NodeMode::Worker,
            tags: vec![],
            cores: 1,
        }
    }

    fn ping(seq: u64) -> Frame {
        Frame::plain(NodeMessage::Ping(PingPayload { seq }))
    }

    #[tokio::test]
    async fn register_send_and_receive() {
        let registry = PeerRegistry::new();
        let (_handle, mut rx) = registry.register(info("w1"), 8);

        registry.send("w1", ping(1)).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, ping(1));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_node_down() {
        let registry = PeerRegistry::new();
        let err = registry.send("ghost", ping(1)).await.unwrap_err();
        assert_eq!(err, SendError::NodeDown);
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_is_node_down() {
        let registry = PeerRegistry::new();
        let (_handle, rx) = registry.register(info("w1"), 8);
        drop(rx);
        let err = registry.send("w1", ping(1)).await.unwrap_err();
        assert_eq!(err, SendError::NodeDown);
    }

    #[tokio::test]
    async fn broadcast_skips_full_queues() {
        let registry = PeerRegistry::new();
        let (_h1, mut rx1) = registry.register(info("w1"), 1);
        let (_h2, _rx2) = registry.register(info("w2"), 1);

        // Fill w2's queue so the broadcast has to skip it.
        registry.send("w2", ping(0)).await.unwrap();
        registry.broadcast(&ping(1));

        assert_eq!(rx1.recv().await.unwrap(), ping(1));
    }

    #[tokio::test]
    async fn pending_calls_complete_once() {
        let registry = PeerRegistry::new();
        let (call_id, rx) = registry.register_call();

        let payload = DeployRemoteCreatedPayload {
            call_id,
            worker: Some(3),
            error: None,
        };
        assert!(registry.complete_call(payload.clone()));
        assert!(!registry.complete_call(payload.clone()));
        assert_eq!(rx.await.unwrap().worker, Some(3));
    }

    #[tokio::test]
    async fn dropped_call_never_completes() {
        let registry = PeerRegistry::new();
        let (call_id, _rx) = registry.register_call();
        registry.drop_call(call_id);
        assert!(!registry.complete_call(DeployRemoteCreatedPayload {
            call_id,
            worker: None,
            error: None,
        }));
    }

    #[test]
    fn drain_removes_everything() {
        let registry = PeerRegistry::new();
        let (_h1, _rx1) = registry.register(info("w1"), 8);
        let (_h2, _rx2) = registry.register(info("w2"), 8);
        registry.drain();
        assert!(registry.names().is_empty());
    }
}
