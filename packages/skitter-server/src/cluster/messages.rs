//! Inter-node wire messages.
//!
//! Nodes exchange [`NodeMessage`] values over framed TCP connections. The
//! enum is internally tagged on `"type"` with `SCREAMING_SNAKE_CASE`
//! names, so the tag on the wire is the message kind. Payloads use
//! MsgPack via `rmp_serde::to_vec_named()`, which is deterministic.
//!
//! The handshake (`HELLO`/`WELCOME`/`REJECT`) runs once per connection
//! before any steady-state traffic.

use serde::{Deserialize, Serialize};
use skitter_core::Value;

use crate::cluster::types::{DownReason, NodeInfo};
use crate::store::DeploymentRef;
use crate::worker::{Lifetime, WorkerId};

// ---------------------------------------------------------------------------
// NodeMessage enum
// ---------------------------------------------------------------------------

/// Top-level inter-node protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMessage {
    // -- Handshake (3) -----------------------------------------------------
    Hello(HelloPayload),
    Welcome(WelcomePayload),
    Reject(RejectPayload),

    // -- Record plane (1) --------------------------------------------------
    WorkerMsg(WorkerMsgPayload),

    // -- Deployment (2) ----------------------------------------------------
    DeployRemoteCreate(DeployRemoteCreatePayload),
    DeployRemoteCreated(DeployRemoteCreatedPayload),

    // -- Replicated stores (4) ---------------------------------------------
    RegistryPut(RegistryPutPayload),
    RegistryDel(RegistryDelPayload),
    TagsPut(TagsPutPayload),
    TagsDel(TagsDelPayload),

    // -- Membership events (2) ---------------------------------------------
    SubscribeUp(SubscribeUpPayload),
    SubscribeDown(SubscribeDownPayload),

    // -- Liveness (2) ------------------------------------------------------
    Ping(PingPayload),
    Pong(PongPayload),
}

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// First frame on a fresh connection: the dialer introduces itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub node: NodeInfo,
    pub cookie: String,
}

/// Accepting side of the handshake: identity plus cookie for mutual
/// verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub node: NodeInfo,
    pub cookie: String,
}

/// Handshake refusal; the connection closes after this frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectPayload {
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Record plane
// ---------------------------------------------------------------------------

/// What a `WORKER_MSG` frame asks the target worker to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerMsgBody {
    /// Deliver a record to the worker's mailbox.
    Record { value: Value },
    /// Stop the worker, discarding queued messages.
    Stop,
}

/// A message for a worker hosted on the receiving node. The frame's
/// invocation slot carries the record's invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMsgPayload {
    pub target: WorkerId,
    pub body: WorkerMsgBody,
}

// ---------------------------------------------------------------------------
// Deployment payloads
// ---------------------------------------------------------------------------

/// Request to create a worker on the receiving node for one operation
/// instance of a deployment. `call_id` correlates the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRemoteCreatePayload {
    pub call_id: u64,
    pub deployment: DeploymentRef,
    pub node_idx: usize,
    pub state: Value,
    pub tag: String,
    pub lifetime: Lifetime,
}

/// Reply to [`DeployRemoteCreatePayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRemoteCreatedPayload {
    pub call_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub worker: Option<WorkerId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Replicated store payloads
// ---------------------------------------------------------------------------

/// Namespaced key of a replicated deployment constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "store", rename_all = "camelCase")]
pub enum StoreKey {
    /// The flattened link table of a deployment.
    Links { deployment: DeploymentRef },
    /// The per-node deployment data vector of a deployment.
    Deployment { deployment: DeploymentRef },
}

/// Replicates one constant-store entry. `value` is the MsgPack encoding
/// of the entry; the key determines the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPutPayload {
    pub key: StoreKey,
    pub value: Vec<u8>,
}

/// Removes a constant-store entry. Deleting a links entry tears down the
/// deployment's local workers on the receiving node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDelPayload {
    pub key: StoreKey,
}

/// Replicates the tag set advertised by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsPutPayload {
    pub node: String,
    pub tags: Vec<String>,
}

/// Drops a node's tag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsDelPayload {
    pub node: String,
}

// ---------------------------------------------------------------------------
// Membership event payloads
// ---------------------------------------------------------------------------

/// A worker node joined; subscribed nodes add it to their view and, when
/// their name sorts lower, dial it to complete the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeUpPayload {
    pub node: NodeInfo,
}

/// A worker node left or was declared down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDownPayload {
    pub node: String,
    pub reason: DownReason,
}

// ---------------------------------------------------------------------------
// Liveness payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::NodeMode;

    /// Serialize as named MsgPack and back, asserting equality.
    fn round_trip(msg: &NodeMessage) {
        let bytes = rmp_serde::to_vec_named(msg).expect("serialize failed");
        let decoded: NodeMessage = rmp_serde::from_slice(&bytes).expect("deserialize failed");
        assert_eq!(msg, &decoded);
    }

    fn sample_node() -> NodeInfo {
        NodeInfo {
            name: "w1".to_string(),
            addr: "10.0.0.2:9090".to_string(),
            mode: NodeMode::Worker,
            tags: vec!["gpu".to_string()],
            cores: 4,
        }
    }

    #[test]
    fn serde_hello_and_welcome() {
        round_trip(&NodeMessage::Hello(HelloPayload {
            node: sample_node(),
            cookie: "secret".to_string(),
        }));
        round_trip(&NodeMessage::Welcome(WelcomePayload {
            node: sample_node(),
            cookie: "secret".to_string(),
        }));
        round_trip(&NodeMessage::Reject(RejectPayload {
            reason: "bad cookie".to_string(),
        }));
    }

    #[test]
    fn serde_worker_msg_record_and_stop() {
        round_trip(&NodeMessage::WorkerMsg(WorkerMsgPayload {
            target: 17,
            body: WorkerMsgBody::Record {
                value: Value::record([("port", Value::Int(0)), ("value", Value::Int(42))]),
            },
        }));
        round_trip(&NodeMessage::WorkerMsg(WorkerMsgPayload {
            target: 17,
            body: WorkerMsgBody::Stop,
        }));
    }

    #[test]
    fn serde_deploy_remote_create_round_trip() {
        round_trip(&NodeMessage::DeployRemoteCreate(DeployRemoteCreatePayload {
            call_id: 9,
            deployment: DeploymentRef(0xDEAD_BEEF),
            node_idx: 2,
            state: Value::Nil,
            tag: "aggregator".to_string(),
            lifetime: Lifetime::Deployment,
        }));
        round_trip(&NodeMessage::DeployRemoteCreated(DeployRemoteCreatedPayload {
            call_id: 9,
            worker: Some(3),
            error: None,
        }));
        round_trip(&NodeMessage::DeployRemoteCreated(DeployRemoteCreatedPayload {
            call_id: 9,
            worker: None,
            error: Some("no capacity".to_string()),
        }));
    }

    #[test]
    fn serde_registry_and_tags() {
        let r = DeploymentRef(7);
        round_trip(&NodeMessage::RegistryPut(RegistryPutPayload {
            key: StoreKey::Links { deployment: r },
            value: vec![1, 2, 3],
        }));
        round_trip(&NodeMessage::RegistryDel(RegistryDelPayload {
            key: StoreKey::Deployment { deployment: r },
        }));
        round_trip(&NodeMessage::TagsPut(TagsPutPayload {
            node: "w1".to_string(),
            tags: vec!["gpu".to_string(), "ssd".to_string()],
        }));
        round_trip(&NodeMessage::TagsDel(TagsDelPayload {
            node: "w1".to_string(),
        }));
    }

    #[test]
    fn serde_membership_events() {
        round_trip(&NodeMessage::SubscribeUp(SubscribeUpPayload {
            node: sample_node(),
        }));
        round_trip(&NodeMessage::SubscribeDown(SubscribeDownPayload {
            node: "w1".to_string(),
            reason: DownReason::ConnectionLost,
        }));
    }

    #[test]
    fn serde_ping_pong() {
        round_trip(&NodeMessage::Ping(PingPayload { seq: 41 }));
        round_trip(&NodeMessage::Pong(PongPayload { seq: 41 }));
    }

    #[test]
    fn wire_tag_matches_message_kind() {
        // The serde tag is the protocol's message kind; pin the spelling.
        let msg = NodeMessage::Ping(PingPayload { seq: 1 });
        let bytes = rmp_serde::to_vec_named(&msg).unwrap();
        let as_text = String::from_utf8_lossy(&bytes);
        assert!(as_text.contains("PING"));

        let msg = NodeMessage::WorkerMsg(WorkerMsgPayload {
            target: 1,
            body: WorkerMsgBody::Stop,
        });
        let bytes = rmp_serde::to_vec_named(&msg).unwrap();
        let as_text = String::from_utf8_lossy(&bytes);
        assert!(as_text.contains("WORKER_MSG"));
    }
}
