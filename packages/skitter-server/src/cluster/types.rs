//! Cluster domain types: node roles, membership views, and configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Role a node runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Owns deployment decisions; exactly one per cluster.
    Master,
    /// Hosts workers; advertises tags and capacity.
    Worker,
    /// Single-node mode without networking.
    Local,
}

impl NodeMode {
    /// Parses the `SKITTER_MODE` spelling of a mode.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "master" => Some(NodeMode::Master),
            "worker" => Some(NodeMode::Worker),
            "local" => Some(NodeMode::Local),
            _ => None,
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMode::Master => write!(f, "master"),
            NodeMode::Worker => write!(f, "worker"),
            NodeMode::Local => write!(f, "local"),
        }
    }
}

/// Connection state tracked per remote on the master.
///
/// ```text
/// disconnected --connect--> verifying --ok--> connected --loss--> disconnected
///                               |
///                               +--mode-mismatch/rejected--> disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Disconnected,
    Verifying,
    Connected,
}

/// Why a remote transitioned back to disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownReason {
    /// The peer did not advertise the worker role.
    ModeMismatch,
    /// The peer refused the handshake.
    Rejected,
    /// The connection dropped or the peer stopped answering pings.
    ConnectionLost,
    /// The peer left gracefully.
    Shutdown,
}

impl fmt::Display for DownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownReason::ModeMismatch => write!(f, "mode mismatch"),
            DownReason::Rejected => write!(f, "rejected"),
            DownReason::ConnectionLost => write!(f, "connection lost"),
            DownReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// Identity and capability of a node, exchanged during the handshake and
/// in up events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    /// `host:port` peers use to dial this node.
    pub addr: String,
    pub mode: NodeMode,
    pub tags: Vec<String>,
    /// Worker cores: the capacity the placement service round-robins over.
    pub cores: usize,
}

/// Versioned snapshot of the worker-capable nodes this node knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersView {
    pub version: u64,
    pub members: Vec<NodeInfo>,
}

impl MembersView {
    #[must_use]
    pub fn get_member(&self, name: &str) -> Option<&NodeInfo> {
        self.members.iter().find(|m| m.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get_member(name).is_some()
    }

    /// Total advertised worker cores across all members.
    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.members.iter().map(|m| m.cores).sum()
    }
}

/// Timing and capacity knobs for the cluster protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub ping_interval_ms: u64,
    /// A node missing pings for this long is considered down.
    pub ping_deadline_ms: u64,
    pub connect_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub outbound_channel_capacity: usize,
    pub max_frame_len: usize,
    /// Consecutive callback failures before a worker tears its workflow down.
    pub worker_failure_limit: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000,
            ping_deadline_ms: 5000,
            connect_timeout_ms: 5000,
            rpc_timeout_ms: 5000,
            outbound_channel_capacity: 256,
            max_frame_len: 16 * 1024 * 1024,
            worker_failure_limit: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, cores: usize) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            addr: "127.0.0.1:9000".to_string(),
            mode: NodeMode::Worker,
            tags: vec![],
            cores,
        }
    }

    #[test]
    fn mode_parses_env_spellings() {
        assert_eq!(NodeMode::parse("master"), Some(NodeMode::Master));
        assert_eq!(NodeMode::parse("worker"), Some(NodeMode::Worker));
        assert_eq!(NodeMode::parse("local"), Some(NodeMode::Local));
        assert_eq!(NodeMode::parse("MASTER"), None);
    }

    #[test]
    fn members_view_lookup_and_capacity() {
        let view = MembersView {
            version: 1,
            members: vec![member("w1", 4), member("w2", 2)],
        };
        assert!(view.contains("w1"));
        assert!(!view.contains("w3"));
        assert_eq!(view.get_member("w2").unwrap().cores, 2);
        assert_eq!(view.total_cores(), 6);
    }

    #[test]
    fn node_info_serde_round_trip() {
        let info = member("w1", 8);
        let bytes = rmp_serde::to_vec_named(&info).unwrap();
        let decoded: NodeInfo = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(info, decoded);
    }
}
