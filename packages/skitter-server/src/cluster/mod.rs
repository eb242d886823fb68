//! Cluster protocol module.
//!
//! Provides domain types, wire messages, the framed codec, the peer
//! transport, failure detection, and the membership protocol for the
//! master/worker cluster.

pub mod codec;
pub mod failure_detector;
pub mod membership;
pub mod messages;
pub mod transport;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

pub use codec::{Frame, FrameCodec};
pub use failure_detector::{now_ms, DeadlineFailureDetector, FailureDetector};
pub use messages::{NodeMessage, StoreKey};
pub use transport::{PeerHandle, PeerRegistry};
pub use types::{ClusterConfig, DownReason, MembersView, NodeInfo, NodeMode, RemoteState};

// ---------------------------------------------------------------------------
// ClusterError
// ---------------------------------------------------------------------------

/// Failures to establish or keep cluster connectivity. Fatal at startup
/// (exit code 65); at runtime they become down transitions instead.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },
    #[error("malformed worker nodename `{value}`")]
    BadNodename { value: String },
    #[error("node `{node}` is not a worker node")]
    ModeMismatch { node: String },
    #[error("cookie mismatch with node `{node}`")]
    CookieMismatch { node: String },
    #[error("node `{node}` rejected the connection: {reason}")]
    Rejected { node: String, reason: String },
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("unexpected handshake message")]
    UnexpectedHandshake,
    #[error("serve() called before start()")]
    NotStarted,
}
