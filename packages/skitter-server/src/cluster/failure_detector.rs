//! Deadline-based failure detection.
//!
//! The master records a heartbeat for a worker whenever a `PONG` (or any
//! other proof of life) arrives; a monitor task periodically asks for
//! suspects. Workers run the same detector against the master's `PING`s.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Seam for liveness tracking, so membership logic stays independent of
/// the detection policy.
pub trait FailureDetector: Send + Sync {
    /// Records proof of life from a node at `timestamp_ms`.
    fn heartbeat(&self, node: &str, timestamp_ms: u64);

    /// Whether the node is currently considered alive. Unknown nodes are
    /// not alive.
    fn is_alive(&self, node: &str, now_ms: u64) -> bool;

    /// All tracked nodes currently considered down.
    fn suspects(&self, now_ms: u64) -> Vec<String>;

    /// Stops tracking a node.
    fn forget(&self, node: &str);
}

/// Declares a node down once it has been silent longer than a fixed
/// deadline.
pub struct DeadlineFailureDetector {
    deadline_ms: u64,
    last_seen: RwLock<HashMap<String, u64>>,
}

impl DeadlineFailureDetector {
    #[must_use]
    pub fn new(deadline_ms: u64) -> Self {
        Self {
            deadline_ms,
            last_seen: RwLock::new(HashMap::new()),
        }
    }
}

impl FailureDetector for DeadlineFailureDetector {
    fn heartbeat(&self, node: &str, timestamp_ms: u64) {
        let mut last_seen = self.last_seen.write();
        let entry = last_seen.entry(node.to_string()).or_insert(timestamp_ms);
        // Heartbeats can arrive out of order across tasks; never move the
        // clock backwards.
        if timestamp_ms > *entry {
            *entry = timestamp_ms;
        }
    }

    fn is_alive(&self, node: &str, now_ms: u64) -> bool {
        self.last_seen
            .read()
            .get(node)
            .is_some_and(|last| now_ms.saturating_sub(*last) <= self.deadline_ms)
    }

    fn suspects(&self, now_ms: u64) -> Vec<String> {
        self.last_seen
            .read()
            .iter()
            .filter(|(_, last)| now_ms.saturating_sub(**last) > self.deadline_ms)
            .map(|(node, _)| node.clone())
            .collect()
    }

    fn forget(&self, node: &str) {
        self.last_seen.write().remove(node);
    }
}

/// Milliseconds since the Unix epoch, the detector's time base.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_node_is_not_alive() {
        let detector = DeadlineFailureDetector::new(1000);
        assert!(!detector.is_alive("w1", 0));
        assert!(detector.suspects(10_000).is_empty());
    }

    #[test]
    fn alive_within_deadline_dead_after() {
        let detector = DeadlineFailureDetector::new(1000);
        detector.heartbeat("w1", 5000);
        assert!(detector.is_alive("w1", 5500));
        assert!(detector.is_alive("w1", 6000));
        assert!(!detector.is_alive("w1", 6001));
        assert_eq!(detector.suspects(6001), vec!["w1".to_string()]);
    }

    #[test]
    fn heartbeat_refreshes_the_deadline() {
        let detector = DeadlineFailureDetector::new(1000);
        detector.heartbeat("w1", 5000);
        detector.heartbeat("w1", 6000);
        assert!(detector.is_alive("w1", 6900));
        assert!(detector.suspects(6900).is_empty());
    }

    #[test]
    fn stale_heartbeat_does_not_rewind() {
        let detector = DeadlineFailureDetector::new(1000);
        detector.heartbeat("w1", 6000);
        detector.heartbeat("w1", 5000);
        assert!(detector.is_alive("w1", 6900));
    }

    #[test]
    fn forget_stops_tracking() {
        let detector = DeadlineFailureDetector::new(1000);
        detector.heartbeat("w1", 5000);
        detector.forget("w1");
        assert!(!detector.is_alive("w1", 5100));
        assert!(detector.suspects(10_000).is_empty());
    }

    #[test]
    fn suspects_lists_only_silent_nodes() {
        let detector = DeadlineFailureDetector::new(1000);
        detector.heartbeat("w1", 1000);
        detector.heartbeat("w2", 4000);
        let mut suspects = detector.suspects(4500);
        suspects.sort();
        assert_eq!(suspects, vec!["w1".to_string()]);
    }

    #[test]
    fn trait_object_usable() {
        let detector: Box<dyn FailureDetector> = Box::new(DeadlineFailureDetector::new(1000));
        detector.heartbeat("w1", 100);
        assert!(detector.is_alive("w1", 200));
    }
}
