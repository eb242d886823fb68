//! Node shutdown control.
//!
//! Uses `ArcSwap` for lock-free health-state reads and a watch channel to
//! signal long-running tasks (accept loop, monitors) that the node is
//! going down.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Node health, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Node is initializing.
    Starting,
    /// Node is serving.
    Ready,
    /// Shutdown triggered; tasks are winding down.
    Draining,
    /// Fully stopped.
    Stopped,
}

/// Coordinates graceful shutdown across the node's tasks.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    health: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            signal,
            health: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    /// Marks the node ready to serve.
    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Marks the node fully stopped.
    pub fn set_stopped(&self) {
        self.health.store(Arc::new(HealthState::Stopped));
    }

    /// A receiver that fires when shutdown is triggered. Tasks select on
    /// this next to their main loop.
    #[must_use]
    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Initiates shutdown: transitions to `Draining` and signals every
    /// receiver.
    pub fn trigger(&self) {
        self.health.store(Arc::new(HealthState::Draining));
        // Receivers may already be gone.
        let _ = self.signal.send(true);
    }

    #[must_use]
    pub fn health(&self) -> HealthState {
        **self.health.load()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self.health(), HealthState::Draining | HealthState::Stopped)
    }

    /// Waits until shutdown is triggered.
    pub async fn wait(&self) {
        let mut rx = self.receiver();
        if *rx.borrow() {
            return;
        }
        // Only fails when the sender is dropped, which means shutdown.
        let _ = rx.changed().await;
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}
