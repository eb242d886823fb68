//! Skitter runtime node — strategies, workers, placement, routing,
//! deployment, and cluster membership on top of `skitter-core`.

pub mod cluster;
pub mod config;
pub mod deploy;
pub mod logging;
pub mod node;
pub mod placement;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod strategy;
pub mod worker;

pub use cluster::{ClusterError, NodeMode};
pub use config::{ConfigError, NodeConfig};
pub use deploy::{deploy, DeployError, Manager};
pub use node::{Node, NodeRuntime};
pub use placement::{Placement, PlacementError, PlacementService};
pub use registry::StrategyRegistry;
pub use shutdown::{HealthState, ShutdownController};
pub use store::{Deployment, DeploymentRef, DeploymentStore};
pub use strategy::{ProcessResult, Strategy, StrategyContext, StrategyError};
pub use worker::{Lifetime, SendError, WorkerRef};
