//! `skitter` — cluster node entry points.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use skitter_core::OperationRegistry;
use skitter_server::cluster::NodeMode;
use skitter_server::config::NodeConfig;
use skitter_server::registry::StrategyRegistry;
use skitter_server::{logging, Node};

/// Normal termination.
const EX_OK: i32 = 0;
/// Invalid configuration.
const EX_CONFIG: i32 = 64;
/// Cluster join failure.
const EX_JOIN: i32 = 65;
/// Internal invariant violation.
const EX_INTERNAL: i32 = 70;

#[derive(Parser)]
#[command(name = "skitter", version, about = "Distributed stream processing runtime node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a master node. Workers come from `SKITTER_WORKERS`.
    Master,
    /// Start a worker node advertising `SKITTER_TAGS`.
    Worker,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let mode = match cli.command {
        Command::Master => NodeMode::Master,
        Command::Worker => NodeMode::Worker,
    };

    let config = match NodeConfig::from_env(mode) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(EX_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "cannot build async runtime");
            std::process::exit(EX_INTERNAL);
        }
    };

    let code = match std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(run_node(config))
    })) {
        Ok(code) => code,
        Err(_) => {
            error!("internal invariant violation");
            EX_INTERNAL
        }
    };
    std::process::exit(code);
}

async fn run_node(config: NodeConfig) -> i32 {
    // Deployable operations are registered here at program start;
    // a bare node ships without any.
    let operations = Arc::new(OperationRegistry::new());
    let strategies = Arc::new(StrategyRegistry::with_builtins());

    let mut node = Node::new(config, operations, strategies);
    if let Err(err) = node.start().await {
        error!(%err, "cannot bind listener");
        return EX_JOIN;
    }
    if let Err(err) = node.serve().await {
        error!(%err, "cannot join cluster");
        return EX_JOIN;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = node.wait() => {}
    }

    node.stop().await;
    EX_OK
}
