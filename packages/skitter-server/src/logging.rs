//! Tracing setup for the `skitter` binary.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Environment variable controlling log filtering.
const FILTER_ENV: &str = "SKITTER_LOG";

/// Default directive when the environment does not set one.
const DEFAULT_FILTER: &str = "info";

static INIT: Once = Once::new();

/// Initializes the global subscriber once. Filters come from
/// `SKITTER_LOG` (standard `tracing` directive syntax), defaulting to
/// `info`.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
