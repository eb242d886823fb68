//! Node configuration from the `SKITTER_*` environment.

use std::env;

use crate::cluster::types::{ClusterConfig, NodeMode};

/// Environment variable names shared by every entry point.
pub mod env_vars {
    pub const MODE: &str = "SKITTER_MODE";
    pub const NODENAME: &str = "SKITTER_NODENAME";
    pub const COOKIE: &str = "SKITTER_COOKIE";
    pub const WORKERS: &str = "SKITTER_WORKERS";
    pub const TAGS: &str = "SKITTER_TAGS";
    pub const CORES: &str = "SKITTER_CORES";
}

/// Invalid or missing configuration. Fatal at startup (exit code 64).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("`{name}` is required in {mode} mode")]
    MissingVar { name: &'static str, mode: NodeMode },
    #[error("invalid value `{value}` for `{name}`: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Full configuration of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub mode: NodeMode,
    /// Node identity, unique within the cluster.
    pub name: String,
    /// `host:port` this node binds and advertises to peers.
    pub addr: String,
    /// Shared secret checked during the peer handshake.
    pub cookie: String,
    /// Worker nodenames (`name@host:port`) the master connects to.
    pub workers: Vec<String>,
    /// Capability tags advertised to the cluster.
    pub tags: Vec<String>,
    /// Worker cores advertised for placement.
    pub cores: usize,
    pub cluster: ClusterConfig,
}

impl NodeConfig {
    /// Loads configuration for the given mode from the environment.
    ///
    /// # Errors
    ///
    /// `ConfigError` when a required variable is missing or malformed, or
    /// when `SKITTER_MODE` is set and contradicts `mode`.
    pub fn from_env(mode: NodeMode) -> Result<Self, ConfigError> {
        if let Ok(raw) = env::var(env_vars::MODE) {
            let env_mode = NodeMode::parse(&raw).ok_or_else(|| ConfigError::InvalidVar {
                name: env_vars::MODE,
                value: raw.clone(),
                reason: "expected master, worker, or local".to_string(),
            })?;
            if env_mode != mode {
                return Err(ConfigError::InvalidVar {
                    name: env_vars::MODE,
                    value: raw,
                    reason: format!("conflicts with the `{mode}` entry point"),
                });
            }
        }

        let (name, addr) = match env::var(env_vars::NODENAME) {
            Ok(raw) => parse_nodename(&raw)?,
            Err(_) if mode == NodeMode::Local => ("local".to_string(), String::new()),
            Err(_) => {
                return Err(ConfigError::MissingVar {
                    name: env_vars::NODENAME,
                    mode,
                })
            }
        };

        let cookie = match env::var(env_vars::COOKIE) {
            Ok(cookie) => cookie,
            Err(_) if mode == NodeMode::Local => "nocookie".to_string(),
            Err(_) => {
                return Err(ConfigError::MissingVar {
                    name: env_vars::COOKIE,
                    mode,
                })
            }
        };

        let workers = match env::var(env_vars::WORKERS) {
            Ok(raw) => split_list(&raw),
            Err(_) => Vec::new(),
        };
        for worker in &workers {
            parse_nodename(worker).map_err(|_| ConfigError::InvalidVar {
                name: env_vars::WORKERS,
                value: worker.clone(),
                reason: "expected name@host:port".to_string(),
            })?;
        }

        let tags = env::var(env_vars::TAGS).map(|raw| split_list(&raw)).unwrap_or_default();

        let cores = match env::var(env_vars::CORES) {
            Ok(raw) => raw.parse::<usize>().ok().filter(|c| *c > 0).ok_or_else(|| {
                ConfigError::InvalidVar {
                    name: env_vars::CORES,
                    value: raw,
                    reason: "expected a positive integer".to_string(),
                }
            })?,
            Err(_) => default_cores(),
        };

        Ok(Self {
            mode,
            name,
            addr,
            cookie,
            workers,
            tags,
            cores,
            cluster: ClusterConfig::default(),
        })
    }

    /// Configuration for single-node local mode, used heavily by tests.
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            mode: NodeMode::Local,
            name: name.into(),
            addr: String::new(),
            cookie: "nocookie".to_string(),
            workers: Vec::new(),
            tags: Vec::new(),
            cores: 4,
            cluster: ClusterConfig::default(),
        }
    }
}

/// Splits a `name@host:port` nodename into identity and dial address.
///
/// # Errors
///
/// `ConfigError` when either part is empty or the `@` is missing.
pub fn parse_nodename(raw: &str) -> Result<(String, String), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidVar {
        name: env_vars::NODENAME,
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let (name, addr) = raw.split_once('@').ok_or_else(|| invalid("expected name@host:port"))?;
    if name.is_empty() {
        return Err(invalid("empty node name"));
    }
    if addr.is_empty() || !addr.contains(':') {
        return Err(invalid("expected host:port after `@`"));
    }
    Ok((name.to_string(), addr.to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn default_cores() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nodename_accepts_name_at_addr() {
        let (name, addr) = parse_nodename("w1@10.0.0.2:9090").unwrap();
        assert_eq!(name, "w1");
        assert_eq!(addr, "10.0.0.2:9090");
    }

    #[test]
    fn parse_nodename_rejects_malformed_values() {
        assert!(parse_nodename("w1").is_err());
        assert!(parse_nodename("@10.0.0.2:9090").is_err());
        assert!(parse_nodename("w1@").is_err());
        assert!(parse_nodename("w1@hostonly").is_err());
    }

    #[test]
    fn local_config_defaults() {
        let config = NodeConfig::local("test");
        assert_eq!(config.mode, NodeMode::Local);
        assert_eq!(config.name, "test");
        assert_eq!(config.cores, 4);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(
            split_list("a, b ,,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
