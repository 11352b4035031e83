//! Component factory for environment-based configuration
//!
//! This module builds the transport, the name-service mirror and the
//! communicator and cluster settings from environment variables, so the
//! probe and embedding coordinators share one way of being configured.

use crate::cluster::ClusterConfig;
use crate::communicator::CommunicatorConfig;
use crate::registry::{NameServiceMirror, StaticNameService};
use crate::rpc::{RpcTransport, TcpTransport};
use crate::{Error, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the RPC transport from environment
    ///
    /// Environment variables:
    /// - FLEETSTATE_TRANSPORT: "tcp" (default)
    /// - FLEETSTATE_CONNECT_TIMEOUT_MS: connect timeout (default: 5000)
    pub fn create_transport() -> Result<Arc<dyn RpcTransport>> {
        let backend = std::env::var("FLEETSTATE_TRANSPORT").unwrap_or_else(|_| "tcp".to_string());

        match backend.as_str() {
            "tcp" => {
                let connect_timeout = Duration::from_millis(
                    env_parse("FLEETSTATE_CONNECT_TIMEOUT_MS")?.unwrap_or(5_000u64),
                );
                info!(connect_timeout_ms = connect_timeout.as_millis() as u64, "Using TCP transport");
                Ok(Arc::new(TcpTransport::new(connect_timeout)))
            }
            _ => Err(Error::Config(format!(
                "Unknown FLEETSTATE_TRANSPORT: {}. Use 'tcp'",
                backend
            ))),
        }
    }

    /// Create the name-service mirror from environment
    ///
    /// Environment variables:
    /// - FLEETSTATE_NAME_SERVICE: "static" (default, starts empty) or "file"
    /// - FLEETSTATE_NAME_SERVICE_FILE: JSON registrations (required for file)
    pub fn create_name_service() -> Result<Arc<dyn NameServiceMirror>> {
        let backend =
            std::env::var("FLEETSTATE_NAME_SERVICE").unwrap_or_else(|_| "static".to_string());

        match backend.as_str() {
            "static" => {
                info!("Using empty static name service (development mode)");
                Ok(Arc::new(StaticNameService::new()))
            }
            "file" => {
                let path = std::env::var("FLEETSTATE_NAME_SERVICE_FILE").map_err(|_| {
                    Error::Config(
                        "FLEETSTATE_NAME_SERVICE_FILE required when FLEETSTATE_NAME_SERVICE=file"
                            .to_string(),
                    )
                })?;
                Ok(Arc::new(StaticNameService::from_json_file(path)?))
            }
            _ => Err(Error::Config(format!(
                "Unknown FLEETSTATE_NAME_SERVICE: {}. Use 'static' or 'file'",
                backend
            ))),
        }
    }

    /// Communicator settings with environment overrides
    ///
    /// Environment variables:
    /// - FLEETSTATE_COORDINATOR_INDEX (default: 0)
    /// - FLEETSTATE_NODE_STATE_TIMEOUT_MS (default: 60000)
    /// - FLEETSTATE_JITTER_START_PCT (default: 80)
    /// - FLEETSTATE_JITTER_STOP_PCT (default: 100)
    pub fn communicator_config() -> Result<CommunicatorConfig> {
        let mut config = CommunicatorConfig::default();
        if let Some(index) = env_parse("FLEETSTATE_COORDINATOR_INDEX")? {
            config.coordinator_index = index;
        }
        if let Some(ms) = env_parse::<u64>("FLEETSTATE_NODE_STATE_TIMEOUT_MS")? {
            config.max_node_state_timeout = Duration::from_millis(ms);
        }
        if let Some(pct) = env_parse("FLEETSTATE_JITTER_START_PCT")? {
            config.jitter_start_percent = pct;
        }
        if let Some(pct) = env_parse("FLEETSTATE_JITTER_STOP_PCT")? {
            config.jitter_stop_percent = pct;
        }
        config.validate()?;
        Ok(config)
    }

    /// Cluster topology from environment
    ///
    /// Environment variables:
    /// - FLEETSTATE_CLUSTER_NAME (default: content)
    /// - FLEETSTATE_COORDINATOR_INDEX (default: 0)
    /// - FLEETSTATE_STORAGE_NODES: index list such as "0,1,4-7"
    /// - FLEETSTATE_DISTRIBUTOR_NODES: index list
    pub fn cluster_config() -> Result<ClusterConfig> {
        let mut config = ClusterConfig::default();
        if let Ok(name) = std::env::var("FLEETSTATE_CLUSTER_NAME") {
            let name = name.trim();
            if name.is_empty() || name.contains('/') {
                return Err(Error::Config(format!(
                    "FLEETSTATE_CLUSTER_NAME '{}' is not a valid cluster name",
                    name
                )));
            }
            config.cluster_name = name.to_string();
        }
        if let Some(index) = env_parse("FLEETSTATE_COORDINATOR_INDEX")? {
            config.coordinator_index = index;
        }
        if let Ok(raw) = std::env::var("FLEETSTATE_STORAGE_NODES") {
            config.storage_nodes = parse_index_list(&raw)?;
        }
        if let Ok(raw) = std::env::var("FLEETSTATE_DISTRIBUTOR_NODES") {
            config.distributor_nodes = parse_index_list(&raw)?;
        }
        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} has invalid value '{raw}': {e}")))
}

/// Parse `"0,2,5-7"` into sorted, deduplicated node indexes.
pub fn parse_index_list(raw: &str) -> Result<Vec<u16>> {
    let mut indexes = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid node index '{}': {}", s, e)))
        };
        match part.split_once('-') {
            Some((low, high)) => {
                let (low, high) = (parse(low)?, parse(high)?);
                if low > high {
                    return Err(Error::Config(format!("empty node index range '{}'", part)));
                }
                indexes.extend(low..=high);
            }
            None => indexes.push(parse(part)?),
        }
    }
    indexes.sort_unstable();
    indexes.dedup();
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_list() {
        assert_eq!(parse_index_list("3, 0,1-2").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_index_list("").unwrap(), Vec::<u16>::new());
        assert_eq!(parse_index_list("4,4").unwrap(), vec![4]);
        assert!(parse_index_list("2-1").is_err());
        assert!(parse_index_list("x").is_err());
    }
}
