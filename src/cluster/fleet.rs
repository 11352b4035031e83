//! Sorted membership snapshot of the configured fleet

use super::{ClusterConfig, Node, NodeInfo, NodeType, RegistryPresence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Configured nodes keyed by identity.
///
/// Owned by the coordination loop and mutated only through `&mut`, so no
/// locking is needed. Iteration order is (node type, index).
#[derive(Debug, Default)]
pub struct Fleet {
    nodes: BTreeMap<Node, NodeInfo>,
    generation: u64,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fleet holding every node named in `config`.
    pub fn from_config(config: &ClusterConfig) -> Self {
        let mut fleet = Self::new();
        for node in config.configured_nodes() {
            fleet.add_node(node);
        }
        info!(
            cluster = %config.cluster_name,
            storage = config.storage_nodes.len(),
            distributors = config.distributor_nodes.len(),
            "Fleet initialized from configuration"
        );
        fleet
    }

    /// Add a configured node. Existing entries are left untouched.
    pub fn add_node(&mut self, node: Node) -> &mut NodeInfo {
        self.nodes.entry(node).or_insert_with(|| NodeInfo::new(node))
    }

    pub fn is_configured(&self, node: &Node) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn get(&self, node: &Node) -> Option<&NodeInfo> {
        self.nodes.get(node)
    }

    pub fn get_mut(&mut self, node: &Node) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut NodeInfo> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes live in the name service.
    pub fn live_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().filter(|n| n.is_live())
    }

    /// Nodes with a recorded RPC address, sorted by identity: the previous
    /// side of a membership diff.
    pub fn addressed_nodes(&self) -> Vec<(Node, String, bool)> {
        self.nodes
            .values()
            .filter_map(|n| {
                n.rpc_address()
                    .map(|addr| (n.node(), addr.to_string(), n.is_live()))
            })
            .collect()
    }

    /// Name-service generation last committed by the reconciler.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn stats(&self) -> FleetStats {
        let mut stats = FleetStats {
            total_nodes: self.nodes.len(),
            ..FleetStats::default()
        };
        for node in self.nodes.values() {
            match node.presence() {
                RegistryPresence::Live => stats.live_nodes += 1,
                RegistryPresence::Stale { .. } => stats.stale_nodes += 1,
                RegistryPresence::Unknown => stats.unknown_nodes += 1,
            }
            match node.node().node_type {
                NodeType::Storage => stats.storage_nodes += 1,
                NodeType::Distributor => stats.distributor_nodes += 1,
            }
            if node.is_protocol_exhausted() {
                stats.exhausted_nodes += 1;
            }
        }
        stats
    }
}

/// Fleet statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStats {
    pub total_nodes: usize,
    pub live_nodes: usize,
    pub stale_nodes: usize,
    pub unknown_nodes: usize,
    pub storage_nodes: usize,
    pub distributor_nodes: usize,
    pub exhausted_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig {
            storage_nodes: vec![2, 0],
            distributor_nodes: vec![1],
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn test_from_config_is_sorted() {
        let fleet = Fleet::from_config(&config());
        let nodes: Vec<Node> = fleet.nodes().map(|n| n.node()).collect();
        assert_eq!(
            nodes,
            vec![Node::storage(0), Node::storage(2), Node::distributor(1)]
        );
        assert!(fleet.is_configured(&Node::storage(2)));
        assert!(!fleet.is_configured(&Node::storage(1)));
    }

    #[test]
    fn test_addressed_nodes_and_stats() {
        let mut fleet = Fleet::from_config(&config());
        let node = fleet.get_mut(&Node::storage(2)).unwrap();
        node.set_rpc_address("tcp/host:1");
        node.mark_live();
        fleet.get_mut(&Node::distributor(1)).unwrap().mark_stale(5);

        assert_eq!(
            fleet.addressed_nodes(),
            vec![(Node::storage(2), "tcp/host:1".to_string(), true)]
        );
        let stats = fleet.stats();
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.live_nodes, 1);
        assert_eq!(stats.stale_nodes, 1);
        assert_eq!(stats.unknown_nodes, 1);
        assert_eq!(stats.storage_nodes, 2);
    }
}
