//! Fleet membership for the cluster coordinator
//!
//! Node identities, per-node bookkeeping and the sorted snapshot of the
//! configured fleet that the reconciler and the communicator operate on.

pub mod fleet;
pub mod node;
pub mod node_info;

pub use fleet::{Fleet, FleetStats};
pub use node::{Node, NodeType};
pub use node_info::{NodeInfo, RegistryPresence};

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Content cluster name, used in name-service paths
    pub cluster_name: String,
    /// Index of this coordinator, sent with every node-state poll
    pub coordinator_index: u16,
    /// Configured storage node indexes
    pub storage_nodes: Vec<u16>,
    /// Configured distributor node indexes
    pub distributor_nodes: Vec<u16>,
}

impl ClusterConfig {
    /// Every configured node, sorted by identity.
    pub fn configured_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .storage_nodes
            .iter()
            .map(|&i| Node::storage(i))
            .chain(self.distributor_nodes.iter().map(|&i| Node::distributor(i)))
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "content".to_string(),
            coordinator_index: 0,
            storage_nodes: Vec::new(),
            distributor_nodes: Vec::new(),
        }
    }
}
