//! Name-service paths of fleet nodes

use crate::cluster::{Node, NodeType};

const ROLE: &str = "storage";
const DEFAULT_SERVICE: &str = "default";

/// `storage/cluster.<name>/<type>/*`
pub fn node_pattern(cluster_name: &str, node_type: NodeType) -> String {
    format!("{}/cluster.{}/{}/*", ROLE, cluster_name, node_type)
}

/// `storage/cluster.<name>/<type>/*/default`
pub fn default_service_pattern(cluster_name: &str, node_type: NodeType) -> String {
    format!("{}/{}", node_pattern(cluster_name, node_type), DEFAULT_SERVICE)
}

/// Base path of a node, e.g. `storage/cluster.music/distributor/3`.
pub fn node_path(cluster_name: &str, node: Node) -> String {
    format!(
        "{}/cluster.{}/{}/{}",
        ROLE, cluster_name, node.node_type, node.index
    )
}

pub fn default_service_path(base: &str) -> String {
    format!("{}/{}", base, DEFAULT_SERVICE)
}

/// Parse a base path of `cluster_name` back into a node identity.
pub fn parse_node_path(cluster_name: &str, path: &str) -> Option<Node> {
    let mut segments = path.split('/');
    if segments.next()? != ROLE {
        return None;
    }
    if segments.next()?.strip_prefix("cluster.")? != cluster_name {
        return None;
    }
    let node_type: NodeType = segments.next()?.parse().ok()?;
    let index: u16 = segments.next()?.parse().ok()?;
    if segments.next().is_some() {
        return None;
    }
    Some(Node::new(node_type, index))
}
