//! Node identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a fleet member.
///
/// The declaration order is the sort order used by membership diffing:
/// storage nodes sort before distributors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Storage node (holds bucket data)
    Storage,
    /// Distributor node (routes bucket operations)
    Distributor,
}

impl NodeType {
    pub const ALL: [NodeType; 2] = [NodeType::Storage, NodeType::Distributor];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Storage => "storage",
            NodeType::Distributor => "distributor",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "storage" => Ok(NodeType::Storage),
            "distributor" => Ok(NodeType::Distributor),
            other => Err(format!(
                "unknown node type '{}'; expected storage or distributor",
                other
            )),
        }
    }
}

/// Identity of a fleet member: node type, then index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub node_type: NodeType,
    pub index: u16,
}

impl Node {
    pub fn new(node_type: NodeType, index: u16) -> Self {
        Self { node_type, index }
    }

    pub fn storage(index: u16) -> Self {
        Self::new(NodeType::Storage, index)
    }

    pub fn distributor(index: u16) -> Self {
        Self::new(NodeType::Distributor, index)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.index)
    }
}
