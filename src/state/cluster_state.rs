//! Versioned cluster state and its text form
//!
//! A cluster state is written as space separated tokens, e.g.
//! `version:7 cluster:d distributor:3 .1.s:d storage:4 .0.s:m .3.s:r`.
//! Nodes below a type's count that are not listed are up.

use crate::cluster::{Node, NodeType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const DEFAULT_DISTRIBUTION_BITS: u16 = 16;

/// State of a node or of the cluster as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Up,
    Down,
    Maintenance,
    Retired,
    Initializing,
    Stopping,
}

impl State {
    pub fn code(&self) -> &'static str {
        match self {
            State::Up => "u",
            State::Down => "d",
            State::Maintenance => "m",
            State::Retired => "r",
            State::Initializing => "i",
            State::Stopping => "s",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "u" => Ok(State::Up),
            "d" => Ok(State::Down),
            "m" => Ok(State::Maintenance),
            "r" => Ok(State::Retired),
            "i" => Ok(State::Initializing),
            "s" => Ok(State::Stopping),
            other => Err(Error::InvalidClusterState(format!(
                "unknown state code '{}'",
                other
            ))),
        }
    }
}

/// Immutable-by-convention snapshot of the cluster: version, cluster-wide
/// state and per-node states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterState {
    version: u32,
    cluster_state: State,
    distribution_bits: u16,
    node_counts: BTreeMap<NodeType, u16>,
    /// Nodes whose state is not `Up`
    node_states: BTreeMap<Node, State>,
}

impl ClusterState {
    /// Create an empty, up cluster state with the given version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            cluster_state: State::Up,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            node_counts: BTreeMap::new(),
            node_states: BTreeMap::new(),
        }
    }

    /// Builder-style helper setting the number of nodes of a type.
    pub fn with_node_count(mut self, node_type: NodeType, count: u16) -> Self {
        self.set_node_count(node_type, count);
        self
    }

    /// Builder-style helper setting a node's state.
    pub fn with_node_state(mut self, node: Node, state: State) -> Self {
        self.set_node_state(node, state);
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn cluster_state(&self) -> State {
        self.cluster_state
    }

    pub fn set_cluster_state(&mut self, state: State) {
        self.cluster_state = state;
    }

    pub fn distribution_bits(&self) -> u16 {
        self.distribution_bits
    }

    pub fn set_distribution_bits(&mut self, bits: u16) {
        self.distribution_bits = bits;
    }

    pub fn node_count(&self, node_type: NodeType) -> u16 {
        self.node_counts.get(&node_type).copied().unwrap_or(0)
    }

    /// Set the node count for a type, dropping exceptions beyond it.
    pub fn set_node_count(&mut self, node_type: NodeType, count: u16) {
        if count == 0 {
            self.node_counts.remove(&node_type);
        } else {
            self.node_counts.insert(node_type, count);
        }
        self.node_states
            .retain(|node, _| node.node_type != node_type || node.index < count);
    }

    /// Set a node's state, growing the node count to include it.
    pub fn set_node_state(&mut self, node: Node, state: State) {
        if node.index >= self.node_count(node.node_type) {
            self.node_counts.insert(node.node_type, node.index + 1);
        }
        if state == State::Up {
            self.node_states.remove(&node);
        } else {
            self.node_states.insert(node, state);
        }
    }

    /// State of a node; nodes outside the count are down.
    pub fn node_state(&self, node: &Node) -> State {
        if node.index >= self.node_count(node.node_type) {
            return State::Down;
        }
        self.node_states.get(node).copied().unwrap_or(State::Up)
    }

    /// Parse the text form.
    pub fn parse(text: &str) -> Result<Self> {
        let mut state = ClusterState::new(0);
        let mut current_type: Option<NodeType> = None;

        for token in text.split_whitespace() {
            if let Some(rest) = token.strip_prefix('.') {
                let node_type = current_type.ok_or_else(|| {
                    Error::InvalidClusterState(format!(
                        "node token '{}' appears before a node type",
                        token
                    ))
                })?;
                state.apply_node_token(node_type, rest, token)?;
                continue;
            }

            let (key, value) = token.split_once(':').ok_or_else(|| {
                Error::InvalidClusterState(format!("token '{}' is not key:value", token))
            })?;
            current_type = None;
            match key {
                "version" => state.version = parse_number(token, value)?,
                "bits" => state.distribution_bits = parse_number(token, value)?,
                "cluster" => state.cluster_state = State::from_code(value)?,
                "storage" | "distributor" => {
                    let node_type = key
                        .parse::<NodeType>()
                        .map_err(Error::InvalidClusterState)?;
                    let count: u16 = parse_number(token, value)?;
                    state.set_node_count(node_type, count);
                    current_type = Some(node_type);
                }
                _ => {
                    // Keys from newer producers are skipped.
                }
            }
        }

        Ok(state)
    }

    fn apply_node_token(&mut self, node_type: NodeType, rest: &str, token: &str) -> Result<()> {
        let (index, attribute) = rest.split_once('.').ok_or_else(|| {
            Error::InvalidClusterState(format!("malformed node token '{}'", token))
        })?;
        let index: u16 = parse_number(token, index)?;
        let (key, value) = attribute.split_once(':').ok_or_else(|| {
            Error::InvalidClusterState(format!("malformed node token '{}'", token))
        })?;
        if index >= self.node_count(node_type) {
            return Err(Error::InvalidClusterState(format!(
                "node {}.{} is outside the declared count {}",
                node_type,
                index,
                self.node_count(node_type)
            )));
        }
        if key == "s" {
            let node_state = State::from_code(value)?;
            self.set_node_state(Node::new(node_type, index), node_state);
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(token: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        Error::InvalidClusterState(format!("invalid number in token '{}'", token))
    })
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version:{}", self.version)?;
        if self.distribution_bits != DEFAULT_DISTRIBUTION_BITS {
            write!(f, " bits:{}", self.distribution_bits)?;
        }
        if self.cluster_state != State::Up {
            write!(f, " cluster:{}", self.cluster_state.code())?;
        }
        for node_type in [NodeType::Distributor, NodeType::Storage] {
            let count = self.node_count(node_type);
            if count == 0 {
                continue;
            }
            write!(f, " {}:{}", node_type, count)?;
            for (node, state) in self.node_states.range(
                Node::new(node_type, 0)..=Node::new(node_type, u16::MAX),
            ) {
                write!(f, " .{}.s:{}", node.index, state.code())?;
            }
        }
        Ok(())
    }
}

impl FromStr for ClusterState {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        ClusterState::parse(text)
    }
}
