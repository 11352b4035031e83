//! RPC protocol versions spoken by content nodes

use std::fmt;

pub const GET_NODE_STATE_METHOD: &str = "getnodestate3";
pub const SET_DISTRIBUTION_STATES_METHOD: &str = "setdistributionstates";
pub const SET_SYSTEM_STATE_2_METHOD: &str = "setsystemstate2";
pub const SET_SYSTEM_STATE_METHOD: &str = "setsystemstate";
pub const ACTIVATE_VERSION_METHOD: &str = "activate_cluster_state_version";

/// Cluster state protocol version negotiated with a node.
///
/// Every node starts at [`RpcVersion::LATEST`] and is walked down one step
/// per "no such method" rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RpcVersion {
    /// `setsystemstate` with the baseline text
    V1 = 1,
    /// `setsystemstate2` with the baseline text
    V2 = 2,
    /// `setdistributionstates` with an encoded bundle, push is final
    V3 = 3,
    /// `setdistributionstates` followed by an explicit activation
    V4 = 4,
}

impl RpcVersion {
    pub const LATEST: RpcVersion = RpcVersion::V4;

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn set_state_method(self) -> &'static str {
        match self {
            RpcVersion::V4 | RpcVersion::V3 => SET_DISTRIBUTION_STATES_METHOD,
            RpcVersion::V2 => SET_SYSTEM_STATE_2_METHOD,
            RpcVersion::V1 => SET_SYSTEM_STATE_METHOD,
        }
    }

    /// Whether pushes carry the encoded bundle rather than baseline text.
    pub fn sends_bundle(self) -> bool {
        matches!(self, RpcVersion::V4 | RpcVersion::V3)
    }

    pub fn supports_activation(self) -> bool {
        self == RpcVersion::V4
    }

    /// Next version with a different push method, or `None` at the bottom.
    pub fn set_state_fallback(self) -> Option<RpcVersion> {
        match self {
            RpcVersion::V4 | RpcVersion::V3 => Some(RpcVersion::V2),
            RpcVersion::V2 => Some(RpcVersion::V1),
            RpcVersion::V1 => None,
        }
    }

    /// Version to use once the node has rejected activation.
    pub fn activation_fallback(self) -> Option<RpcVersion> {
        match self {
            RpcVersion::V4 => Some(RpcVersion::V3),
            _ => None,
        }
    }
}

impl Default for RpcVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for RpcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}
