//! Requests, replies and per-call failures

use super::waiter::Waiter;
use super::RpcVersion;
use crate::cluster::Node;
use crate::rpc::{ErrorCode, Request, RpcError, Value};
use crate::state::ClusterStateBundle;
use std::fmt;
use std::sync::Arc;

/// Why a dispatched request did not produce a usable reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Connection failure, timeout or local abort
    Transport { code: ErrorCode, message: String },
    /// The node does not know the method; the caller should step down the
    /// protocol ladder and retry
    ProtocolDowngrade { message: String },
    /// The node rejected the request shape
    Protocol { code: ErrorCode, message: String },
    /// The reply did not have the expected shape
    BadReply(String),
    /// Remote-supplied failure
    Application { code: ErrorCode, message: String },
}

impl RequestError {
    /// Classify an RPC failure. `downgradable` marks methods for which "no
    /// such method" means an older protocol should be tried.
    pub fn from_rpc(error: RpcError, downgradable: bool) -> Self {
        let RpcError { code, message } = error;
        if code == ErrorCode::NoSuchMethod && downgradable {
            RequestError::ProtocolDowngrade { message }
        } else if code.is_transport() {
            RequestError::Transport { code, message }
        } else if code.is_protocol() {
            RequestError::Protocol { code, message }
        } else {
            RequestError::Application { code, message }
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RequestError::Transport { .. })
    }

    pub fn is_downgrade(&self) -> bool {
        matches!(self, RequestError::ProtocolDowngrade { .. })
    }

    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            RequestError::Transport {
                code: ErrorCode::Abort,
                ..
            }
        )
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::Transport { .. } => "transport",
            RequestError::ProtocolDowngrade { .. } => "downgrade",
            RequestError::Protocol { .. } => "protocol",
            RequestError::BadReply(_) => "bad_reply",
            RequestError::Application { .. } => "application",
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Transport { code, message } => {
                write!(f, "transport error {}: {}", code.code(), message)
            }
            RequestError::ProtocolDowngrade { message } => {
                write!(f, "method not supported by node: {}", message)
            }
            RequestError::Protocol { code, message } => {
                write!(f, "protocol error {}: {}", code.code(), message)
            }
            RequestError::BadReply(msg) => write!(f, "bad reply: {}", msg),
            RequestError::Application { code, message } => {
                write!(f, "node error {}: {}", code.code(), message)
            }
        }
    }
}

impl std::error::Error for RequestError {}

/// Node state as reported by a poll reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateReport {
    pub state: String,
    pub host_info: String,
}

impl NodeStateReport {
    /// Parse `[state, host_info?]`. A reply carrying only the state defaults
    /// the host info to empty.
    pub fn from_values(values: &[Value]) -> Result<Self, RequestError> {
        let state = values
            .first()
            .ok_or_else(|| RequestError::BadReply("node state reply has no values".to_string()))?;
        let state = state.as_str().ok_or_else(|| {
            RequestError::BadReply(format!(
                "node state reply starts with {}, expected string",
                state.type_name()
            ))
        })?;
        let host_info = match values.get(1) {
            None => "",
            Some(value) => value.as_str().ok_or_else(|| {
                RequestError::BadReply(format!(
                    "host info is {}, expected string",
                    value.type_name()
                ))
            })?,
        };
        Ok(Self {
            state: state.to_string(),
            host_info: host_info.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetNodeStateReply {
    pub node: Node,
    /// State string sent with the poll
    pub sent_state: String,
    pub timeout_ms: i32,
    pub result: Result<NodeStateReport, RequestError>,
}

#[derive(Debug, Clone)]
pub struct SetClusterStateReply {
    pub node: Node,
    /// The bundle that was sent, for "last sent" bookkeeping
    pub bundle: Arc<ClusterStateBundle>,
    pub rpc_version: RpcVersion,
    pub result: Result<(), RequestError>,
}

impl SetClusterStateReply {
    pub fn version(&self) -> u32 {
        self.bundle.version()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateVersionReply {
    pub node: Node,
    pub version: u32,
    /// Version the node actually activated
    pub result: Result<u32, RequestError>,
}

/// Any node reply, for loops draining a single channel.
#[derive(Debug, Clone)]
pub enum NodeReply {
    NodeState(GetNodeStateReply),
    SetClusterState(SetClusterStateReply),
    Activation(ActivateVersionReply),
}

impl NodeReply {
    pub fn node(&self) -> Node {
        match self {
            NodeReply::NodeState(r) => r.node,
            NodeReply::SetClusterState(r) => r.node,
            NodeReply::Activation(r) => r.node,
        }
    }
}

impl From<GetNodeStateReply> for NodeReply {
    fn from(reply: GetNodeStateReply) -> Self {
        NodeReply::NodeState(reply)
    }
}

impl From<SetClusterStateReply> for NodeReply {
    fn from(reply: SetClusterStateReply) -> Self {
        NodeReply::SetClusterState(reply)
    }
}

impl From<ActivateVersionReply> for NodeReply {
    fn from(reply: ActivateVersionReply) -> Self {
        NodeReply::Activation(reply)
    }
}

/// One in-flight call: target, outbound request, waiter and creation time.
/// Consumed when the reply is delivered.
pub struct PendingRequest<R> {
    pub node: Node,
    pub request: Request,
    pub created_ms: i64,
    waiter: Box<dyn Waiter<R>>,
}

impl<R: 'static> PendingRequest<R> {
    pub fn new(node: Node, request: Request, created_ms: i64, waiter: Box<dyn Waiter<R>>) -> Self {
        Self {
            node,
            request,
            created_ms,
            waiter,
        }
    }

    pub fn complete(self, reply: R) {
        self.waiter.done(reply);
    }
}

impl<R> fmt::Debug for PendingRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("node", &self.node)
            .field("method", &self.request.method)
            .field("created_ms", &self.created_ms)
            .finish()
    }
}
