//! Per-node bookkeeping held by the coordinator

use super::Node;
use crate::communicator::{GetNodeStateReply, RpcVersion};
use crate::rpc::NodeConnection;
use crate::{Error, Result};
use tracing::{debug, info, warn};

/// What the name service last told us about a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryPresence {
    /// Never seen in the name service
    Unknown,
    /// Registered and reachable at the recorded address
    Live,
    /// Was registered, has since disappeared
    Stale { since_ms: i64 },
}

/// Everything the coordinator tracks for one configured node.
#[derive(Debug)]
pub struct NodeInfo {
    node: Node,
    rpc_address: Option<String>,
    presence: RegistryPresence,
    connection: NodeConnection,
    rpc_version: RpcVersion,
    reported_state: Option<String>,
    host_info: String,
    reported_at_ms: Option<i64>,
    pending_bundle_version: Option<u32>,
    acked_bundle_version: Option<u32>,
    pending_activation_version: Option<u32>,
    activated_version: Option<u32>,
    protocol_exhausted: bool,
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            rpc_address: None,
            presence: RegistryPresence::Unknown,
            connection: NodeConnection::new(),
            rpc_version: RpcVersion::LATEST,
            reported_state: None,
            host_info: String::new(),
            reported_at_ms: None,
            pending_bundle_version: None,
            acked_bundle_version: None,
            pending_activation_version: None,
            activated_version: None,
            protocol_exhausted: false,
        }
    }

    pub fn node(&self) -> Node {
        self.node
    }

    pub fn rpc_address(&self) -> Option<&str> {
        self.rpc_address.as_deref()
    }

    pub fn presence(&self) -> RegistryPresence {
        self.presence
    }

    pub fn is_live(&self) -> bool {
        self.presence == RegistryPresence::Live
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.presence, RegistryPresence::Stale { .. })
    }

    /// Record a new RPC address. A changed address drops the cached
    /// connection and any in-flight poll.
    pub fn set_rpc_address(&mut self, address: impl Into<String>) {
        let address = address.into();
        if self.rpc_address.as_deref() == Some(address.as_str()) {
            return;
        }
        if let Some(previous) = &self.rpc_address {
            info!(node = %self.node, previous = %previous, address = %address, "Node moved to new RPC address");
        }
        self.connection.abort_pending_poll();
        self.connection.reset();
        self.forget_rollout();
        self.rpc_address = Some(address);
    }

    pub fn mark_live(&mut self) {
        self.presence = RegistryPresence::Live;
    }

    /// Mark the node as gone from the name service. The address is kept so a
    /// re-registration at the same address counts as returning. Whatever
    /// comes back is a new process, so rollout progress is forgotten.
    pub fn mark_stale(&mut self, now_ms: i64) {
        if !self.is_stale() {
            self.presence = RegistryPresence::Stale { since_ms: now_ms };
        }
        self.clear_reported_state();
        self.forget_rollout();
    }

    /// Drop bundle and activation progress and renegotiate the protocol from
    /// the latest version.
    pub fn forget_rollout(&mut self) {
        self.pending_bundle_version = None;
        self.acked_bundle_version = None;
        self.pending_activation_version = None;
        self.activated_version = None;
        self.rpc_version = RpcVersion::LATEST;
        self.protocol_exhausted = false;
    }

    pub fn connection_mut(&mut self) -> &mut NodeConnection {
        &mut self.connection
    }

    pub fn connection(&self) -> &NodeConnection {
        &self.connection
    }

    pub fn rpc_version(&self) -> RpcVersion {
        self.rpc_version
    }

    pub fn is_protocol_exhausted(&self) -> bool {
        self.protocol_exhausted
    }

    /// Step down to the next push protocol after a "no such method" reply.
    ///
    /// Fails with [`Error::ProtocolExhausted`] once the oldest version has
    /// been rejected; the node is then flagged and never pushed to again.
    pub fn downgrade_set_state_protocol(&mut self) -> Result<RpcVersion> {
        match self.rpc_version.set_state_fallback() {
            Some(next) => {
                warn!(node = %self.node, from = %self.rpc_version, to = %next, "Downgrading cluster state protocol");
                self.rpc_version = next;
                Ok(next)
            }
            None => {
                self.protocol_exhausted = true;
                Err(Error::ProtocolExhausted {
                    node: self.node.to_string(),
                })
            }
        }
    }

    /// Stop using explicit activation. Returns whether the version changed.
    pub fn downgrade_activation(&mut self) -> bool {
        match self.rpc_version.activation_fallback() {
            Some(next) => {
                warn!(node = %self.node, from = %self.rpc_version, to = %next, "Node does not support version activation");
                self.rpc_version = next;
                true
            }
            None => false,
        }
    }

    /// State string sent with the next poll: the last reported state, or
    /// `"unknown"` when the node is down or was never reached.
    pub fn poll_state_summary(&self) -> &str {
        match (&self.reported_state, self.presence) {
            (Some(state), RegistryPresence::Live) if !reports_down(state) => state,
            _ => "unknown",
        }
    }

    /// Fold a poll outcome into the reported state. A node that could not be
    /// reached is polled with `"unknown"` next time; other failures keep the
    /// last report.
    pub fn record_poll_reply(&mut self, reply: &GetNodeStateReply, now_ms: i64) {
        match &reply.result {
            Ok(report) => {
                self.record_reported_state(report.state.clone(), report.host_info.clone(), now_ms)
            }
            Err(e) if e.is_transport() => {
                debug!(node = %self.node, error = %e, "Node unreachable, forgetting reported state");
                self.clear_reported_state();
            }
            Err(e) => {
                debug!(node = %self.node, error = %e, "Keeping last reported state after failed poll");
            }
        }
    }

    pub fn record_reported_state(&mut self, state: String, host_info: String, now_ms: i64) {
        self.reported_state = Some(state);
        self.host_info = host_info;
        self.reported_at_ms = Some(now_ms);
    }

    pub fn clear_reported_state(&mut self) {
        self.reported_state = None;
    }

    pub fn reported_state(&self) -> Option<&str> {
        self.reported_state.as_deref()
    }

    pub fn host_info(&self) -> &str {
        &self.host_info
    }

    pub fn reported_at_ms(&self) -> Option<i64> {
        self.reported_at_ms
    }

    pub fn set_pending_bundle(&mut self, version: u32) {
        self.pending_bundle_version = Some(version);
    }

    pub fn clear_pending_bundle(&mut self) {
        self.pending_bundle_version = None;
    }

    pub fn pending_bundle_version(&self) -> Option<u32> {
        self.pending_bundle_version
    }

    pub fn record_bundle_ack(&mut self, version: u32) {
        self.pending_bundle_version = None;
        self.acked_bundle_version = Some(version);
    }

    pub fn acked_bundle_version(&self) -> Option<u32> {
        self.acked_bundle_version
    }

    pub fn set_pending_activation(&mut self, version: u32) {
        self.pending_activation_version = Some(version);
    }

    pub fn clear_pending_activation(&mut self) {
        self.pending_activation_version = None;
    }

    pub fn pending_activation_version(&self) -> Option<u32> {
        self.pending_activation_version
    }

    pub fn record_activation(&mut self, activated: u32) {
        self.pending_activation_version = None;
        self.activated_version = Some(activated);
    }

    pub fn activated_version(&self) -> Option<u32> {
        self.activated_version
    }

    /// Whether the node is known to be running `version`: activated for
    /// nodes speaking activation, acknowledged for older ones.
    pub fn is_converged_on(&self, version: u32) -> bool {
        if self.protocol_exhausted {
            return false;
        }
        if self.rpc_version.supports_activation() {
            self.activated_version == Some(version)
        } else {
            self.acked_bundle_version == Some(version)
        }
    }
}

fn reports_down(state: &str) -> bool {
    state.split_whitespace().any(|token| token == "s:d")
}
