//! Two-phase cluster state rollout
//!
//! The broadcaster pushes the current bundle to every live node, waits for
//! every node to acknowledge it and then activates the version on nodes that
//! support explicit activation. It only sequences requests and records
//! replies; the coordination loop decides when to call it.

use crate::cluster::{Fleet, NodeInfo};
use crate::communicator::{
    ActivateVersionReply, Communicator, NodeReply, SetClusterStateReply,
};
use crate::state::ClusterStateBundle;
use crate::{Error, Result};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Tracks rollout of one cluster state bundle at a time.
#[derive(Debug, Default)]
pub struct ClusterStateBroadcaster {
    bundle: Option<Arc<ClusterStateBundle>>,
}

impl ClusterStateBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the bundle to distribute, replacing any previous one.
    pub fn set_bundle(&mut self, bundle: ClusterStateBundle) {
        info!(version = bundle.version(), "New cluster state bundle to distribute");
        self.bundle = Some(Arc::new(bundle));
    }

    pub fn bundle(&self) -> Option<&Arc<ClusterStateBundle>> {
        self.bundle.as_ref()
    }

    pub fn current_version(&self) -> Option<u32> {
        self.bundle.as_ref().map(|b| b.version())
    }

    /// Push the current bundle to every live node that has neither
    /// acknowledged it nor a push in flight. Returns the number of pushes
    /// dispatched.
    pub fn broadcast(
        &self,
        fleet: &mut Fleet,
        communicator: &dyn Communicator,
        replies: &UnboundedSender<NodeReply>,
    ) -> usize {
        let Some(bundle) = &self.bundle else {
            return 0;
        };
        let version = bundle.version();
        let mut dispatched = 0;
        for node in fleet.nodes_mut() {
            if !needs_bundle(node, version) {
                continue;
            }
            if send_bundle(node, bundle, communicator, replies) {
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            debug!(version, nodes = dispatched, "Broadcast cluster state bundle");
        }
        dispatched
    }

    /// Record the outcome of a push.
    ///
    /// A "no such method" reply lowers the node's protocol one step and
    /// re-sends the current bundle. Once the node has rejected every known
    /// protocol the node is flagged and [`Error::ProtocolExhausted`] is
    /// returned.
    pub fn handle_set_state_reply(
        &self,
        fleet: &mut Fleet,
        communicator: &dyn Communicator,
        replies: &UnboundedSender<NodeReply>,
        reply: SetClusterStateReply,
    ) -> Result<()> {
        let Some(node) = fleet.get_mut(&reply.node) else {
            warn!(node = %reply.node, "Cluster state reply for node outside the fleet");
            return Ok(());
        };
        let version = reply.version();

        if !node.is_live() {
            debug!(node = %reply.node, version, "Dropping cluster state reply from node that left");
            return Ok(());
        }

        match reply.result {
            Ok(()) => {
                debug!(node = %reply.node, version, "Node acknowledged cluster state");
                node.record_bundle_ack(version);
                Ok(())
            }
            Err(e) if e.is_downgrade() => {
                node.clear_pending_bundle();
                // Only the first rejection of a given protocol steps down.
                if node.rpc_version() == reply.rpc_version {
                    match node.downgrade_set_state_protocol() {
                        Ok(next) => {
                            counter!("fleetstate_protocol_downgrades_total", "to" => next.to_string())
                                .increment(1);
                        }
                        Err(e) => {
                            error!(node = %reply.node, error = %e, "Giving up on node, no common cluster state protocol");
                            return Err(e);
                        }
                    }
                }
                if let Some(bundle) = &self.bundle {
                    send_bundle(node, bundle, communicator, replies);
                }
                Ok(())
            }
            Err(e) => {
                warn!(node = %reply.node, version, error = %e, "Failed to send cluster state");
                node.clear_pending_bundle();
                Ok(())
            }
        }
    }

    /// Whether every live node has acknowledged the current version.
    pub fn all_acknowledged(&self, fleet: &Fleet) -> bool {
        let Some(version) = self.current_version() else {
            return false;
        };
        fleet
            .live_nodes()
            .filter(|n| !n.is_protocol_exhausted())
            .all(|n| n.acked_bundle_version() == Some(version))
    }

    /// Activate the current version on every live node that supports
    /// activation, once every live node has acknowledged it. Returns the
    /// number of activations dispatched.
    pub fn activate(
        &self,
        fleet: &mut Fleet,
        communicator: &dyn Communicator,
        replies: &UnboundedSender<NodeReply>,
    ) -> usize {
        let Some(version) = self.current_version() else {
            return 0;
        };
        if !self.all_acknowledged(fleet) {
            return 0;
        }
        let mut dispatched = 0;
        for node in fleet.nodes_mut() {
            if !node.is_live()
                || node.is_protocol_exhausted()
                || !node.rpc_version().supports_activation()
                || node.activated_version() == Some(version)
                || node.pending_activation_version().is_some()
            {
                continue;
            }
            match communicator.activate_cluster_state_version(node, version, Box::new(replies.clone())) {
                Ok(()) => {
                    node.set_pending_activation(version);
                    dispatched += 1;
                }
                Err(e) => warn!(node = %node.node(), version, error = %e, "Could not dispatch activation"),
            }
        }
        dispatched
    }

    /// Record the outcome of an activation. A node activating another
    /// version than requested is not converged.
    pub fn handle_activation_reply(&self, fleet: &mut Fleet, reply: ActivateVersionReply) {
        let Some(node) = fleet.get_mut(&reply.node) else {
            warn!(node = %reply.node, "Activation reply for node outside the fleet");
            return;
        };
        if !node.is_live() {
            debug!(node = %reply.node, version = reply.version, "Dropping activation reply from node that left");
            return;
        }
        match reply.result {
            Ok(activated) => {
                if activated != reply.version {
                    warn!(
                        node = %reply.node,
                        requested = reply.version,
                        activated,
                        "Node activated a different cluster state version"
                    );
                }
                node.record_activation(activated);
            }
            Err(e) if e.is_downgrade() => {
                node.clear_pending_activation();
                node.downgrade_activation();
            }
            Err(e) => {
                warn!(node = %reply.node, version = reply.version, error = %e, "Failed to activate cluster state");
                node.clear_pending_activation();
            }
        }
    }

    /// Every live node runs the current version.
    pub fn is_converged(&self, fleet: &Fleet) -> bool {
        let Some(version) = self.current_version() else {
            return false;
        };
        fleet
            .live_nodes()
            .filter(|n| !n.is_protocol_exhausted())
            .all(|n| n.is_converged_on(version))
    }
}

fn needs_bundle(node: &NodeInfo, version: u32) -> bool {
    node.is_live()
        && node.rpc_address().is_some()
        && !node.is_protocol_exhausted()
        && node.acked_bundle_version() != Some(version)
        && node.pending_bundle_version().is_none()
}

fn send_bundle(
    node: &mut NodeInfo,
    bundle: &Arc<ClusterStateBundle>,
    communicator: &dyn Communicator,
    replies: &UnboundedSender<NodeReply>,
) -> bool {
    match communicator.set_cluster_state_bundle(node, bundle.clone(), Box::new(replies.clone())) {
        Ok(()) => {
            node.set_pending_bundle(bundle.version());
            true
        }
        Err(Error::ProtocolExhausted { .. }) => false,
        Err(e) => {
            warn!(node = %node.node(), version = bundle.version(), error = %e, "Could not dispatch cluster state");
            false
        }
    }
}
