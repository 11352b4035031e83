//! Membership transition callbacks

use crate::cluster::NodeInfo;

/// Notified once per applied membership transition.
pub trait NodeRegistryListener: Send {
    fn handle_new_node(&mut self, node: &NodeInfo);

    fn handle_missing_node(&mut self, node: &NodeInfo);

    fn handle_node_address_changed(&mut self, node: &NodeInfo, previous_address: &str);

    /// The node re-registered at its old address, e.g. after a restart.
    fn handle_returning_node(&mut self, node: &NodeInfo);
}

/// Listener ignoring every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl NodeRegistryListener for NoopListener {
    fn handle_new_node(&mut self, _node: &NodeInfo) {}

    fn handle_missing_node(&mut self, _node: &NodeInfo) {}

    fn handle_node_address_changed(&mut self, _node: &NodeInfo, _previous_address: &str) {}

    fn handle_returning_node(&mut self, _node: &NodeInfo) {}
}
