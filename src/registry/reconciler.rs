//! Reconciliation of fleet membership against the name service

use super::address::{default_service_path, default_service_pattern, node_pattern, parse_node_path};
use super::listener::NodeRegistryListener;
use super::mirror::NameServiceMirror;
use crate::clock::Clock;
use crate::cluster::{Fleet, Node, NodeType};
use crate::Result;
use metrics::counter;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Classified difference between the previous and the fresh membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    New {
        node: Node,
        address: String,
    },
    Missing {
        node: Node,
    },
    AlteredAddress {
        node: Node,
        previous: String,
        address: String,
    },
    Returning {
        node: Node,
    },
}

/// Merge-join two membership lists sorted by node identity.
///
/// `previous` holds `(node, address, live)` for every node with a recorded
/// address; `fresh` holds `(node, address)` for every fully registered
/// node. Previously stale nodes that are still absent produce nothing.
pub fn diff_membership(
    previous: &[(Node, String, bool)],
    fresh: &[(Node, String)],
) -> Vec<MembershipChange> {
    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    loop {
        match (previous.get(i), fresh.get(j)) {
            (None, None) => break,
            (Some((node, _, live)), None) => {
                if *live {
                    changes.push(MembershipChange::Missing { node: *node });
                }
                i += 1;
            }
            (None, Some((node, address))) => {
                changes.push(MembershipChange::New {
                    node: *node,
                    address: address.clone(),
                });
                j += 1;
            }
            (Some((old_node, old_address, live)), Some((new_node, new_address))) => {
                match old_node.cmp(new_node) {
                    Ordering::Less => {
                        if *live {
                            changes.push(MembershipChange::Missing { node: *old_node });
                        }
                        i += 1;
                    }
                    Ordering::Greater => {
                        changes.push(MembershipChange::New {
                            node: *new_node,
                            address: new_address.clone(),
                        });
                        j += 1;
                    }
                    Ordering::Equal => {
                        if old_address != new_address {
                            changes.push(MembershipChange::AlteredAddress {
                                node: *new_node,
                                previous: old_address.clone(),
                                address: new_address.clone(),
                            });
                        } else if !*live {
                            changes.push(MembershipChange::Returning { node: *new_node });
                        }
                        i += 1;
                        j += 1;
                    }
                }
            }
        }
    }
    changes
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub generation: u64,
    pub new: Vec<Node>,
    pub missing: Vec<Node>,
    pub altered: Vec<Node>,
    pub returning: Vec<Node>,
    /// Live in the name service but still marked stale after the pass
    pub healed: Vec<Node>,
    /// Registered but not part of the configured fleet
    pub skipped_unconfigured: Vec<Node>,
}

impl ReconcileReport {
    pub fn transition_count(&self) -> usize {
        self.new.len() + self.missing.len() + self.altered.len() + self.returning.len()
    }
}

/// Keeps a [`Fleet`]'s addresses and liveness in line with the name service.
pub struct NodeRegistryReconciler {
    cluster_name: String,
    mirror: Arc<dyn NameServiceMirror>,
    clock: Arc<dyn Clock>,
    committed_generation: Option<u64>,
    force_next: bool,
}

impl NodeRegistryReconciler {
    pub fn new(
        cluster_name: impl Into<String>,
        mirror: Arc<dyn NameServiceMirror>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            mirror,
            clock,
            committed_generation: None,
            force_next: true,
        }
    }

    pub fn committed_generation(&self) -> Option<u64> {
        self.committed_generation
    }

    /// Forget the committed generation so the next tick runs unconditionally,
    /// e.g. after reconnecting to the name service.
    pub fn reset(&mut self) {
        self.committed_generation = None;
        self.force_next = true;
    }

    /// Run one reconciliation pass.
    ///
    /// Returns `Ok(None)` when the pass was skipped because the mirror is not
    /// ready or its generation is unchanged. A failed lookup leaves both the
    /// fleet and the committed generation untouched.
    pub fn tick(
        &mut self,
        fleet: &mut Fleet,
        listener: &mut dyn NodeRegistryListener,
    ) -> Result<Option<ReconcileReport>> {
        if !self.mirror.ready() {
            debug!(cluster = %self.cluster_name, "Name service mirror not ready");
            self.force_next = true;
            return Ok(None);
        }

        let generation = self.mirror.generation();
        if !self.force_next && self.committed_generation == Some(generation) {
            return Ok(None);
        }

        let fresh = match self.fetch_registered_nodes() {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(cluster = %self.cluster_name, generation, error = %e, "Name service lookup failed");
                counter!("fleetstate_registry_lookup_failures_total").increment(1);
                return Err(e);
            }
        };

        let previous = fleet.addressed_nodes();
        let changes = diff_membership(&previous, &fresh);
        let mut report = ReconcileReport {
            generation,
            ..ReconcileReport::default()
        };
        let now = self.clock.now_millis();

        for change in changes {
            match change {
                MembershipChange::New { node, address } => {
                    let Some(info) = fleet.get_mut(&node) else {
                        debug!(node = %node, address = %address, "Ignoring registered node outside the configured fleet");
                        report.skipped_unconfigured.push(node);
                        continue;
                    };
                    info!(node = %node, address = %address, "Node registered");
                    info.set_rpc_address(address);
                    info.mark_live();
                    listener.handle_new_node(info);
                    report.new.push(node);
                }
                MembershipChange::Missing { node } => {
                    if let Some(info) = fleet.get_mut(&node) {
                        info!(node = %node, "Node disappeared from name service");
                        info.mark_stale(now);
                        info.connection_mut().abort_pending_poll();
                        listener.handle_missing_node(info);
                        report.missing.push(node);
                    }
                }
                MembershipChange::AlteredAddress {
                    node,
                    previous,
                    address,
                } => {
                    if let Some(info) = fleet.get_mut(&node) {
                        info.set_rpc_address(address);
                        info.mark_live();
                        listener.handle_node_address_changed(info, &previous);
                        report.altered.push(node);
                    }
                }
                MembershipChange::Returning { node } => {
                    if let Some(info) = fleet.get_mut(&node) {
                        info!(node = %node, "Node returned to name service");
                        info.mark_live();
                        info.forget_rollout();
                        info.connection_mut().abort_pending_poll();
                        listener.handle_returning_node(info);
                        report.returning.push(node);
                    }
                }
            }
        }

        for (node, _) in &fresh {
            if let Some(info) = fleet.get_mut(node) {
                if info.is_stale() {
                    warn!(node = %node, "Node is registered but was still marked stale, correcting");
                    info.mark_live();
                    report.healed.push(*node);
                }
            }
        }

        counter!("fleetstate_registry_transitions_total", "kind" => "new")
            .increment(report.new.len() as u64);
        counter!("fleetstate_registry_transitions_total", "kind" => "missing")
            .increment(report.missing.len() as u64);
        counter!("fleetstate_registry_transitions_total", "kind" => "altered")
            .increment(report.altered.len() as u64);
        counter!("fleetstate_registry_transitions_total", "kind" => "returning")
            .increment(report.returning.len() as u64);

        fleet.set_generation(generation);
        self.committed_generation = Some(generation);
        self.force_next = false;
        debug!(
            generation,
            transitions = report.transition_count(),
            "Reconciled fleet membership"
        );
        Ok(Some(report))
    }

    /// Registered nodes of this cluster, sorted by identity. A node counts
    /// only once both its base entry and its `default` sibling exist.
    fn fetch_registered_nodes(&self) -> Result<Vec<(Node, String)>> {
        let mut fresh = BTreeMap::new();
        for node_type in NodeType::ALL {
            let bases = self
                .mirror
                .lookup(&node_pattern(&self.cluster_name, node_type))?;
            let defaults: HashSet<String> = self
                .mirror
                .lookup(&default_service_pattern(&self.cluster_name, node_type))?
                .into_iter()
                .map(|entry| entry.name)
                .collect();

            for entry in bases {
                let Some(node) = parse_node_path(&self.cluster_name, &entry.name) else {
                    debug!(name = %entry.name, "Skipping unparseable name service entry");
                    continue;
                };
                if !defaults.contains(&default_service_path(&entry.name)) {
                    debug!(node = %node, "Node is not fully registered yet");
                    continue;
                }
                fresh.insert(node, entry.spec);
            }
        }
        Ok(fresh.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(node: Node, address: &str, live: bool) -> (Node, String, bool) {
        (node, address.to_string(), live)
    }

    fn seen(node: Node, address: &str) -> (Node, String) {
        (node, address.to_string())
    }

    #[test]
    fn test_diff_classifies_each_kind() {
        let (a, b, c, d) = (
            Node::storage(0),
            Node::storage(1),
            Node::storage(2),
            Node::distributor(0),
        );
        let previous = vec![
            known(a, "tcp/a:1", true),
            known(b, "tcp/b:1", true),
            known(c, "tcp/c:1", true),
        ];
        let fresh = vec![seen(b, "tcp/b:2"), seen(c, "tcp/c:1"), seen(d, "tcp/d:1")];

        assert_eq!(
            diff_membership(&previous, &fresh),
            vec![
                MembershipChange::Missing { node: a },
                MembershipChange::AlteredAddress {
                    node: b,
                    previous: "tcp/b:1".to_string(),
                    address: "tcp/b:2".to_string(),
                },
                MembershipChange::New {
                    node: d,
                    address: "tcp/d:1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_diff_stale_nodes() {
        let a = Node::storage(0);
        let b = Node::storage(1);
        let previous = vec![known(a, "tcp/a:1", false), known(b, "tcp/b:1", false)];
        let fresh = vec![seen(a, "tcp/a:1")];
        assert_eq!(
            diff_membership(&previous, &fresh),
            vec![MembershipChange::Returning { node: a }]
        );
    }

    #[test]
    fn test_diff_empty_inputs() {
        assert!(diff_membership(&[], &[]).is_empty());
        let fresh = vec![seen(Node::distributor(4), "tcp/x:1")];
        assert_eq!(diff_membership(&[], &fresh).len(), 1);
    }
}
