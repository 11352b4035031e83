//! Integration tests for two-phase cluster state rollout
//!
//! Tests push-then-activate sequencing, convergence, and protocol fallback
//! driven through the broadcaster.

mod common;

use common::{address_of, communicator, no_such_method, ScriptedTransport};
use fleetstate::broadcaster::ClusterStateBroadcaster;
use fleetstate::clock::ManualClock;
use fleetstate::cluster::{ClusterConfig, Fleet, Node, NodeType};
use fleetstate::communicator::{NodeReply, RpcCommunicator, RpcVersion};
use fleetstate::registry::{NodeRegistryReconciler, NoopListener, StaticNameService};
use fleetstate::rpc::Value;
use fleetstate::state::{ClusterState, ClusterStateBundle};
use fleetstate::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Rollout {
    fleet: Fleet,
    broadcaster: ClusterStateBroadcaster,
    communicator: RpcCommunicator,
    tx: mpsc::UnboundedSender<NodeReply>,
    rx: mpsc::UnboundedReceiver<NodeReply>,
}

impl Rollout {
    fn new(transport: std::sync::Arc<ScriptedTransport>, storage: Vec<u16>) -> Self {
        let config = ClusterConfig {
            storage_nodes: storage,
            ..ClusterConfig::default()
        };
        let mut fleet = Fleet::from_config(&config);
        for node in fleet.nodes_mut() {
            let address = address_of(node.node());
            node.set_rpc_address(address);
            node.mark_live();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            fleet,
            broadcaster: ClusterStateBroadcaster::new(),
            communicator: communicator(transport),
            tx,
            rx,
        }
    }

    fn install(&mut self, version: u32) {
        let state = ClusterState::new(version).with_node_count(NodeType::Storage, 4);
        self.broadcaster
            .set_bundle(ClusterStateBundle::of_baseline(state));
    }

    async fn next(&mut self) -> NodeReply {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("reply within 5s")
            .expect("reply channel open")
    }

    /// Deliver replies until none is outstanding.
    async fn drain(&mut self, expected: usize) -> Result<(), Error> {
        let mut result = Ok(());
        for _ in 0..expected {
            match self.next().await {
                NodeReply::SetClusterState(reply) => {
                    if let Err(e) = self.broadcaster.handle_set_state_reply(
                        &mut self.fleet,
                        &self.communicator,
                        &self.tx,
                        reply,
                    ) {
                        result = Err(e);
                    }
                }
                NodeReply::Activation(reply) => {
                    self.broadcaster
                        .handle_activation_reply(&mut self.fleet, reply);
                }
                NodeReply::NodeState(_) => panic!("unexpected node state reply"),
            }
        }
        result
    }

    fn broadcast(&mut self) -> usize {
        self.broadcaster
            .broadcast(&mut self.fleet, &self.communicator, &self.tx)
    }

    fn activate(&mut self) -> usize {
        self.broadcaster
            .activate(&mut self.fleet, &self.communicator, &self.tx)
    }
}

fn activating(version: i32) -> std::sync::Arc<ScriptedTransport> {
    ScriptedTransport::new(move |_, request| {
        if request.method == "activate_cluster_state_version" {
            Some(Ok(vec![Value::Int32(version)]))
        } else {
            Some(Ok(Vec::new()))
        }
    })
}

#[tokio::test]
async fn test_push_then_activate_converges() {
    let transport = activating(7);
    let mut rollout = Rollout::new(transport.clone(), vec![0]);
    rollout.install(7);

    assert_eq!(rollout.activate(), 0, "activation waits for acknowledgement");
    assert_eq!(rollout.broadcast(), 1);
    assert_eq!(rollout.broadcast(), 0, "push already in flight");
    rollout.drain(1).await.unwrap();
    assert!(rollout.broadcaster.all_acknowledged(&rollout.fleet));
    assert!(!rollout.broadcaster.is_converged(&rollout.fleet));

    assert_eq!(rollout.activate(), 1);
    rollout.drain(1).await.unwrap();
    assert!(rollout.broadcaster.is_converged(&rollout.fleet));
    assert_eq!(
        rollout.fleet.get(&Node::storage(0)).unwrap().activated_version(),
        Some(7)
    );
    assert_eq!(
        transport.methods(),
        vec!["setdistributionstates", "activate_cluster_state_version"]
    );
}

#[tokio::test]
async fn test_stale_activation_is_not_convergence() {
    let mut rollout = Rollout::new(activating(6), vec![0]);
    rollout.install(7);

    rollout.broadcast();
    rollout.drain(1).await.unwrap();
    rollout.activate();
    rollout.drain(1).await.unwrap();

    assert!(!rollout.broadcaster.is_converged(&rollout.fleet));
    assert_eq!(
        rollout.fleet.get(&Node::storage(0)).unwrap().activated_version(),
        Some(6)
    );
}

#[tokio::test]
async fn test_new_bundle_is_pushed_again() {
    let mut rollout = Rollout::new(activating(7), vec![0, 1]);
    rollout.install(7);
    assert_eq!(rollout.broadcast(), 2);
    rollout.drain(2).await.unwrap();
    assert_eq!(rollout.broadcast(), 0, "every node acknowledged version 7");

    rollout.install(8);
    assert!(!rollout.broadcaster.all_acknowledged(&rollout.fleet));
    assert_eq!(rollout.broadcast(), 2);
}

#[tokio::test]
async fn test_stale_nodes_are_not_pushed_to() {
    let mut rollout = Rollout::new(activating(7), vec![0, 1]);
    rollout
        .fleet
        .get_mut(&Node::storage(1))
        .unwrap()
        .mark_stale(0);
    rollout.install(7);
    assert_eq!(rollout.broadcast(), 1);
    rollout.drain(1).await.unwrap();
    assert!(rollout.broadcaster.all_acknowledged(&rollout.fleet));
}

#[tokio::test]
async fn test_failed_push_is_retried_on_next_broadcast() {
    let transport = ScriptedTransport::new(|_, _| {
        Some(Err(fleetstate::rpc::RpcError::new(
            fleetstate::rpc::ErrorCode::Connection,
            "connection refused",
        )))
    });
    let mut rollout = Rollout::new(transport, vec![0]);
    rollout.install(3);
    assert_eq!(rollout.broadcast(), 1);
    rollout.drain(1).await.unwrap();
    let node = rollout.fleet.get(&Node::storage(0)).unwrap();
    assert_eq!(node.pending_bundle_version(), None);
    assert_eq!(node.acked_bundle_version(), None);
    assert_eq!(rollout.broadcast(), 1);
}

#[tokio::test]
async fn test_legacy_node_walks_down_the_ladder() {
    let transport = ScriptedTransport::new(|_, request| {
        if request.method == "setsystemstate2" {
            Some(Ok(Vec::new()))
        } else {
            Some(no_such_method())
        }
    });
    let mut rollout = Rollout::new(transport.clone(), vec![0]);
    rollout.install(5);

    rollout.broadcast();
    // Rejected push is re-sent at the next protocol version.
    rollout.drain(2).await.unwrap();

    let node = rollout.fleet.get(&Node::storage(0)).unwrap();
    assert_eq!(node.rpc_version(), RpcVersion::V2);
    assert_eq!(node.acked_bundle_version(), Some(5));
    assert_eq!(rollout.activate(), 0, "v2 nodes do not activate");
    assert!(rollout.broadcaster.is_converged(&rollout.fleet));
    assert_eq!(
        transport.methods(),
        vec!["setdistributionstates", "setsystemstate2"]
    );
}

#[tokio::test]
async fn test_node_rejecting_every_protocol_is_exhausted() {
    let transport = ScriptedTransport::new(|_, _| Some(no_such_method()));
    let mut rollout = Rollout::new(transport.clone(), vec![0]);
    rollout.install(5);

    rollout.broadcast();
    let err = rollout.drain(3).await.unwrap_err();
    assert!(matches!(err, Error::ProtocolExhausted { .. }));

    let node = rollout.fleet.get(&Node::storage(0)).unwrap();
    assert!(node.is_protocol_exhausted());
    assert_eq!(
        transport.methods(),
        vec!["setdistributionstates", "setsystemstate2", "setsystemstate"]
    );
    assert_eq!(rollout.broadcast(), 0);
    assert_eq!(rollout.fleet.stats().exhausted_nodes, 1);
}

#[tokio::test]
async fn test_activation_rejection_falls_back_to_acknowledgement() {
    let transport = ScriptedTransport::new(|_, request| {
        if request.method == "activate_cluster_state_version" {
            Some(no_such_method())
        } else {
            Some(Ok(Vec::new()))
        }
    });
    let mut rollout = Rollout::new(transport, vec![0]);
    rollout.install(11);

    rollout.broadcast();
    rollout.drain(1).await.unwrap();
    assert!(!rollout.broadcaster.is_converged(&rollout.fleet));
    assert_eq!(rollout.activate(), 1);
    rollout.drain(1).await.unwrap();

    let node = rollout.fleet.get(&Node::storage(0)).unwrap();
    assert_eq!(node.rpc_version(), RpcVersion::V3);
    assert!(rollout.broadcaster.is_converged(&rollout.fleet));
}

/// Converge storage.0 on version 7 with the name service agreeing on its
/// address.
async fn converged_on_seven() -> (
    Rollout,
    Arc<ScriptedTransport>,
    Arc<StaticNameService>,
    NodeRegistryReconciler,
) {
    let transport = activating(7);
    let mut rollout = Rollout::new(transport.clone(), vec![0]);
    let mirror = Arc::new(StaticNameService::new());
    mirror.register_node("content", Node::storage(0), &address_of(Node::storage(0)));
    let mut reconciler =
        NodeRegistryReconciler::new("content", mirror.clone(), Arc::new(ManualClock::new(0)));
    let report = reconciler
        .tick(&mut rollout.fleet, &mut NoopListener)
        .unwrap()
        .unwrap();
    assert_eq!(report.transition_count(), 0);

    rollout.install(7);
    rollout.broadcast();
    rollout.drain(1).await.unwrap();
    rollout.activate();
    rollout.drain(1).await.unwrap();
    assert!(rollout.broadcaster.is_converged(&rollout.fleet));
    (rollout, transport, mirror, reconciler)
}

#[tokio::test]
async fn test_returning_node_gets_the_bundle_again() {
    let (mut rollout, _, mirror, mut reconciler) = converged_on_seven().await;
    let node = Node::storage(0);

    mirror.unregister_node("content", node);
    let report = reconciler
        .tick(&mut rollout.fleet, &mut NoopListener)
        .unwrap()
        .unwrap();
    assert_eq!(report.missing, vec![node]);

    mirror.register_node("content", node, &address_of(node));
    let report = reconciler
        .tick(&mut rollout.fleet, &mut NoopListener)
        .unwrap()
        .unwrap();
    assert_eq!(report.returning, vec![node]);

    assert!(!rollout.broadcaster.is_converged(&rollout.fleet));
    assert_eq!(rollout.broadcast(), 1);
    rollout.drain(1).await.unwrap();
    assert_eq!(rollout.activate(), 1);
    rollout.drain(1).await.unwrap();
    assert!(rollout.broadcaster.is_converged(&rollout.fleet));
}

#[tokio::test]
async fn test_moved_node_gets_the_bundle_at_its_new_address() {
    let (mut rollout, transport, mirror, mut reconciler) = converged_on_seven().await;
    let node = Node::storage(0);

    mirror.register_node("content", node, "tcp/moved:19090");
    let report = reconciler
        .tick(&mut rollout.fleet, &mut NoopListener)
        .unwrap()
        .unwrap();
    assert_eq!(report.altered, vec![node]);

    assert!(!rollout.broadcaster.is_converged(&rollout.fleet));
    assert_eq!(rollout.broadcast(), 1);
    rollout.drain(1).await.unwrap();
    let pushes: Vec<String> = transport
        .calls()
        .into_iter()
        .filter(|call| call.request.method == "setdistributionstates")
        .map(|call| call.address)
        .collect();
    assert_eq!(pushes.last().map(String::as_str), Some("tcp/moved:19090"));
}

#[tokio::test]
async fn test_returning_node_renegotiates_protocol() {
    let (mut rollout, _, mirror, mut reconciler) = converged_on_seven().await;
    let node = Node::storage(0);
    rollout.fleet.get_mut(&node).unwrap().downgrade_set_state_protocol().unwrap();

    mirror.unregister_node("content", node);
    reconciler.tick(&mut rollout.fleet, &mut NoopListener).unwrap();
    mirror.register_node("content", node, &address_of(node));
    reconciler.tick(&mut rollout.fleet, &mut NoopListener).unwrap();

    assert_eq!(
        rollout.fleet.get(&node).unwrap().rpc_version(),
        RpcVersion::LATEST
    );
}
