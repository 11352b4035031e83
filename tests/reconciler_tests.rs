//! Integration tests for name-service reconciliation
//!
//! Tests merge-join classification, idempotence, soft failure, readiness and
//! the treatment of unconfigured or half-registered nodes.

use fleetstate::clock::ManualClock;
use fleetstate::cluster::{ClusterConfig, Fleet, Node, NodeInfo, RegistryPresence};
use fleetstate::registry::{
    NameServiceMirror, NodeRegistryListener, NodeRegistryReconciler, StaticNameService,
};
use std::io::Write;
use std::sync::Arc;

const CLUSTER: &str = "music";

#[derive(Debug, Default)]
struct RecordingListener {
    events: Vec<String>,
}

impl NodeRegistryListener for RecordingListener {
    fn handle_new_node(&mut self, node: &NodeInfo) {
        self.events.push(format!("new {}", node.node()));
    }

    fn handle_missing_node(&mut self, node: &NodeInfo) {
        self.events.push(format!("missing {}", node.node()));
    }

    fn handle_node_address_changed(&mut self, node: &NodeInfo, previous_address: &str) {
        self.events.push(format!(
            "moved {} {} -> {}",
            node.node(),
            previous_address,
            node.rpc_address().unwrap_or("-")
        ));
    }

    fn handle_returning_node(&mut self, node: &NodeInfo) {
        self.events.push(format!("returning {}", node.node()));
    }
}

struct Harness {
    mirror: Arc<StaticNameService>,
    clock: Arc<ManualClock>,
    fleet: Fleet,
    reconciler: NodeRegistryReconciler,
    listener: RecordingListener,
}

impl Harness {
    fn new(storage: Vec<u16>, distributors: Vec<u16>) -> Self {
        let mirror = Arc::new(StaticNameService::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let config = ClusterConfig {
            cluster_name: CLUSTER.to_string(),
            storage_nodes: storage,
            distributor_nodes: distributors,
            ..ClusterConfig::default()
        };
        let reconciler = NodeRegistryReconciler::new(CLUSTER, mirror.clone(), clock.clone());
        Self {
            mirror,
            clock,
            fleet: Fleet::from_config(&config),
            reconciler,
            listener: RecordingListener::default(),
        }
    }

    fn tick(&mut self) -> Option<fleetstate::registry::ReconcileReport> {
        self.reconciler
            .tick(&mut self.fleet, &mut self.listener)
            .expect("tick succeeds")
    }

    fn node(&self, node: Node) -> &NodeInfo {
        self.fleet.get(&node).expect("configured node")
    }
}

#[test]
fn test_merge_join_classifies_missing_altered_and_new() {
    let (a, b, c, d) = (
        Node::storage(0),
        Node::storage(1),
        Node::storage(2),
        Node::distributor(0),
    );
    let mut h = Harness::new(vec![0, 1, 2], vec![0]);
    h.mirror.register_node(CLUSTER, a, "tcp/a:1");
    h.mirror.register_node(CLUSTER, b, "tcp/b:1");
    h.mirror.register_node(CLUSTER, c, "tcp/c:1");
    let first = h.tick().unwrap();
    assert_eq!(first.new, vec![a, b, c]);
    h.listener.events.clear();

    h.mirror.unregister_node(CLUSTER, a);
    h.mirror.register_node(CLUSTER, b, "tcp/b:2");
    h.mirror.register_node(CLUSTER, d, "tcp/d:1");
    let report = h.tick().unwrap();

    assert_eq!(report.missing, vec![a]);
    assert_eq!(report.altered, vec![b]);
    assert_eq!(report.new, vec![d]);
    assert!(report.returning.is_empty());
    assert!(report.healed.is_empty());
    assert_eq!(
        h.listener.events,
        vec![
            "missing storage.0".to_string(),
            "moved storage.1 tcp/b:1 -> tcp/b:2".to_string(),
            "new distributor.0".to_string(),
        ]
    );

    assert_eq!(h.node(a).presence(), RegistryPresence::Stale { since_ms: 10_000 });
    assert_eq!(h.node(a).rpc_address(), Some("tcp/a:1"));
    assert_eq!(h.node(b).rpc_address(), Some("tcp/b:2"));
    assert!(h.node(c).is_live());
    assert!(h.node(d).is_live());
}

#[test]
fn test_unchanged_generation_performs_no_work() {
    let mut h = Harness::new(vec![0], vec![]);
    h.mirror.register_node(CLUSTER, Node::storage(0), "tcp/a:1");
    assert!(h.tick().is_some());
    let committed = h.reconciler.committed_generation();
    assert_eq!(committed, Some(h.mirror.generation()));
    assert_eq!(h.fleet.generation(), h.mirror.generation());

    let events_before = h.listener.events.len();
    assert!(h.tick().is_none());
    assert_eq!(h.listener.events.len(), events_before);
    assert_eq!(h.reconciler.committed_generation(), committed);
}

#[test]
fn test_first_tick_runs_even_without_changes() {
    let mut h = Harness::new(vec![0], vec![]);
    let report = h.tick().expect("first tick always runs");
    assert_eq!(report.transition_count(), 0);
    assert!(h.tick().is_none());

    h.reconciler.reset();
    assert!(h.tick().is_some(), "tick after reset always runs");
}

#[test]
fn test_failed_lookup_leaves_snapshot_untouched() {
    let mut h = Harness::new(vec![0], vec![]);
    h.mirror.register_node(CLUSTER, Node::storage(0), "tcp/a:1");
    h.tick().unwrap();
    let committed = h.reconciler.committed_generation();

    h.mirror.unregister_node(CLUSTER, Node::storage(0));
    h.mirror.fail_lookups(true);
    assert!(h.reconciler.tick(&mut h.fleet, &mut h.listener).is_err());
    assert_eq!(h.reconciler.committed_generation(), committed);
    assert!(h.node(Node::storage(0)).is_live());

    h.mirror.fail_lookups(false);
    let report = h.tick().expect("retried after failure");
    assert_eq!(report.missing, vec![Node::storage(0)]);
}

#[test]
fn test_unconfigured_nodes_are_skipped() {
    let mut h = Harness::new(vec![0], vec![]);
    h.mirror.register_node(CLUSTER, Node::storage(0), "tcp/a:1");
    h.mirror.register_node(CLUSTER, Node::storage(5), "tcp/x:1");
    let report = h.tick().unwrap();
    assert_eq!(report.new, vec![Node::storage(0)]);
    assert_eq!(report.skipped_unconfigured, vec![Node::storage(5)]);
    assert!(h.fleet.get(&Node::storage(5)).is_none());
}

#[test]
fn test_node_without_default_sibling_is_not_registered() {
    let mut h = Harness::new(vec![0], vec![]);
    h.mirror
        .register("storage/cluster.music/storage/0", "tcp/a:1");
    let report = h.tick().unwrap();
    assert!(report.new.is_empty());

    h.mirror
        .register("storage/cluster.music/storage/0/default", "");
    let report = h.tick().unwrap();
    assert_eq!(report.new, vec![Node::storage(0)]);
    assert_eq!(h.node(Node::storage(0)).rpc_address(), Some("tcp/a:1"));
}

#[test]
fn test_other_clusters_are_ignored() {
    let mut h = Harness::new(vec![0], vec![]);
    h.mirror.register_node("books", Node::storage(0), "tcp/books:1");
    let report = h.tick().unwrap();
    assert!(report.new.is_empty());
    assert!(h.node(Node::storage(0)).rpc_address().is_none());
}

#[test]
fn test_returning_node_aborts_in_flight_poll() {
    let mut h = Harness::new(vec![0], vec![]);
    let node = Node::storage(0);
    h.mirror.register_node(CLUSTER, node, "tcp/a:1");
    h.tick().unwrap();

    h.mirror.unregister_node(CLUSTER, node);
    h.clock.advance_millis(500);
    let report = h.tick().unwrap();
    assert_eq!(report.missing, vec![node]);
    assert!(h.node(node).is_stale());

    let token = h
        .fleet
        .get_mut(&node)
        .unwrap()
        .connection_mut()
        .begin_poll();
    h.mirror.register_node(CLUSTER, node, "tcp/a:1");
    let report = h.tick().unwrap();
    assert_eq!(report.returning, vec![node]);
    assert!(token.is_cancelled());
    assert!(h.node(node).is_live());
    assert_eq!(h.listener.events.last().unwrap(), "returning storage.0");
}

#[test]
fn test_missing_node_aborts_in_flight_poll() {
    let mut h = Harness::new(vec![0], vec![]);
    let node = Node::storage(0);
    h.mirror.register_node(CLUSTER, node, "tcp/a:1");
    h.tick().unwrap();
    let token = h
        .fleet
        .get_mut(&node)
        .unwrap()
        .connection_mut()
        .begin_poll();

    h.mirror.unregister_node(CLUSTER, node);
    h.tick().unwrap();
    assert!(token.is_cancelled());
}

#[test]
fn test_stale_node_still_registered_returns() {
    let mut h = Harness::new(vec![0], vec![]);
    let node = Node::storage(0);
    h.mirror.register_node(CLUSTER, node, "tcp/a:1");
    h.tick().unwrap();

    // Marked stale elsewhere while the name service still lists it.
    h.fleet.get_mut(&node).unwrap().mark_stale(1);
    h.mirror.register("unrelated/entry", "x");
    let report = h.tick().unwrap();
    assert_eq!(report.returning, vec![node]);
    assert!(report.healed.is_empty());
    assert!(h.node(node).is_live());
}

#[test]
fn test_not_ready_mirror_skips_and_forces_next_tick() {
    let mut h = Harness::new(vec![0], vec![]);
    h.mirror.register_node(CLUSTER, Node::storage(0), "tcp/a:1");
    h.tick().unwrap();

    h.mirror.set_ready(false);
    assert!(h.tick().is_none());
    h.mirror.set_ready(true);
    let report = h.tick().expect("tick after reconnect runs");
    assert_eq!(report.transition_count(), 0);
}

#[test]
fn test_registrations_loaded_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"entries": [
            {{"name": "storage/cluster.music/distributor/1", "spec": "tcp/d1:19100"}},
            {{"name": "storage/cluster.music/distributor/1/default", "spec": ""}}
        ]}}"#
    )
    .unwrap();

    let mirror = Arc::new(StaticNameService::from_json_file(file.path()).unwrap());
    let config = ClusterConfig {
        cluster_name: CLUSTER.to_string(),
        distributor_nodes: vec![1],
        ..ClusterConfig::default()
    };
    let mut fleet = Fleet::from_config(&config);
    let mut reconciler =
        NodeRegistryReconciler::new(CLUSTER, mirror, Arc::new(ManualClock::new(0)));
    let mut listener = RecordingListener::default();
    let report = reconciler.tick(&mut fleet, &mut listener).unwrap().unwrap();
    assert_eq!(report.new, vec![Node::distributor(1)]);
    assert_eq!(
        fleet.get(&Node::distributor(1)).unwrap().rpc_address(),
        Some("tcp/d1:19100")
    );
}
