//! fleetstate probe
//!
//! Operator tool issuing node-state polls, cluster state pushes and version
//! activations against a single node, or watching name-service membership.

use fleetstate::clock::{Clock, MonotonicClock};
use fleetstate::cluster::{Fleet, Node, NodeInfo, NodeType};
use fleetstate::codec::BinaryBundleCodec;
use fleetstate::communicator::{Communicator, RpcCommunicator};
use fleetstate::config::ComponentFactory;
use fleetstate::registry::{NodeRegistryReconciler, NoopListener};
use fleetstate::state::{ClusterState, ClusterStateBundle};
use fleetstate::telemetry::Telemetry;
use fleetstate::Error;

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// fleetstate probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level
    #[arg(long, env = "FLEETSTATE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll a node for its current state
    Poll {
        #[command(flatten)]
        target: Target,
    },
    /// Push a cluster state to a node, falling back to older protocols
    Push {
        #[command(flatten)]
        target: Target,

        /// Baseline cluster state, e.g. "version:7 distributor:2 storage:2"
        #[arg(long)]
        state: String,

        /// Derived state for a bucket space, as <space>=<state>
        #[arg(long = "space")]
        spaces: Vec<String>,
    },
    /// Activate a previously pushed version
    Activate {
        #[command(flatten)]
        target: Target,

        #[arg(long)]
        version: u32,
    },
    /// Reconcile configured membership against the name service until stopped
    Watch {
        /// Seconds between reconciliation ticks
        #[arg(long, env = "FLEETSTATE_WATCH_INTERVAL_SECS", default_value = "5")]
        interval_secs: u64,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Node RPC address, tcp/<host>:<port>
    #[arg(long, env = "FLEETSTATE_NODE_ADDRESS")]
    address: String,

    /// Node type: storage or distributor
    #[arg(long, default_value = "storage")]
    node_type: NodeType,

    /// Node index
    #[arg(long, default_value = "0")]
    index: u16,
}

impl Target {
    fn node_info(&self) -> NodeInfo {
        let mut info = NodeInfo::new(Node::new(self.node_type, self.index));
        info.set_rpc_address(self.address.clone());
        info.mark_live();
        info
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _telemetry = Telemetry::init_for_component("fleetstate-probe", &args.log_level)?;

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let communicator = RpcCommunicator::new(
        tokio::runtime::Handle::current(),
        ComponentFactory::create_transport()?,
        clock.clone(),
        BinaryBundleCodec::default(),
        ComponentFactory::communicator_config()?,
    )?;

    match args.command {
        Command::Poll { target } => poll(&communicator, clock.as_ref(), target).await,
        Command::Push {
            target,
            state,
            spaces,
        } => push(&communicator, target, &state, &spaces).await,
        Command::Activate { target, version } => activate(&communicator, target, version).await,
        Command::Watch { interval_secs } => watch(clock, interval_secs).await,
    }
}

async fn poll(
    communicator: &RpcCommunicator,
    clock: &dyn Clock,
    target: Target,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut node = target.node_info();
    let (tx, rx) = oneshot::channel();
    communicator.get_node_state(&mut node, Box::new(tx))?;
    let reply = rx.await?;
    node.record_poll_reply(&reply, clock.now_millis());
    match reply.result {
        Ok(report) => {
            info!(
                node = %reply.node,
                state = %report.state,
                host_info = %report.host_info,
                next_poll_state = node.poll_state_summary(),
                "Node state"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn push(
    communicator: &RpcCommunicator,
    target: Target,
    state: &str,
    spaces: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let baseline = ClusterState::parse(state)?;
    let mut derived = BTreeMap::new();
    for space in spaces {
        let (name, text) = space
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("--space '{}' is not <space>=<state>", space)))?;
        derived.insert(name.to_string(), ClusterState::parse(text)?);
    }
    let bundle = Arc::new(ClusterStateBundle::new(baseline, derived)?);

    let mut node = target.node_info();
    loop {
        let (tx, rx) = oneshot::channel();
        communicator.set_cluster_state_bundle(&mut node, bundle.clone(), Box::new(tx))?;
        let reply = rx.await?;
        match reply.result {
            Ok(()) => {
                info!(node = %reply.node, version = bundle.version(), protocol = %reply.rpc_version, "Cluster state acknowledged");
                return Ok(());
            }
            Err(e) if e.is_downgrade() => {
                warn!(node = %reply.node, protocol = %reply.rpc_version, "Node rejected protocol, falling back");
                node.downgrade_set_state_protocol()?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn activate(
    communicator: &RpcCommunicator,
    target: Target,
    version: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut node = target.node_info();
    let (tx, rx) = oneshot::channel();
    communicator.activate_cluster_state_version(&mut node, version, Box::new(tx))?;
    let reply = rx.await?;
    match reply.result {
        Ok(activated) if activated == version => {
            info!(node = %reply.node, version, "Version activated");
            Ok(())
        }
        Ok(activated) => {
            error!(node = %reply.node, requested = version, activated, "Node activated a different version");
            Err(Error::Internal(format!(
                "requested version {} but node activated {}",
                version, activated
            ))
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(clock: Arc<dyn Clock>, interval_secs: u64) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = ComponentFactory::cluster_config()?;
    let mirror = ComponentFactory::create_name_service()?;
    let mut fleet = Fleet::from_config(&cluster);
    let mut reconciler = NodeRegistryReconciler::new(cluster.cluster_name.clone(), mirror, clock);
    let mut listener = NoopListener;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    info!(cluster = %cluster.cluster_name, nodes = fleet.len(), "Watching fleet membership");
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                match reconciler.tick(&mut fleet, &mut listener) {
                    Ok(Some(report)) => {
                        let stats = fleet.stats();
                        info!(
                            generation = report.generation,
                            new = report.new.len(),
                            missing = report.missing.len(),
                            altered = report.altered.len(),
                            returning = report.returning.len(),
                            live = stats.live_nodes,
                            stale = stats.stale_nodes,
                            "Membership reconciled"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Reconciliation failed, retrying next tick"),
                }
            }
        }
    }

    info!("Probe shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
