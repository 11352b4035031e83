//! # fleetstate
//!
//! Cluster state distribution and node reconciliation for a content-cluster
//! coordinator.
//!
//! The elected coordinator keeps every storage and distributor node informed
//! of the authoritative cluster state and keeps its own view of the fleet in
//! line with the name service.
//!
//! ## Architecture
//!
//! - **Registry**: polls the name service and merge-joins the registered
//!   nodes against the fleet, producing new/missing/moved/returning
//!   transitions
//! - **Communicator**: fire-and-forget node RPCs (state poll with jittered
//!   timeouts, bundle push with protocol fallback, version activation)
//! - **Codec**: compressed wire encoding of cluster state bundles
//! - **Broadcaster**: sequences the push-then-activate rollout and tracks
//!   convergence

pub mod broadcaster;
pub mod clock;
pub mod cluster;
pub mod codec;
pub mod communicator;
pub mod config;
pub mod registry;
pub mod rpc;
pub mod state;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::broadcaster::ClusterStateBroadcaster;
    pub use crate::clock::{Clock, ManualClock, MonotonicClock};
    pub use crate::cluster::{ClusterConfig, Fleet, Node, NodeInfo, NodeType};
    pub use crate::codec::{BinaryBundleCodec, ClusterStateBundleCodec, CompressionConfig};
    pub use crate::communicator::{
        Communicator, CommunicatorConfig, NodeReply, RequestError, RpcCommunicator, RpcVersion,
    };
    pub use crate::registry::{NodeRegistryListener, NodeRegistryReconciler, StaticNameService};
    pub use crate::rpc::{RpcTransport, TcpTransport};
    pub use crate::state::{ClusterState, ClusterStateBundle, State};
    pub use crate::{Error, Result};
}
