//! Cluster state values distributed to the fleet

mod bundle;
mod cluster_state;

pub use bundle::{ClusterStateBundle, DEFAULT_SPACE, GLOBAL_SPACE};
pub use cluster_state::{ClusterState, State};
