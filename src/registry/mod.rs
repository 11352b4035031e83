//! Fleet membership from the name service
//!
//! Nodes register `storage/cluster.<name>/<type>/<index>` together with a
//! `.../default` sibling. The reconciler polls a [`NameServiceMirror`],
//! diffs the registrations against the fleet and applies the resulting
//! transitions, notifying a [`NodeRegistryListener`].

pub mod address;
pub mod listener;
pub mod mirror;
pub mod reconciler;

pub use listener::{NodeRegistryListener, NoopListener};
pub use mirror::{NameServiceMirror, ServiceEntry, StaticNameService};
pub use reconciler::{diff_membership, MembershipChange, NodeRegistryReconciler, ReconcileReport};
