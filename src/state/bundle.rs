//! Baseline cluster state plus per-bucket-space derived states

use super::ClusterState;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Bucket space holding regular documents.
pub const DEFAULT_SPACE: &str = "default";
/// Bucket space holding globally replicated documents.
pub const GLOBAL_SPACE: &str = "global";

/// One baseline state and zero or more derived states keyed by bucket space,
/// versioned as a unit by the baseline version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStateBundle {
    baseline: ClusterState,
    derived: BTreeMap<String, ClusterState>,
}

impl ClusterStateBundle {
    /// Bundle with no derived states.
    pub fn of_baseline(baseline: ClusterState) -> Self {
        Self {
            baseline,
            derived: BTreeMap::new(),
        }
    }

    /// Build a bundle, rejecting derived states whose version differs from
    /// the baseline.
    pub fn new(baseline: ClusterState, derived: BTreeMap<String, ClusterState>) -> Result<Self> {
        if let Some((space, state)) = derived
            .iter()
            .find(|(_, state)| state.version() != baseline.version())
        {
            return Err(Error::InvalidClusterState(format!(
                "derived state for space '{}' has version {} but baseline has {}",
                space,
                state.version(),
                baseline.version()
            )));
        }
        Ok(Self { baseline, derived })
    }

    /// Canonical version of the bundle.
    pub fn version(&self) -> u32 {
        self.baseline.version()
    }

    pub fn baseline(&self) -> &ClusterState {
        &self.baseline
    }

    pub fn derived(&self) -> &BTreeMap<String, ClusterState> {
        &self.derived
    }

    /// Effective state for a bucket space: the derived state if present,
    /// otherwise the baseline.
    pub fn state_for_space(&self, space: &str) -> &ClusterState {
        self.derived.get(space).unwrap_or(&self.baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Node, NodeType};
    use crate::state::State;

    #[test]
    fn test_state_for_space_falls_back_to_baseline() {
        let baseline = ClusterState::new(5).with_node_count(NodeType::Storage, 2);
        let global = baseline
            .clone()
            .with_node_state(Node::storage(1), State::Maintenance);
        let bundle = ClusterStateBundle::new(
            baseline.clone(),
            BTreeMap::from([(GLOBAL_SPACE.to_string(), global.clone())]),
        )
        .unwrap();

        assert_eq!(bundle.version(), 5);
        assert_eq!(bundle.state_for_space(GLOBAL_SPACE), &global);
        assert_eq!(bundle.state_for_space(DEFAULT_SPACE), &baseline);
    }

    #[test]
    fn test_mismatched_derived_version_is_rejected() {
        let err = ClusterStateBundle::new(
            ClusterState::new(5),
            BTreeMap::from([(DEFAULT_SPACE.to_string(), ClusterState::new(4))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("default"));
    }
}
