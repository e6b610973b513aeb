//! Per bucket space derived cluster states.

use crate::host_info::ClusterStatsAggregator;
use crate::state::{
    AnnotatedClusterState, NodeState, NodeStateReason, NodeType, State, DEFAULT_SPACE,
    GLOBAL_SPACE,
};
use std::collections::BTreeMap;

/// Derives one state per configured bucket space from the baseline.
#[derive(Debug, Clone)]
pub struct BucketSpaceStateDeriver {
    spaces: Vec<String>,
    maintenance_when_pending_global_merges: bool,
}

impl BucketSpaceStateDeriver {
    pub fn new(spaces: Vec<String>, maintenance_when_pending_global_merges: bool) -> Self {
        Self {
            spaces,
            maintenance_when_pending_global_merges,
        }
    }

    pub fn derive(
        &self,
        baseline: &AnnotatedClusterState,
        stats: &ClusterStatsAggregator,
    ) -> BTreeMap<String, AnnotatedClusterState> {
        self.spaces
            .iter()
            .map(|space| (space.clone(), self.derive_space(space, baseline, stats)))
            .collect()
    }

    fn derive_space(
        &self,
        space: &str,
        baseline: &AnnotatedClusterState,
        stats: &ClusterStatsAggregator,
    ) -> AnnotatedClusterState {
        let mut derived = baseline.clone();
        if !self.maintenance_when_pending_global_merges || space != DEFAULT_SPACE {
            return derived;
        }

        let pending: Vec<_> = baseline
            .cluster_state()
            .nodes_of_type(NodeType::Storage)
            .filter(|(_, ns)| ns.state.is_up_ish())
            .filter(|(node, _)| stats.has_pending_buckets(node.index, GLOBAL_SPACE))
            .map(|(node, _)| node)
            .collect();
        for node in pending {
            derived
                .cluster_state_mut()
                .set_node_state(node, NodeState::new(State::Maintenance));
            derived.set_node_reason(node, NodeStateReason::MayHaveMergesPending);
        }
        derived
    }
}
