//! Cluster state generation.
//!
//! [`ClusterStateGenerator::generate`] is a pure function from the per-node
//! runtime records of a [`ContentCluster`] plus [`Params`] to an
//! [`AnnotatedClusterState`]. Group takedown ([`group_availability`]) runs
//! before the cluster-wide availability check, feed blocking
//! ([`resource_exhaustion`]) and bucket space derivation ([`bucket_space`])
//! are applied by the caller on top of the generated baseline.

pub mod bucket_space;
pub mod group_availability;
pub mod resource_exhaustion;

pub use bucket_space::BucketSpaceStateDeriver;
pub use group_availability::{GroupAvailabilityCalculator, GroupTakedown};
pub use resource_exhaustion::{ResourceExhaustionCalculator, MAX_EXHAUSTION_DESCRIPTIONS};

use crate::clock::TimestampMs;
use crate::config::GeneratorConfig;
use crate::state::{
    AnnotatedClusterState, ClusterState, ClusterStateReason, Node, NodeIndex, NodeState,
    NodeStateReason, NodeType, State, LISTING_BUCKETS_INIT_PROGRESS_LIMIT,
};
use crate::topology::{ContentCluster, NodeInfo};
use std::collections::{BTreeMap, BTreeSet};

/// Everything besides the node records that generation depends on.
#[derive(Debug, Clone)]
pub struct Params {
    pub config: GeneratorConfig,
    pub current_time_ms: TimestampMs,
    /// Lowest distribution bit count ever published.
    pub lowest_observed_distribution_bits: u16,
}

impl Params {
    pub fn new(config: GeneratorConfig) -> Self {
        let lowest_observed_distribution_bits = config.ideal_distribution_bits;
        Self {
            config,
            current_time_ms: 0,
            lowest_observed_distribution_bits,
        }
    }

    pub fn at_time(mut self, now_ms: TimestampMs) -> Self {
        self.current_time_ms = now_ms;
        self
    }

    pub fn with_lowest_observed_distribution_bits(mut self, bits: u16) -> Self {
        self.lowest_observed_distribution_bits = bits;
        self
    }

    fn transition_time_ms(&self, node_type: NodeType) -> u64 {
        self.config.transition_time(node_type).as_millis() as u64
    }

    fn max_init_progress_time_ms(&self) -> u64 {
        self.config.max_init_progress_time.as_millis() as u64
    }
}

pub struct ClusterStateGenerator;

impl ClusterStateGenerator {
    pub fn generate(cluster: &ContentCluster, params: &Params) -> AnnotatedClusterState {
        let mut state = ClusterState::empty();
        let mut node_reasons = BTreeMap::new();

        for info in cluster.node_infos() {
            let (node_state, reason) = effective_node_state(info, params);
            state.set_node_state(info.node(), node_state);
            if let Some(reason) = reason {
                node_reasons.insert(info.node(), reason);
            }
        }

        take_down_groups_with_too_low_availability(cluster, params, &mut state, &mut node_reasons);

        state.set_distribution_bits(infer_distribution_bits(cluster, &state, params));

        let cluster_reason = cluster_down_reason(cluster, &state, &params.config);
        if cluster_reason.is_some() {
            state.set_cluster_state(State::Down);
        }

        AnnotatedClusterState::new(state, cluster_reason, node_reasons)
    }
}

/// Resolve one node's published state from its reported and wanted states and timers.
pub fn effective_node_state(info: &NodeInfo, params: &Params) -> (NodeState, Option<NodeStateReason>) {
    let reported = &info.reported_state;
    let wanted = info.effective_wanted_state();
    let now = params.current_time_ms;

    let mut state = baseline_from_reported(info);
    let mut reason = None;

    if info.is_storage()
        && reported.state == State::Initializing
        && reported.init_progress <= LISTING_BUCKETS_INIT_PROGRESS_LIMIT + f64::EPSILON
    {
        state = NodeState::down();
    }

    if params.config.max_premature_crashes > 0
        && info.premature_crash_count > params.config.max_premature_crashes
    {
        state = NodeState::down();
        reason = Some(NodeStateReason::NodeTooUnstable);
    } else if reported.state == State::Initializing && init_progress_timed_out(info, params) {
        state = NodeState::down();
        reason = Some(NodeStateReason::InitProgressTimedOut);
    } else if reported.state == State::Initializing && info.recently_observed_unstable_during_init {
        state = NodeState::down();
        reason = Some(NodeStateReason::NodeTooUnstable);
    }

    if state.state == State::Initializing
        && matches!(wanted.state, State::Retired | State::Maintenance)
    {
        state = NodeState::new(State::Maintenance);
        reason = Some(NodeStateReason::ForcedIntoMaintenance);
    }

    if info.is_storage() && reported.state.is_down_or_stopping() && reason.is_none() {
        match info.transition_time_ms {
            Some(at) if at + params.transition_time_ms(NodeType::Storage) > now => {
                state = NodeState::new(State::Maintenance);
                reason = Some(NodeStateReason::WithinMaintenanceGracePeriod);
            }
            Some(_) => {
                reason = Some(NodeStateReason::NodeNotBackUpWithinGracePeriod);
            }
            None => {}
        }
    }

    if wanted.state.is_worse_than(state.state) {
        state = NodeState::new(wanted.state).with_description(wanted.description.clone());
        reason = None;
    } else if wanted.state == State::Maintenance && state.state == State::Down && info.is_storage() {
        state = NodeState::new(State::Maintenance).with_description(wanted.description.clone());
        reason = None;
    }

    (state, reason)
}

/// Reported state minus what must not be published. Stopping is published as Down.
fn baseline_from_reported(info: &NodeInfo) -> NodeState {
    let reported = &info.reported_state;
    let state = match reported.state {
        State::Stopping => State::Down,
        other => other,
    };
    let mut baseline = NodeState::new(state);
    if state == State::Initializing {
        baseline.init_progress = reported.init_progress;
    }
    if reported.start_timestamp != info.start_timestamp {
        baseline.start_timestamp = reported.start_timestamp;
    }
    baseline
}

fn init_progress_timed_out(info: &NodeInfo, params: &Params) -> bool {
    let max = params.max_init_progress_time_ms();
    max > 0 && params.current_time_ms.saturating_sub(info.init_progress_time_ms) >= max
}

fn take_down_groups_with_too_low_availability(
    cluster: &ContentCluster,
    params: &Params,
    state: &mut ClusterState,
    node_reasons: &mut BTreeMap<Node, NodeStateReason>,
) {
    let safely_in_maintenance: BTreeSet<NodeIndex> = cluster
        .node_infos_of_type(NodeType::Storage)
        .filter(|info| info.effective_wanted_state().state == State::Maintenance)
        .map(|info| info.node().index)
        .collect();

    let takedown = GroupAvailabilityCalculator::new(params.config.min_node_ratio_per_group)
        .with_safe_maintenance_threshold(params.config.safe_maintenance_group_threshold)
        .nodes_that_should_be_taken_down(state, cluster.distribution(), &safely_in_maintenance);

    for index in takedown.down {
        let node = Node::storage(index);
        if state.node_state(node).state == State::Down {
            continue;
        }
        state.set_node_state(
            node,
            NodeState::down().with_description(NodeStateReason::GroupIsDown.to_string()),
        );
        node_reasons.insert(node, NodeStateReason::GroupIsDown);
    }
    for index in takedown.maintenance {
        let node = Node::storage(index);
        state.set_node_state(node, NodeState::new(State::Maintenance));
        node_reasons.insert(node, NodeStateReason::GroupSafelyInMaintenance);
    }
}

/// Minimum of the ideal bit count and what every serving storage node reports.
///
/// Below the ideal, never exceed the lowest count already published; the ideal
/// is only reached in one step once every node supports it.
fn infer_distribution_bits(cluster: &ContentCluster, state: &ClusterState, params: &Params) -> u16 {
    let ideal = params.config.ideal_distribution_bits;
    let lowest_reported = cluster
        .node_infos_of_type(NodeType::Storage)
        .filter(|info| state.node_state(info.node()).state.is_up_ish())
        .map(|info| info.reported_state.min_used_bits)
        .min()
        .unwrap_or(ideal);
    let bits = ideal.min(lowest_reported);
    if bits < ideal {
        bits.min(params.lowest_observed_distribution_bits)
    } else {
        bits
    }
}

fn cluster_down_reason(
    cluster: &ContentCluster,
    state: &ClusterState,
    config: &GeneratorConfig,
) -> Option<ClusterStateReason> {
    let (storage_available, storage_total) = availability(cluster, state, NodeType::Storage);
    let (distributors_available, distributors_total) =
        availability(cluster, state, NodeType::Distributor);

    if storage_available < config.min_storage_nodes_up {
        return Some(ClusterStateReason::TooFewStorageNodesAvailable);
    }
    if distributors_available < config.min_distributor_nodes_up {
        return Some(ClusterStateReason::TooFewDistributorNodesAvailable);
    }
    if ratio(storage_available, storage_total) < config.min_ratio_of_storage_nodes_up {
        return Some(ClusterStateReason::TooLowAvailableStorageNodeRatio);
    }
    if ratio(distributors_available, distributors_total) < config.min_ratio_of_distributor_nodes_up {
        return Some(ClusterStateReason::TooLowAvailableDistributorNodeRatio);
    }
    None
}

fn availability(cluster: &ContentCluster, state: &ClusterState, node_type: NodeType) -> (usize, usize) {
    let total = cluster.node_infos_of_type(node_type).count();
    let available = cluster
        .node_infos_of_type(node_type)
        .filter(|info| state.node_state(info.node()).state.is_available())
        .count();
    (available, total)
}

fn ratio(available: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    available as f64 / total as f64
}
