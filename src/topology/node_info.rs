//! Mutable per-node runtime record.

use crate::clock::TimestampMs;
use crate::host_info::HostInfo;
use crate::state::{Node, NodeState, State};

/// Everything the controller tracks about one node at runtime.
///
/// Owned by the [`ContentCluster`](super::ContentCluster); other components
/// borrow it through the cluster and never keep copies.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    node: Node,
    /// Set from configuration; makes the effective wanted state Retired.
    pub configured_retired: bool,
    /// Last state the node reported about itself.
    pub reported_state: NodeState,
    /// State requested by an operator.
    pub wanted_state: NodeState,
    /// State computed for this node by the last generation.
    pub generated_state: NodeState,
    /// When the reported state last went from available to Down or Stopping.
    pub transition_time_ms: Option<TimestampMs>,
    /// When the node last reported Up after having been something else.
    pub up_since_ms: Option<TimestampMs>,
    pub premature_crash_count: u32,
    /// The node went down while initializing; keep it down until it reaches Up.
    pub recently_observed_unstable_during_init: bool,
    /// Start timestamp every node has already been sent. 0 when none.
    pub start_timestamp: u64,
    /// When init progress last moved.
    pub init_progress_time_ms: TimestampMs,
    /// Versions sent to and acknowledged by this node.
    pub cluster_state_version_bundle_sent: u32,
    pub cluster_state_version_bundle_acked: u32,
    pub cluster_state_version_activation_sent: u32,
    pub cluster_state_version_activation_acked: u32,
    pub host_info: HostInfo,
    /// Address as found in service discovery. `None` until first seen.
    pub rpc_address: Option<String>,
    /// When the node disappeared from service discovery, if it is missing.
    pub missing_since_ms: Option<TimestampMs>,
    /// A long-poll node state request is outstanding.
    pub pending_node_state_request: bool,
    pub last_request_failure: Option<String>,
}

impl NodeInfo {
    pub fn new(node: Node, configured_retired: bool) -> Self {
        Self {
            node,
            configured_retired,
            reported_state: NodeState::down(),
            wanted_state: NodeState::up(),
            generated_state: NodeState::down(),
            transition_time_ms: None,
            up_since_ms: None,
            premature_crash_count: 0,
            recently_observed_unstable_during_init: false,
            start_timestamp: 0,
            init_progress_time_ms: 0,
            cluster_state_version_bundle_sent: 0,
            cluster_state_version_bundle_acked: 0,
            cluster_state_version_activation_sent: 0,
            cluster_state_version_activation_acked: 0,
            host_info: HostInfo::default(),
            rpc_address: None,
            missing_since_ms: None,
            pending_node_state_request: false,
            last_request_failure: None,
        }
    }

    pub fn node(&self) -> Node {
        self.node
    }

    pub fn is_storage(&self) -> bool {
        self.node.is_storage()
    }

    pub fn is_distributor(&self) -> bool {
        self.node.is_distributor()
    }

    /// Wanted state with configured retirement applied. Only storage nodes retire.
    pub fn effective_wanted_state(&self) -> NodeState {
        if self.configured_retired && self.is_storage() && self.wanted_state.state == State::Up {
            return NodeState::new(State::Retired).with_description(self.wanted_state.description.clone());
        }
        self.wanted_state.clone()
    }

    /// Seen in service discovery and not missing since.
    pub fn is_in_service_discovery(&self) -> bool {
        self.rpc_address.is_some() && self.missing_since_ms.is_none()
    }

    /// Forget everything sent to this node, e.g. after it restarted or leadership changed.
    pub fn reset_broadcast_bookkeeping(&mut self) {
        self.cluster_state_version_bundle_sent = 0;
        self.cluster_state_version_bundle_acked = 0;
        self.cluster_state_version_activation_sent = 0;
        self.cluster_state_version_activation_acked = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_is_down_and_unreachable() {
        let info = NodeInfo::new(Node::storage(2), false);
        assert_eq!(info.reported_state.state, State::Down);
        assert_eq!(info.wanted_state.state, State::Up);
        assert!(!info.is_in_service_discovery());
    }

    #[test]
    fn test_configured_retirement_applies_to_up_wanted_state() {
        let mut info = NodeInfo::new(Node::storage(0), true);
        assert_eq!(info.effective_wanted_state().state, State::Retired);

        info.wanted_state = NodeState::new(State::Maintenance);
        assert_eq!(info.effective_wanted_state().state, State::Maintenance);

        let distributor = NodeInfo::new(Node::distributor(0), true);
        assert_eq!(distributor.effective_wanted_state().state, State::Up);
    }
}
