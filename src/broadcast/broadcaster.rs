//! Two-phase distribution of cluster state bundles.
//!
//! The broadcaster is a synchronous state machine owned by the control loop.
//! Each tick it returns the [`BroadcastRequest`]s to send; the control loop
//! performs them concurrently and feeds the replies back through
//! [`SystemStateBroadcaster::handle_set_state_reply`] and
//! [`SystemStateBroadcaster::handle_activation_reply`]. Per-node bookkeeping
//! lives in the node's [`NodeInfo`].

use crate::clock::TimestampMs;
use crate::error::Result;
use crate::events::{Event, EventKind, EventLog};
use crate::state::{ClusterState, ClusterStateBundle, Node, State};
use crate::topology::{ContentCluster, NodeInfo};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the rollout of the current bundle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastPhase {
    /// Nothing published yet.
    Idle,
    AwaitingPublishAcks,
    AwaitingActivateAcks,
    Converged,
}

/// An RPC the control loop should send on the broadcaster's behalf.
#[derive(Debug, Clone)]
pub enum BroadcastRequest {
    SetClusterState {
        node: Node,
        address: String,
        version: u32,
        bundle: Arc<ClusterStateBundle>,
    },
    Activate {
        node: Node,
        address: String,
        version: u32,
    },
}

impl BroadcastRequest {
    pub fn node(&self) -> Node {
        match self {
            BroadcastRequest::SetClusterState { node, .. } => *node,
            BroadcastRequest::Activate { node, .. } => *node,
        }
    }
}

pub struct SystemStateBroadcaster {
    bundle: Option<Arc<ClusterStateBundle>>,
    last_converged_version: u32,
    events: Arc<EventLog>,
}

impl SystemStateBroadcaster {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            bundle: None,
            last_converged_version: 0,
            events,
        }
    }

    /// Start rolling out `bundle`, superseding whatever was in flight.
    pub fn handle_new_cluster_state_bundle(&mut self, bundle: Arc<ClusterStateBundle>) {
        debug!(version = bundle.version(), "New cluster state bundle to broadcast");
        self.bundle = Some(bundle);
    }

    pub fn bundle(&self) -> Option<&ClusterStateBundle> {
        self.bundle.as_deref()
    }

    pub fn version(&self) -> u32 {
        self.bundle.as_ref().map(|b| b.version()).unwrap_or(0)
    }

    pub fn last_converged_version(&self) -> u32 {
        self.last_converged_version
    }

    /// Forget the bundle and convergence, e.g. when leadership is lost.
    pub fn reset(&mut self) {
        self.bundle = None;
        self.last_converged_version = 0;
    }

    pub fn phase(&self, cluster: &ContentCluster) -> BroadcastPhase {
        let Some(bundle) = &self.bundle else {
            return BroadcastPhase::Idle;
        };
        let version = bundle.version();
        if self.last_converged_version >= version {
            return BroadcastPhase::Converged;
        }
        if !all_targets(cluster, |info| info.cluster_state_version_bundle_acked == version) {
            return BroadcastPhase::AwaitingPublishAcks;
        }
        if bundle.deferred_activation() {
            BroadcastPhase::AwaitingActivateAcks
        } else {
            BroadcastPhase::Converged
        }
    }

    /// Publish requests for every target that has not been sent the current version.
    pub fn broadcast_new_state_bundle_if_required(&mut self, cluster: &mut ContentCluster) -> Vec<BroadcastRequest> {
        let Some(bundle) = self.bundle.clone() else {
            return Vec::new();
        };
        let version = bundle.version();
        let mut requests = Vec::new();
        for info in cluster.node_infos_mut() {
            if !is_target(info) || info.cluster_state_version_bundle_sent >= version {
                continue;
            }
            let Some(address) = info.rpc_address.clone() else {
                continue;
            };
            info.cluster_state_version_bundle_sent = version;
            requests.push(BroadcastRequest::SetClusterState {
                node: info.node(),
                address,
                version,
                bundle: Arc::new(tailored_for_node(&bundle, info)),
            });
        }
        if !requests.is_empty() {
            debug!(version, count = requests.len(), "Publishing cluster state bundle");
        }
        requests
    }

    /// Activation requests, only once every target acknowledged the publish.
    pub fn broadcast_activations_if_required(&mut self, cluster: &mut ContentCluster) -> Vec<BroadcastRequest> {
        let Some(bundle) = self.bundle.clone() else {
            return Vec::new();
        };
        if !bundle.deferred_activation() {
            return Vec::new();
        }
        let version = bundle.version();
        if !all_targets(cluster, |info| info.cluster_state_version_bundle_acked == version) {
            return Vec::new();
        }
        let mut requests = Vec::new();
        for info in cluster.node_infos_mut() {
            if !is_target(info) || info.cluster_state_version_activation_sent >= version {
                continue;
            }
            let Some(address) = info.rpc_address.clone() else {
                continue;
            };
            info.cluster_state_version_activation_sent = version;
            requests.push(BroadcastRequest::Activate {
                node: info.node(),
                address,
                version,
            });
        }
        requests
    }

    /// Both phases for this tick.
    pub fn broadcast(&mut self, cluster: &mut ContentCluster) -> Vec<BroadcastRequest> {
        let mut requests = self.broadcast_new_state_bundle_if_required(cluster);
        requests.extend(self.broadcast_activations_if_required(cluster));
        requests
    }

    pub fn handle_set_state_reply(&mut self, cluster: &mut ContentCluster, node: Node, version: u32, result: Result<()>) {
        let Some(info) = cluster.node_info_mut(node) else {
            return;
        };
        match result {
            Ok(()) => {
                if version > info.cluster_state_version_bundle_acked {
                    info.cluster_state_version_bundle_acked = version;
                }
            }
            Err(e) => {
                warn!(node = %node, version, error = %e, "Node rejected cluster state bundle");
                info.last_request_failure = Some(e.to_string());
                if info.cluster_state_version_bundle_sent == version {
                    info.cluster_state_version_bundle_sent = info.cluster_state_version_bundle_acked;
                }
            }
        }
    }

    pub fn handle_activation_reply(&mut self, cluster: &mut ContentCluster, node: Node, version: u32, result: Result<u32>) {
        let Some(info) = cluster.node_info_mut(node) else {
            return;
        };
        match result {
            Ok(actual) if actual == version => {
                if version > info.cluster_state_version_activation_acked {
                    info.cluster_state_version_activation_acked = version;
                }
            }
            Ok(actual) => {
                warn!(node = %node, version, actual, "Node activated a different cluster state version");
                if info.cluster_state_version_activation_sent == version {
                    info.cluster_state_version_activation_sent = info.cluster_state_version_activation_acked;
                }
            }
            Err(e) => {
                warn!(node = %node, version, error = %e, "Cluster state activation failed");
                info.last_request_failure = Some(e.to_string());
                if info.cluster_state_version_activation_sent == version {
                    info.cluster_state_version_activation_sent = info.cluster_state_version_activation_acked;
                }
            }
        }
    }

    /// Detect convergence of the current bundle. On first convergence the start
    /// timestamps it carried are recorded as observed. Returns whether the
    /// bundle converged during this call.
    pub fn check_convergence(&mut self, cluster: &mut ContentCluster, now: TimestampMs) -> bool {
        let Some(bundle) = self.bundle.clone() else {
            return false;
        };
        let version = bundle.version();
        if self.last_converged_version >= version {
            return false;
        }
        if !self.non_converged_nodes(cluster, version).is_empty() {
            return false;
        }

        self.last_converged_version = version;
        mark_start_timestamps_observed(cluster, bundle.baseline_state());
        info!(version, "Cluster state version converged on all nodes");
        self.events.add(Event::cluster(
            EventKind::Convergence,
            format!("Cluster state version {} converged on all nodes", version),
            now,
        ));
        true
    }

    /// Targets that have not yet acknowledged (or activated, for deferred bundles) `version`.
    pub fn non_converged_nodes(&self, cluster: &ContentCluster, version: u32) -> Vec<Node> {
        let deferred = self
            .bundle
            .as_ref()
            .map(|b| b.deferred_activation())
            .unwrap_or(false);
        cluster
            .node_infos()
            .filter(|info| is_target(info))
            .filter(|info| {
                if deferred {
                    info.cluster_state_version_activation_acked < version
                } else {
                    info.cluster_state_version_bundle_acked < version
                }
            })
            .map(|info| info.node())
            .collect()
    }
}

/// Nodes that should receive cluster states: discoverable and not reported down.
fn is_target(info: &NodeInfo) -> bool {
    info.is_in_service_discovery() && info.reported_state.state != State::Down
}

fn all_targets<F>(cluster: &ContentCluster, predicate: F) -> bool
where
    F: Fn(&NodeInfo) -> bool,
{
    cluster
        .node_infos()
        .filter(|info| is_target(info))
        .all(predicate)
}

/// The bundle as one node should see it: with its own not yet observed start
/// timestamp in every bucket space state.
fn tailored_for_node(bundle: &ClusterStateBundle, info: &NodeInfo) -> ClusterStateBundle {
    let node = info.node();
    let start_timestamp = info.reported_state.start_timestamp;
    if start_timestamp == 0 || start_timestamp == info.start_timestamp {
        return bundle.clone();
    }
    bundle.cloned_with_mapper(|state| {
        let mut state = state.clone();
        if node.index < state.node_count(node.node_type) {
            let mut ns = state.node_state(node);
            if ns.start_timestamp != start_timestamp {
                ns.start_timestamp = start_timestamp;
                state.set_node_state(node, ns);
            }
        }
        state
    })
}

fn mark_start_timestamps_observed(cluster: &mut ContentCluster, state: &ClusterState) {
    for info in cluster.node_infos_mut() {
        let published = state.node_state(info.node()).start_timestamp;
        if published != 0 && published == info.reported_state.start_timestamp {
            info.start_timestamp = published;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControllerError;
    use crate::state::{AnnotatedClusterState, NodeState};
    use crate::topology::{ConfiguredNode, Distribution};
    use std::collections::BTreeMap;

    fn cluster() -> ContentCluster {
        let nodes: Vec<_> = (0..2).map(ConfiguredNode::new).collect();
        let mut cluster = ContentCluster::new("test", &nodes, Distribution::flat(0..2, 2));
        for info in cluster.node_infos_mut() {
            info.reported_state = NodeState::up();
            info.rpc_address = Some(format!("tcp/{}", info.node()));
        }
        cluster
    }

    fn bundle(version: u32, deferred: bool) -> Arc<ClusterStateBundle> {
        let state = ClusterState::parse("distributor:2 storage:2").unwrap();
        Arc::new(
            ClusterStateBundle::new(AnnotatedClusterState::with_state(state), BTreeMap::new(), None, deferred)
                .cloned_with_version_set(version),
        )
    }

    fn ack_all(b: &mut SystemStateBroadcaster, cluster: &mut ContentCluster, requests: &[BroadcastRequest]) {
        for request in requests {
            match request {
                BroadcastRequest::SetClusterState { node, version, .. } => {
                    b.handle_set_state_reply(cluster, *node, *version, Ok(()))
                }
                BroadcastRequest::Activate { node, version, .. } => {
                    b.handle_activation_reply(cluster, *node, *version, Ok(*version))
                }
            }
        }
    }

    #[test]
    fn test_single_phase_converges_on_acks() {
        let events = Arc::new(EventLog::new(10));
        let mut b = SystemStateBroadcaster::new(events.clone());
        let mut cluster = cluster();
        assert_eq!(b.phase(&cluster), BroadcastPhase::Idle);

        b.handle_new_cluster_state_bundle(bundle(3, false));
        let requests = b.broadcast(&mut cluster);
        assert_eq!(requests.len(), 4);
        // Nothing is resent while in flight
        assert!(b.broadcast(&mut cluster).is_empty());
        assert!(!b.check_convergence(&mut cluster, 1));

        ack_all(&mut b, &mut cluster, &requests);
        assert!(b.check_convergence(&mut cluster, 2));
        assert_eq!(b.last_converged_version(), 3);
        assert_eq!(b.phase(&cluster), BroadcastPhase::Converged);
        assert_eq!(events.recent(1)[0].kind, EventKind::Convergence);
    }

    #[test]
    fn test_activation_waits_for_all_acks() {
        let mut b = SystemStateBroadcaster::new(Arc::new(EventLog::new(10)));
        let mut cluster = cluster();
        b.handle_new_cluster_state_bundle(bundle(3, true));
        let requests = b.broadcast(&mut cluster);
        assert_eq!(requests.len(), 4);

        ack_all(&mut b, &mut cluster, &requests[..3]);
        assert!(b.broadcast(&mut cluster).is_empty());
        assert_eq!(b.phase(&cluster), BroadcastPhase::AwaitingPublishAcks);

        ack_all(&mut b, &mut cluster, &requests[3..]);
        assert_eq!(b.phase(&cluster), BroadcastPhase::AwaitingActivateAcks);
        assert!(!b.check_convergence(&mut cluster, 1));
        let activations = b.broadcast(&mut cluster);
        assert_eq!(activations.len(), 4);
        assert!(activations
            .iter()
            .all(|r| matches!(r, BroadcastRequest::Activate { version: 3, .. })));

        ack_all(&mut b, &mut cluster, &activations);
        assert!(b.check_convergence(&mut cluster, 2));
    }

    #[test]
    fn test_activation_of_other_version_does_not_converge() {
        let mut b = SystemStateBroadcaster::new(Arc::new(EventLog::new(10)));
        let mut cluster = cluster();
        b.handle_new_cluster_state_bundle(bundle(3, true));
        let requests = b.broadcast(&mut cluster);
        ack_all(&mut b, &mut cluster, &requests);
        let activations = b.broadcast(&mut cluster);
        for request in &activations {
            let actual = if request.node() == Node::storage(1) { 4 } else { 3 };
            b.handle_activation_reply(&mut cluster, request.node(), 3, Ok(actual));
        }
        assert!(!b.check_convergence(&mut cluster, 1));
        assert_eq!(b.non_converged_nodes(&cluster, 3), vec![Node::storage(1)]);
        // Retried on the next tick
        let retry = b.broadcast(&mut cluster);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].node(), Node::storage(1));
    }

    #[test]
    fn test_rejected_publish_is_retried_with_same_version() {
        let mut b = SystemStateBroadcaster::new(Arc::new(EventLog::new(10)));
        let mut cluster = cluster();
        b.handle_new_cluster_state_bundle(bundle(3, false));
        let _ = b.broadcast(&mut cluster);
        b.handle_set_state_reply(
            &mut cluster,
            Node::distributor(0),
            3,
            Err(ControllerError::Rpc {
                node: Node::distributor(0),
                message: "rejected".into(),
            }),
        );
        let retry = b.broadcast(&mut cluster);
        assert_eq!(retry.len(), 1);
        assert!(matches!(
            &retry[0],
            BroadcastRequest::SetClusterState { node, version: 3, .. } if *node == Node::distributor(0)
        ));
    }

    #[test]
    fn test_stale_replies_are_ignored() {
        let mut b = SystemStateBroadcaster::new(Arc::new(EventLog::new(10)));
        let mut cluster = cluster();
        b.handle_new_cluster_state_bundle(bundle(3, false));
        let _ = b.broadcast(&mut cluster);
        b.handle_new_cluster_state_bundle(bundle(4, false));
        let _ = b.broadcast(&mut cluster);

        b.handle_set_state_reply(&mut cluster, Node::storage(0), 4, Ok(()));
        b.handle_set_state_reply(&mut cluster, Node::storage(0), 3, Ok(()));
        let info = cluster.node_info(Node::storage(0)).unwrap();
        assert_eq!(info.cluster_state_version_bundle_acked, 4);

        // A late failure for the superseded version does not trigger a resend
        b.handle_set_state_reply(
            &mut cluster,
            Node::storage(1),
            3,
            Err(ControllerError::Timeout(10)),
        );
        assert!(b.broadcast(&mut cluster).is_empty());
    }

    #[test]
    fn test_down_and_undiscovered_nodes_are_not_targets() {
        let mut b = SystemStateBroadcaster::new(Arc::new(EventLog::new(10)));
        let mut cluster = cluster();
        cluster.node_info_mut(Node::storage(0)).unwrap().reported_state = NodeState::down();
        cluster.node_info_mut(Node::storage(1)).unwrap().missing_since_ms = Some(5);
        b.handle_new_cluster_state_bundle(bundle(3, false));
        let requests = b.broadcast(&mut cluster);
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.node().is_distributor()));
    }

    #[test]
    fn test_start_timestamp_tailoring_and_observation() {
        let mut b = SystemStateBroadcaster::new(Arc::new(EventLog::new(10)));
        let mut cluster = cluster();
        cluster.node_info_mut(Node::storage(1)).unwrap().reported_state =
            NodeState::up().with_start_timestamp(777);

        let state = ClusterState::parse("distributor:2 storage:2 .1.t:777").unwrap();
        let mut derived = BTreeMap::new();
        derived.insert(
            "default".to_string(),
            AnnotatedClusterState::with_state(ClusterState::parse("distributor:2 storage:2 .1.s:m").unwrap()),
        );
        let bundle = Arc::new(
            ClusterStateBundle::new(AnnotatedClusterState::with_state(state), derived, None, false)
                .cloned_with_version_set(5),
        );
        b.handle_new_cluster_state_bundle(bundle);
        let requests = b.broadcast(&mut cluster);

        let sent_to_storage_1 = requests
            .iter()
            .find_map(|r| match r {
                BroadcastRequest::SetClusterState { node, bundle, .. } if *node == Node::storage(1) => {
                    Some(bundle.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(
            sent_to_storage_1.derived_state("default").cluster_state().to_string(),
            "version:5 distributor:2 storage:2 .1.s:m .1.t:777"
        );

        ack_all(&mut b, &mut cluster, &requests);
        assert!(b.check_convergence(&mut cluster, 1));
        assert_eq!(cluster.node_info(Node::storage(1)).unwrap().start_timestamp, 777);
    }
}
