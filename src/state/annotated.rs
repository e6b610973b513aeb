//! Cluster state plus the reasons behind it, for diagnostics.

use super::cluster_state::ClusterState;
use super::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why the whole cluster was marked down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStateReason {
    TooFewStorageNodesAvailable,
    TooFewDistributorNodesAvailable,
    TooLowAvailableStorageNodeRatio,
    TooLowAvailableDistributorNodeRatio,
}

impl fmt::Display for ClusterStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ClusterStateReason::TooFewStorageNodesAvailable => "too few storage nodes available",
            ClusterStateReason::TooFewDistributorNodesAvailable => {
                "too few distributor nodes available"
            }
            ClusterStateReason::TooLowAvailableStorageNodeRatio => {
                "too low ratio of available storage nodes"
            }
            ClusterStateReason::TooLowAvailableDistributorNodeRatio => {
                "too low ratio of available distributor nodes"
            }
        };
        f.write_str(text)
    }
}

/// Why a single node ended up in its generated state when that differs from what it reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateReason {
    NodeTooUnstable,
    WithinMaintenanceGracePeriod,
    NodeNotBackUpWithinGracePeriod,
    InitProgressTimedOut,
    ForcedIntoMaintenance,
    GroupIsDown,
    GroupSafelyInMaintenance,
    MayHaveMergesPending,
}

impl fmt::Display for NodeStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NodeStateReason::NodeTooUnstable => "node has crashed too many times",
            NodeStateReason::WithinMaintenanceGracePeriod => "node within maintenance grace period",
            NodeStateReason::NodeNotBackUpWithinGracePeriod => {
                "node not back up within grace period"
            }
            NodeStateReason::InitProgressTimedOut => "node initialization made no progress in time",
            NodeStateReason::ForcedIntoMaintenance => "node forced into maintenance",
            NodeStateReason::GroupIsDown => "group node availability below configured threshold",
            NodeStateReason::GroupSafelyInMaintenance => {
                "enough group nodes are safely in maintenance"
            }
            NodeStateReason::MayHaveMergesPending => "node may have pending global merges",
        };
        f.write_str(text)
    }
}

/// A [`ClusterState`] annotated with the reasons that produced it.
///
/// The annotations never take part in equality; two annotated states are equal
/// iff their wire states are.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedClusterState {
    cluster_state: ClusterState,
    cluster_reason: Option<ClusterStateReason>,
    node_reasons: BTreeMap<Node, NodeStateReason>,
}

impl AnnotatedClusterState {
    pub fn new(
        cluster_state: ClusterState,
        cluster_reason: Option<ClusterStateReason>,
        node_reasons: BTreeMap<Node, NodeStateReason>,
    ) -> Self {
        Self {
            cluster_state,
            cluster_reason,
            node_reasons,
        }
    }

    pub fn with_state(cluster_state: ClusterState) -> Self {
        Self::new(cluster_state, None, BTreeMap::new())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cluster_state(&self) -> &ClusterState {
        &self.cluster_state
    }

    pub fn cluster_state_mut(&mut self) -> &mut ClusterState {
        &mut self.cluster_state
    }

    pub fn cluster_reason(&self) -> Option<ClusterStateReason> {
        self.cluster_reason
    }

    pub fn node_reasons(&self) -> &BTreeMap<Node, NodeStateReason> {
        &self.node_reasons
    }

    pub fn node_reason(&self, node: Node) -> Option<NodeStateReason> {
        self.node_reasons.get(&node).copied()
    }

    pub fn set_node_reason(&mut self, node: Node, reason: NodeStateReason) {
        self.node_reasons.insert(node, reason);
    }

    pub fn cloned_with_version(&self, version: u32) -> Self {
        Self {
            cluster_state: self.cluster_state.cloned_with_version(version),
            cluster_reason: self.cluster_reason,
            node_reasons: self.node_reasons.clone(),
        }
    }

    pub fn similar_to(&self, other: &AnnotatedClusterState) -> bool {
        self.cluster_state.similar_to(&other.cluster_state)
    }
}

impl PartialEq for AnnotatedClusterState {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_state == other.cluster_state
    }
}

impl fmt::Display for AnnotatedClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cluster_state)
    }
}
