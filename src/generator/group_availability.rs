//! Implicit group takedown.
//!
//! When too few nodes of a leaf group are live, the whole group is taken out
//! so that a handful of surviving nodes do not receive the group's full load.

use crate::state::{ClusterState, Node, NodeIndex, State};
use crate::topology::{Distribution, Group};
use std::collections::BTreeSet;

/// Nodes the group rules want moved out of service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTakedown {
    /// Storage node indices to set Down.
    pub down: BTreeSet<NodeIndex>,
    /// Storage node indices to set Maintenance.
    pub maintenance: BTreeSet<NodeIndex>,
}

impl GroupTakedown {
    pub fn is_empty(&self) -> bool {
        self.down.is_empty() && self.maintenance.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GroupAvailabilityCalculator {
    min_node_ratio_per_group: f64,
    safe_maintenance_group_threshold: Option<usize>,
}

impl GroupAvailabilityCalculator {
    pub fn new(min_node_ratio_per_group: f64) -> Self {
        Self {
            min_node_ratio_per_group,
            safe_maintenance_group_threshold: None,
        }
    }

    pub fn with_safe_maintenance_threshold(mut self, threshold: Option<usize>) -> Self {
        self.safe_maintenance_group_threshold = threshold;
        self
    }

    /// Evaluate every leaf group of `distribution` against `state`.
    ///
    /// `safely_in_maintenance` lists storage nodes an operator deliberately put in
    /// maintenance. Flat clusters never produce a takedown.
    pub fn nodes_that_should_be_taken_down(
        &self,
        state: &ClusterState,
        distribution: &Distribution,
        safely_in_maintenance: &BTreeSet<NodeIndex>,
    ) -> GroupTakedown {
        let mut takedown = GroupTakedown::default();
        if !distribution.is_hierarchical() {
            return takedown;
        }

        for group in distribution.leaf_groups() {
            if group.nodes.is_empty() {
                continue;
            }
            if self.group_safely_in_maintenance(group, safely_in_maintenance) {
                takedown.maintenance.extend(
                    group
                        .nodes
                        .iter()
                        .filter(|index| !safely_in_maintenance.contains(index))
                        .filter(|&&index| storage_state(state, index) != State::Maintenance),
                );
                continue;
            }
            if self.group_availability_too_low(state, group) {
                takedown.down.extend(
                    group
                        .nodes
                        .iter()
                        .filter(|&&index| storage_state(state, index) != State::Maintenance),
                );
            }
        }
        takedown
    }

    fn group_safely_in_maintenance(&self, group: &Group, safely_in_maintenance: &BTreeSet<NodeIndex>) -> bool {
        match self.safe_maintenance_group_threshold {
            Some(threshold) => {
                let count = group
                    .nodes
                    .iter()
                    .filter(|index| safely_in_maintenance.contains(index))
                    .count();
                count > threshold
            }
            None => false,
        }
    }

    fn group_availability_too_low(&self, state: &ClusterState, group: &Group) -> bool {
        if self.min_node_ratio_per_group <= 0.0 {
            return false;
        }
        let live = group
            .nodes
            .iter()
            .filter(|&&index| is_live(storage_state(state, index)))
            .count();
        let ratio = live as f64 / group.nodes.len() as f64;
        ratio < self.min_node_ratio_per_group
    }
}

fn storage_state(state: &ClusterState, index: NodeIndex) -> State {
    state.node_state(Node::storage(index)).state
}

/// Retired, Stopping and Down nodes do not carry a group's load.
fn is_live(state: State) -> bool {
    matches!(state, State::Up | State::Initializing | State::Maintenance)
}
