//! Cluster-wide state and its compact wire format.
//!
//! The wire format is a whitespace separated list of `key:value` tokens:
//!
//! ```text
//! version:101 cluster:d bits:12 distributor:2 .0.s:d storage:3 .0.s:m .0.m:disk\x20swap
//! ```
//!
//! `distributor:N` / `storage:N` give the node count of each type; node-level
//! tokens (`.index.key:value`) apply to the most recently named type. Only nodes
//! deviating from plain Up are listed, in ascending index order. Nodes at or above
//! the count are implicitly Down.

use super::node::{Node, NodeIndex, NodeType};
use super::node_state::{NodeState, State, DEFAULT_DISTRIBUTION_BITS};
use crate::error::{ControllerError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A versioned, cluster-wide description of which nodes are usable.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterState {
    version: u32,
    cluster_state: State,
    distribution_bits: u16,
    distributor_count: NodeIndex,
    storage_count: NodeIndex,
    node_states: BTreeMap<Node, NodeState>,
}

impl ClusterState {
    /// An unversioned, up cluster without any nodes.
    pub fn empty() -> Self {
        Self {
            version: 0,
            cluster_state: State::Up,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            distributor_count: 0,
            storage_count: 0,
            node_states: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn cloned_with_version(&self, version: u32) -> Self {
        let mut state = self.clone();
        state.version = version;
        state
    }

    pub fn cluster_state(&self) -> State {
        self.cluster_state
    }

    pub fn is_cluster_up(&self) -> bool {
        self.cluster_state == State::Up
    }

    /// Only Up and Down are meaningful at cluster level.
    pub fn set_cluster_state(&mut self, state: State) {
        debug_assert!(matches!(state, State::Up | State::Down));
        self.cluster_state = state;
    }

    pub fn distribution_bits(&self) -> u16 {
        self.distribution_bits
    }

    pub fn set_distribution_bits(&mut self, bits: u16) {
        self.distribution_bits = bits;
    }

    pub fn node_count(&self, node_type: NodeType) -> NodeIndex {
        match node_type {
            NodeType::Distributor => self.distributor_count,
            NodeType::Storage => self.storage_count,
        }
    }

    fn node_count_mut(&mut self, node_type: NodeType) -> &mut NodeIndex {
        match node_type {
            NodeType::Distributor => &mut self.distributor_count,
            NodeType::Storage => &mut self.storage_count,
        }
    }

    /// State of any node; nodes outside the counted range are Down.
    pub fn node_state(&self, node: Node) -> NodeState {
        if node.index >= self.node_count(node.node_type) {
            return NodeState::down();
        }
        self.node_states
            .get(&node)
            .cloned()
            .unwrap_or_else(NodeState::up)
    }

    pub fn set_node_state(&mut self, node: Node, state: NodeState) {
        let count = self.node_count(node.node_type);
        if node.index >= count {
            for index in count..node.index {
                self.node_states
                    .insert(Node::new(node.node_type, index), NodeState::down());
            }
            *self.node_count_mut(node.node_type) = node.index + 1;
        }

        let is_down = state.state == State::Down;
        if state.is_default_up() {
            self.node_states.remove(&node);
        } else {
            self.node_states.insert(node, state);
        }

        if is_down {
            self.remove_trailing_down_nodes_without_description(node.node_type);
        }
    }

    fn remove_trailing_down_nodes_without_description(&mut self, node_type: NodeType) {
        loop {
            let count = self.node_count(node_type);
            if count == 0 {
                return;
            }
            let last = Node::new(node_type, count - 1);
            match self.node_states.get(&last) {
                Some(ns) if ns.state == State::Down && ns.description.is_empty() => {
                    self.node_states.remove(&last);
                    *self.node_count_mut(node_type) = count - 1;
                }
                _ => return,
            }
        }
    }

    /// All nodes of a type within the counted range, with their states.
    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = (Node, NodeState)> + '_ {
        (0..self.node_count(node_type)).map(move |index| {
            let node = Node::new(node_type, index);
            (node, self.node_state(node))
        })
    }

    /// Structural similarity, ignoring version and purely numeric per-node churn.
    ///
    /// Two states where the cluster is Down are always similar.
    pub fn similar_to(&self, other: &ClusterState) -> bool {
        if self.cluster_state == State::Down && other.cluster_state == State::Down {
            return true;
        }
        if self.cluster_state != other.cluster_state
            || self.distribution_bits != other.distribution_bits
        {
            return false;
        }
        NodeType::ALL.iter().all(|&node_type| {
            let count = self.node_count(node_type);
            if count != other.node_count(node_type) {
                return false;
            }
            (0..count).all(|index| {
                let node = Node::new(node_type, index);
                self.node_state(node).similar_to(&other.node_state(node))
            })
        })
    }

    fn write_node_tokens(&self, node_type: NodeType, out: &mut Vec<String>) {
        out.push(format!("{}:{}", node_type, self.node_count(node_type)));
        for (node, ns) in self.node_states.range(
            Node::new(node_type, 0)..=Node::new(node_type, NodeIndex::MAX),
        ) {
            ns.write_tokens(&format!(".{}.", node.index), out);
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut state = ClusterState::empty();
        let mut current_type: Option<NodeType> = None;
        let mut pending: BTreeMap<Node, NodeState> = BTreeMap::new();

        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| ControllerError::Parse(format!("token '{}' lacks ':'", token)))?;

            if let Some(rest) = key.strip_prefix('.') {
                let node_type = current_type.ok_or_else(|| {
                    ControllerError::Parse(format!("node token '{}' before any node type", token))
                })?;
                let (index, field) = rest.split_once('.').ok_or_else(|| {
                    ControllerError::Parse(format!("malformed node token '{}'", token))
                })?;
                let index: NodeIndex = index.parse().map_err(|_| {
                    ControllerError::Parse(format!("bad node index in '{}'", token))
                })?;
                if index >= state.node_count(node_type) {
                    return Err(ControllerError::Parse(format!(
                        "node index {} out of range for {} in '{}'",
                        index, node_type, token
                    )));
                }
                pending
                    .entry(Node::new(node_type, index))
                    .or_insert_with(NodeState::up)
                    .set_field(field, value)?;
                continue;
            }

            match key {
                "version" => {
                    state.version = value.parse().map_err(|_| {
                        ControllerError::Parse(format!("bad version '{}'", value))
                    })?;
                }
                "cluster" => {
                    state.cluster_state = match value {
                        "u" => State::Up,
                        "d" => State::Down,
                        other => {
                            return Err(ControllerError::Parse(format!(
                                "bad cluster state '{}'",
                                other
                            )))
                        }
                    };
                }
                "bits" => {
                    state.distribution_bits = value.parse().map_err(|_| {
                        ControllerError::Parse(format!("bad distribution bits '{}'", value))
                    })?;
                }
                "distributor" | "storage" => {
                    let node_type: NodeType = key.parse()?;
                    let count: NodeIndex = value.parse().map_err(|_| {
                        ControllerError::Parse(format!("bad node count '{}'", value))
                    })?;
                    *state.node_count_mut(node_type) = count;
                    current_type = Some(node_type);
                }
                other => {
                    return Err(ControllerError::Parse(format!("unknown key '{}'", other)));
                }
            }
        }

        for (node, ns) in pending {
            ns.check_parsed()?;
            if !ns.is_default_up() {
                state.node_states.insert(node, ns);
            }
        }
        Ok(state)
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = Vec::new();
        if self.version != 0 {
            tokens.push(format!("version:{}", self.version));
        }
        if self.cluster_state == State::Down {
            tokens.push("cluster:d".to_string());
        }
        if self.distribution_bits != DEFAULT_DISTRIBUTION_BITS {
            tokens.push(format!("bits:{}", self.distribution_bits));
        }
        self.write_node_tokens(NodeType::Distributor, &mut tokens);
        self.write_node_tokens(NodeType::Storage, &mut tokens);
        f.write_str(&tokens.join(" "))
    }
}

impl FromStr for ClusterState {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        ClusterState::parse(s)
    }
}
