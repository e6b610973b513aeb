//! The Cluster Topology Model: configured membership plus the arena of
//! per-node runtime records.

use super::distribution::{ConfiguredNode, Distribution};
use super::node_info::NodeInfo;
use crate::config::ClusterConfig;
use crate::error::{ControllerError, Result};
use crate::state::{Node, NodeIndex, NodeType};
use std::collections::BTreeMap;
use tracing::info;

/// A content cluster: its configured nodes, groups and the runtime record of every node.
#[derive(Debug, Clone)]
pub struct ContentCluster {
    name: String,
    distribution: Distribution,
    configured: BTreeMap<NodeIndex, ConfiguredNode>,
    node_infos: BTreeMap<Node, NodeInfo>,
}

impl ContentCluster {
    pub fn new(name: impl Into<String>, nodes: &[ConfiguredNode], distribution: Distribution) -> Self {
        let mut cluster = Self {
            name: name.into(),
            distribution,
            configured: BTreeMap::new(),
            node_infos: BTreeMap::new(),
        };
        cluster.apply_configured_nodes(nodes);
        cluster
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.name.clone(), &config.nodes, distribution_from_config(config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn configured_nodes(&self) -> &BTreeMap<NodeIndex, ConfiguredNode> {
        &self.configured
    }

    pub fn configured_node_count(&self) -> usize {
        self.configured.len()
    }

    pub fn is_configured(&self, node: Node) -> bool {
        self.node_infos.contains_key(&node)
    }

    pub fn node_info(&self, node: Node) -> Option<&NodeInfo> {
        self.node_infos.get(&node)
    }

    pub fn node_info_mut(&mut self, node: Node) -> Option<&mut NodeInfo> {
        self.node_infos.get_mut(&node)
    }

    /// Like [`node_info`](Self::node_info), failing for unconfigured nodes.
    pub fn require(&self, node: Node) -> Result<&NodeInfo> {
        self.node_info(node)
            .ok_or(ControllerError::NodeNotConfigured(node))
    }

    pub fn require_mut(&mut self, node: Node) -> Result<&mut NodeInfo> {
        self.node_infos
            .get_mut(&node)
            .ok_or(ControllerError::NodeNotConfigured(node))
    }

    /// All node records, distributors first, ascending index.
    pub fn node_infos(&self) -> impl Iterator<Item = &NodeInfo> {
        self.node_infos.values()
    }

    pub fn node_infos_mut(&mut self) -> impl Iterator<Item = &mut NodeInfo> {
        self.node_infos.values_mut()
    }

    pub fn node_infos_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &NodeInfo> {
        self.node_infos
            .values()
            .filter(move |info| info.node().node_type == node_type)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.node_infos.keys().copied().collect()
    }

    /// Live reconfiguration: add new nodes, prune removed ones, refresh retirement.
    pub fn set_configured_nodes(&mut self, nodes: &[ConfiguredNode], distribution: Distribution) {
        self.distribution = distribution;
        self.apply_configured_nodes(nodes);
    }

    fn apply_configured_nodes(&mut self, nodes: &[ConfiguredNode]) {
        let new: BTreeMap<NodeIndex, ConfiguredNode> =
            nodes.iter().map(|n| (n.index, *n)).collect();

        let removed: Vec<Node> = self
            .node_infos
            .keys()
            .filter(|node| !new.contains_key(&node.index))
            .copied()
            .collect();
        for node in removed {
            info!(cluster = %self.name, node = %node, "Node no longer configured, pruning");
            self.node_infos.remove(&node);
        }

        for configured in new.values() {
            for node_type in NodeType::ALL {
                let node = Node::new(node_type, configured.index);
                self.node_infos
                    .entry(node)
                    .and_modify(|info| info.configured_retired = configured.retired)
                    .or_insert_with(|| NodeInfo::new(node, configured.retired));
            }
        }

        self.configured = new;
    }
}

/// Group tree from config, or a flat group holding every configured node.
pub fn distribution_from_config(config: &ClusterConfig) -> Distribution {
    match &config.groups {
        Some(root) => Distribution::new(root.clone(), config.redundancy),
        None => Distribution::flat(config.nodes.iter().map(|n| n.index), config.redundancy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    fn cluster(count: u16) -> ContentCluster {
        let nodes: Vec<_> = (0..count).map(ConfiguredNode::new).collect();
        ContentCluster::new("test", &nodes, Distribution::flat(0..count, 2))
    }

    #[test]
    fn test_creates_storage_and_distributor_per_index() {
        let c = cluster(3);
        assert_eq!(c.node_infos().count(), 6);
        assert_eq!(c.node_infos_of_type(NodeType::Storage).count(), 3);
        assert!(c.is_configured(Node::distributor(2)));
        assert!(!c.is_configured(Node::storage(3)));
        assert!(matches!(
            c.require(Node::storage(3)),
            Err(ControllerError::NodeNotConfigured(_))
        ));
    }

    #[test]
    fn test_reconfiguration_prunes_and_keeps_runtime_state() {
        let mut c = cluster(3);
        c.node_info_mut(Node::storage(0)).unwrap().premature_crash_count = 2;

        let nodes = vec![ConfiguredNode::retired(0), ConfiguredNode::new(1), ConfiguredNode::new(5)];
        c.set_configured_nodes(&nodes, Distribution::flat([0, 1, 5], 2));

        assert!(!c.is_configured(Node::storage(2)));
        assert!(c.is_configured(Node::distributor(5)));
        let info = c.node_info(Node::storage(0)).unwrap();
        assert_eq!(info.premature_crash_count, 2);
        assert!(info.configured_retired);
        assert_eq!(info.effective_wanted_state().state, State::Retired);
    }
}
