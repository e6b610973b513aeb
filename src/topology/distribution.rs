//! Static membership: configured nodes and the group hierarchy.

use crate::state::NodeIndex;
use serde::{Deserialize, Serialize};

/// A configured node index. Each index hosts one storage and one distributor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredNode {
    pub index: NodeIndex,
    /// Retired nodes default to Retired instead of Up.
    #[serde(default)]
    pub retired: bool,
}

impl ConfiguredNode {
    pub fn new(index: NodeIndex) -> Self {
        Self {
            index,
            retired: false,
        }
    }

    pub fn retired(index: NodeIndex) -> Self {
        Self {
            index,
            retired: true,
        }
    }
}

fn default_capacity() -> f64 {
    1.0
}

/// A node group. Leaf groups hold node indices, inner groups hold subgroups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub index: u16,
    pub name: String,
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    #[serde(default)]
    pub nodes: Vec<NodeIndex>,
    #[serde(default)]
    pub subgroups: Vec<Group>,
}

impl Group {
    pub fn leaf(index: u16, name: impl Into<String>, nodes: Vec<NodeIndex>) -> Self {
        Self {
            index,
            name: name.into(),
            capacity: default_capacity(),
            nodes,
            subgroups: Vec::new(),
        }
    }

    pub fn root(subgroups: Vec<Group>) -> Self {
        Self {
            index: 0,
            name: "invalid".to_string(),
            capacity: default_capacity(),
            nodes: Vec::new(),
            subgroups,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.subgroups.is_empty()
    }

    /// Leaf groups in depth-first order.
    pub fn leaf_groups(&self) -> Vec<&Group> {
        if self.is_leaf() {
            return vec![self];
        }
        self.subgroups.iter().flat_map(|g| g.leaf_groups()).collect()
    }
}

/// The group tree of a content cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    root: Group,
    redundancy: u16,
}

impl Distribution {
    pub fn new(root: Group, redundancy: u16) -> Self {
        Self { root, redundancy }
    }

    /// A single root group holding every node.
    pub fn flat(nodes: impl IntoIterator<Item = NodeIndex>, redundancy: u16) -> Self {
        Self::new(Group::leaf(0, "invalid", nodes.into_iter().collect()), redundancy)
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn redundancy(&self) -> u16 {
        self.redundancy
    }

    /// A flat cluster has a root that directly holds its nodes.
    pub fn is_hierarchical(&self) -> bool {
        !self.root.is_leaf()
    }

    pub fn leaf_groups(&self) -> Vec<&Group> {
        self.root.leaf_groups()
    }

    pub fn group_of(&self, index: NodeIndex) -> Option<&Group> {
        self.leaf_groups()
            .into_iter()
            .find(|g| g.nodes.contains(&index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_by_three() -> Distribution {
        Distribution::new(
            Group::root(vec![
                Group::leaf(0, "g0", vec![0, 1, 2]),
                Group::leaf(1, "g1", vec![3, 4, 5]),
                Group::leaf(2, "g2", vec![6, 7, 8]),
            ]),
            2,
        )
    }

    #[test]
    fn test_flat_is_not_hierarchical() {
        let d = Distribution::flat(0..3, 2);
        assert!(!d.is_hierarchical());
        assert_eq!(d.leaf_groups().len(), 1);
    }

    #[test]
    fn test_leaf_groups_and_membership() {
        let d = three_by_three();
        assert!(d.is_hierarchical());
        assert_eq!(d.leaf_groups().len(), 3);
        assert_eq!(d.group_of(4).map(|g| g.name.as_str()), Some("g1"));
        assert!(d.group_of(9).is_none());
    }

    #[test]
    fn test_nested_groups() {
        let root = Group::root(vec![
            Group {
                subgroups: vec![Group::leaf(1, "a", vec![0]), Group::leaf(2, "b", vec![1])],
                ..Group::leaf(0, "left", vec![])
            },
            Group::leaf(3, "right", vec![2]),
        ]);
        let names: Vec<_> = root.leaf_groups().iter().map(|g| g.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "right"]);
    }
}
