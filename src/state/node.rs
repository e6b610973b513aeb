//! Node identity.

use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Index of a node within its type.
pub type NodeIndex = u16;

/// The two kinds of content nodes the controller manages.
///
/// Declaration order matters: distributors sort (and serialize) before storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Distributor,
    Storage,
}

impl NodeType {
    pub const ALL: [NodeType; 2] = [NodeType::Distributor, NodeType::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Distributor => "distributor",
            NodeType::Storage => "storage",
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, NodeType::Storage)
    }

    pub fn is_distributor(&self) -> bool {
        matches!(self, NodeType::Distributor)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "distributor" => Ok(NodeType::Distributor),
            "storage" => Ok(NodeType::Storage),
            other => Err(ControllerError::Parse(format!("unknown node type '{}'", other))),
        }
    }
}

/// A node identity: type plus index. Used as the key everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub node_type: NodeType,
    pub index: NodeIndex,
}

impl Node {
    pub fn new(node_type: NodeType, index: NodeIndex) -> Self {
        Self { node_type, index }
    }

    pub fn storage(index: NodeIndex) -> Self {
        Self::new(NodeType::Storage, index)
    }

    pub fn distributor(index: NodeIndex) -> Self {
        Self::new(NodeType::Distributor, index)
    }

    pub fn is_storage(&self) -> bool {
        self.node_type.is_storage()
    }

    pub fn is_distributor(&self) -> bool {
        self.node_type.is_distributor()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.index)
    }
}

impl FromStr for Node {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        let (node_type, index) = s
            .split_once('.')
            .ok_or_else(|| ControllerError::Parse(format!("invalid node '{}'", s)))?;
        let index = index
            .parse::<NodeIndex>()
            .map_err(|e| ControllerError::Parse(format!("invalid node index in '{}': {}", s, e)))?;
        Ok(Node::new(node_type.parse()?, index))
    }
}
