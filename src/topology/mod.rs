//! Cluster Topology Model.
//!
//! Static configuration (configured nodes, group tree) together with the
//! mutable [`NodeInfo`] record of every node, owned by [`ContentCluster`].

mod content_cluster;
mod distribution;
mod node_info;

pub use content_cluster::{distribution_from_config, ContentCluster};
pub use distribution::{ConfiguredNode, Distribution, Group};
pub use node_info::NodeInfo;
