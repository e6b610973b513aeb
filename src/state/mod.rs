//! Cluster state data model.
//!
//! - [`Node`] / [`NodeType`]: node identity
//! - [`NodeState`] / [`State`]: per-node state and the "worseness" order
//! - [`ClusterState`]: the versioned cluster-wide state and its wire format
//! - [`AnnotatedClusterState`]: a cluster state plus diagnostic reasons
//! - [`ClusterStateBundle`]: baseline + derived bucket-space states + feed block

mod annotated;
mod bundle;
mod cluster_state;
mod node;
mod node_state;

pub use annotated::{AnnotatedClusterState, ClusterStateReason, NodeStateReason};
pub use bundle::{
    ClusterStateBundle, ClusterStateBundleRecord, FeedBlock, NodeResourceExhaustion,
    ResourceUsage, DEFAULT_SPACE, GLOBAL_SPACE,
};
pub use cluster_state::ClusterState;
pub use node::{Node, NodeIndex, NodeType};
pub use node_state::{
    escape_description, unescape_description, NodeState, State, DEFAULT_DISTRIBUTION_BITS,
    LISTING_BUCKETS_INIT_PROGRESS_LIMIT,
};
