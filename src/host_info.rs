//! Host info reported by nodes alongside their state.
//!
//! Storage nodes report resource usage, distributors report per storage node
//! and per bucket space merge statistics:
//!
//! ```json
//! {
//!   "content-node": { "resource-usage": { "disk": { "usage": 0.51, "name": "/data" } } },
//!   "distributor": {
//!     "storage-nodes": [
//!       { "node-index": 0, "bucket-spaces": [ { "name": "global", "buckets": { "total": 10, "pending": 2 } } ] }
//!     ]
//!   }
//! }
//! ```

use crate::error::Result;
use crate::state::{Node, NodeIndex, ResourceUsage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Parsed host info. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(rename = "content-node", default)]
    pub content_node: ContentNodeInfo,
    #[serde(default)]
    pub distributor: DistributorInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentNodeInfo {
    #[serde(rename = "resource-usage", default)]
    pub resource_usage: BTreeMap<String, ResourceUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributorInfo {
    #[serde(rename = "storage-nodes", default)]
    pub storage_nodes: Vec<StorageNodeStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNodeStats {
    #[serde(rename = "node-index")]
    pub node_index: NodeIndex,
    #[serde(rename = "bucket-spaces", default)]
    pub bucket_spaces: Vec<BucketSpaceStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSpaceStats {
    pub name: String,
    /// Absent when the distributor has no valid statistics for the space yet.
    #[serde(default)]
    pub buckets: Option<BucketStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub total: u64,
    pub pending: u64,
}

impl BucketStats {
    fn merge(&mut self, other: &BucketStats) {
        self.total = self.total.saturating_add(other.total);
        self.pending = self.pending.saturating_add(other.pending);
    }
}

impl HostInfo {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Malformed payloads count as "nothing reported".
    pub fn parse_or_empty(node: Node, json: &str) -> Self {
        if json.trim().is_empty() {
            return Self::default();
        }
        match Self::parse(json) {
            Ok(info) => info,
            Err(e) => {
                warn!(node = %node, error = %e, "Ignoring malformed host info");
                Self::default()
            }
        }
    }

    pub fn resource_usage(&self) -> &BTreeMap<String, ResourceUsage> {
        &self.content_node.resource_usage
    }
}

/// Latest merge statistics per distributor, queryable per storage node.
#[derive(Debug, Clone, Default)]
pub struct ClusterStatsAggregator {
    by_distributor: BTreeMap<NodeIndex, Vec<StorageNodeStats>>,
}

impl ClusterStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything previously reported by `distributor`.
    pub fn update_from_distributor(&mut self, distributor: NodeIndex, host_info: &HostInfo) {
        self.by_distributor
            .insert(distributor, host_info.distributor.storage_nodes.clone());
    }

    pub fn remove_distributor(&mut self, distributor: NodeIndex) {
        self.by_distributor.remove(&distributor);
    }

    /// Summed statistics for one storage node in one bucket space.
    pub fn bucket_stats(&self, storage_index: NodeIndex, space: &str) -> Option<BucketStats> {
        let mut total: Option<BucketStats> = None;
        for nodes in self.by_distributor.values() {
            let spaces = nodes
                .iter()
                .filter(|n| n.node_index == storage_index)
                .flat_map(|n| n.bucket_spaces.iter())
                .filter(|s| s.name == space);
            for stats in spaces.filter_map(|s| s.buckets.as_ref()) {
                total.get_or_insert_with(BucketStats::default).merge(stats);
            }
        }
        total
    }

    pub fn has_pending_buckets(&self, storage_index: NodeIndex, space: &str) -> bool {
        self.bucket_stats(storage_index, space)
            .map(|s| s.pending > 0)
            .unwrap_or(false)
    }
}
