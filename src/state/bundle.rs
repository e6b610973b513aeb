//! The unit the controller versions and distributes: a baseline state, one
//! derived state per bucket space, and an optional feed block.

use super::annotated::AnnotatedClusterState;
use super::cluster_state::ClusterState;
use super::node::Node;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Reported usage of one resource on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Fraction of capacity in use, 0..=1.
    pub usage: f64,
    /// Optional friendly name, e.g. a disk mount point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ResourceUsage {
    pub fn new(usage: f64) -> Self {
        Self { usage, name: None }
    }

    pub fn named(usage: f64, name: impl Into<String>) -> Self {
        Self {
            usage,
            name: Some(name.into()),
        }
    }
}

/// A concrete node/resource pair found over its limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceExhaustion {
    pub node: Node,
    pub resource_type: String,
    pub usage: ResourceUsage,
    /// The configured limit, as shown to humans.
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_address: Option<String>,
}

impl NodeResourceExhaustion {
    /// Identity used for hysteresis and similarity: the node and the resource.
    pub fn key(&self) -> (Node, &str) {
        (self.node, self.resource_type.as_str())
    }

    fn description_prefix(&self) -> String {
        match &self.usage.name {
            Some(name) => format!("{}:{}", self.resource_type, name),
            None => self.resource_type.clone(),
        }
    }

    fn host(&self) -> &str {
        self.rpc_address.as_deref().unwrap_or("unknown hostname")
    }

    pub fn exhaustion_added_description(&self) -> String {
        format!(
            "{} on node {} [{}] is {:.1}% full (the configured limit is {:.1}%)",
            self.description_prefix(),
            self.node.index,
            self.host(),
            self.usage.usage * 100.0,
            self.limit * 100.0
        )
    }

    pub fn exhaustion_removed_description(&self) -> String {
        format!(
            "{} on node {} [{}] (<= {:.1}%)",
            self.description_prefix(),
            self.node.index,
            self.host(),
            self.limit * 100.0
        )
    }
}

/// Cluster-wide write-block decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedBlock {
    pub block_feed_in_cluster: bool,
    pub description: String,
    /// Ordered by node, then resource.
    #[serde(default)]
    pub concrete_exhaustions: Vec<NodeResourceExhaustion>,
}

impl FeedBlock {
    pub fn blocked_with(description: impl Into<String>, mut exhaustions: Vec<NodeResourceExhaustion>) -> Self {
        exhaustions.sort_by(|a, b| a.key().cmp(&b.key()));
        Self {
            block_feed_in_cluster: true,
            description: description.into(),
            concrete_exhaustions: exhaustions,
        }
    }

    pub fn not_blocked() -> Self {
        Self {
            block_feed_in_cluster: false,
            description: String::new(),
            concrete_exhaustions: Vec::new(),
        }
    }

    pub fn exhaustion_keys(&self) -> BTreeSet<(Node, &str)> {
        self.concrete_exhaustions.iter().map(|e| e.key()).collect()
    }

    /// Blocking status and exhaustion membership match; descriptions and exact
    /// usage figures are ignored.
    pub fn similar_to(&self, other: &FeedBlock) -> bool {
        self.block_feed_in_cluster == other.block_feed_in_cluster
            && self.exhaustion_keys() == other.exhaustion_keys()
    }

    /// Treats an absent feed block like one that does not block anything.
    pub fn optionals_similar(a: Option<&FeedBlock>, b: Option<&FeedBlock>) -> bool {
        let not_blocked = FeedBlock::not_blocked();
        a.unwrap_or(&not_blocked).similar_to(b.unwrap_or(&not_blocked))
    }
}

/// Bucket space names used by default.
pub const DEFAULT_SPACE: &str = "default";
pub const GLOBAL_SPACE: &str = "global";

/// Baseline state + per-bucket-space derived states + feed block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterStateBundle {
    baseline: AnnotatedClusterState,
    derived: BTreeMap<String, AnnotatedClusterState>,
    feed_block: Option<FeedBlock>,
    deferred_activation: bool,
}

impl ClusterStateBundle {
    pub fn new(
        baseline: AnnotatedClusterState,
        derived: BTreeMap<String, AnnotatedClusterState>,
        feed_block: Option<FeedBlock>,
        deferred_activation: bool,
    ) -> Self {
        Self {
            baseline,
            derived,
            feed_block,
            deferred_activation,
        }
    }

    pub fn of_baseline_only(baseline: AnnotatedClusterState) -> Self {
        Self::new(baseline, BTreeMap::new(), None, false)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.baseline.cluster_state().version()
    }

    pub fn baseline(&self) -> &AnnotatedClusterState {
        &self.baseline
    }

    pub fn baseline_state(&self) -> &ClusterState {
        self.baseline.cluster_state()
    }

    pub fn derived(&self) -> &BTreeMap<String, AnnotatedClusterState> {
        &self.derived
    }

    /// Derived state of a bucket space, falling back to the baseline.
    pub fn derived_state(&self, space: &str) -> &AnnotatedClusterState {
        self.derived.get(space).unwrap_or(&self.baseline)
    }

    pub fn feed_block(&self) -> Option<&FeedBlock> {
        self.feed_block.as_ref()
    }

    pub fn blocks_feed(&self) -> bool {
        self.feed_block
            .as_ref()
            .map(|fb| fb.block_feed_in_cluster)
            .unwrap_or(false)
    }

    pub fn deferred_activation(&self) -> bool {
        self.deferred_activation
    }

    /// Baseline and every derived state stamped with the same version.
    pub fn cloned_with_version_set(&self, version: u32) -> Self {
        Self {
            baseline: self.baseline.cloned_with_version(version),
            derived: self
                .derived
                .iter()
                .map(|(space, state)| (space.clone(), state.cloned_with_version(version)))
                .collect(),
            feed_block: self.feed_block.clone(),
            deferred_activation: self.deferred_activation,
        }
    }

    /// Apply `mapper` to the baseline and every derived state, keeping annotations.
    pub fn cloned_with_mapper<F>(&self, mapper: F) -> Self
    where
        F: Fn(&ClusterState) -> ClusterState,
    {
        let map = |annotated: &AnnotatedClusterState| {
            AnnotatedClusterState::new(
                mapper(annotated.cluster_state()),
                annotated.cluster_reason(),
                annotated.node_reasons().clone(),
            )
        };
        Self {
            baseline: map(&self.baseline),
            derived: self
                .derived
                .iter()
                .map(|(space, state)| (space.clone(), map(state)))
                .collect(),
            feed_block: self.feed_block.clone(),
            deferred_activation: self.deferred_activation,
        }
    }

    pub fn similar_to(&self, other: &ClusterStateBundle) -> bool {
        if !self.baseline.similar_to(&other.baseline) {
            return false;
        }
        if self.derived.len() != other.derived.len() {
            return false;
        }
        let derived_similar = self.derived.iter().all(|(space, state)| {
            other
                .derived
                .get(space)
                .map(|o| state.similar_to(o))
                .unwrap_or(false)
        });
        derived_similar
            && FeedBlock::optionals_similar(self.feed_block.as_ref(), other.feed_block.as_ref())
    }

    pub fn to_record(&self) -> ClusterStateBundleRecord {
        ClusterStateBundleRecord {
            baseline: self.baseline.cluster_state().to_string(),
            derived: self
                .derived
                .iter()
                .map(|(space, state)| (space.clone(), state.cluster_state().to_string()))
                .collect(),
            feed_block: self.feed_block.clone(),
            deferred_activation: self.deferred_activation,
        }
    }

    pub fn from_record(record: &ClusterStateBundleRecord) -> Result<Self> {
        let baseline = AnnotatedClusterState::with_state(ClusterState::parse(&record.baseline)?);
        let mut derived = BTreeMap::new();
        for (space, state) in &record.derived {
            derived.insert(
                space.clone(),
                AnnotatedClusterState::with_state(ClusterState::parse(state)?),
            );
        }
        Ok(Self::new(
            baseline,
            derived,
            record.feed_block.clone(),
            record.deferred_activation,
        ))
    }
}

impl fmt::Display for ClusterStateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterStateBundle('{}'", self.baseline)?;
        for (space, state) in &self.derived {
            if state != &self.baseline {
                write!(f, ", {} '{}'", space, state)?;
            }
        }
        if let Some(fb) = self.feed_block.as_ref().filter(|fb| fb.block_feed_in_cluster) {
            write!(f, ", feed blocked: '{}'", fb.description)?;
        }
        if self.deferred_activation {
            write!(f, " (deferred activation)")?;
        }
        write!(f, ")")
    }
}

/// Persistable form of a bundle: wire strings only, annotations dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateBundleRecord {
    pub baseline: String,
    #[serde(default)]
    pub derived: BTreeMap<String, String>,
    #[serde(default)]
    pub feed_block: Option<FeedBlock>,
    #[serde(default)]
    pub deferred_activation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated(s: &str) -> AnnotatedClusterState {
        AnnotatedClusterState::with_state(ClusterState::parse(s).unwrap())
    }

    fn bundle(baseline: &str, default_space: &str) -> ClusterStateBundle {
        let mut derived = BTreeMap::new();
        derived.insert(DEFAULT_SPACE.to_string(), annotated(default_space));
        derived.insert(GLOBAL_SPACE.to_string(), annotated(baseline));
        ClusterStateBundle::new(annotated(baseline), derived, None, false)
    }

    fn exhaustion(index: u16, resource: &str, usage: f64) -> NodeResourceExhaustion {
        NodeResourceExhaustion {
            node: Node::storage(index),
            resource_type: resource.to_string(),
            usage: ResourceUsage::new(usage),
            limit: 0.5,
            rpc_address: None,
        }
    }

    #[test]
    fn test_version_set_on_all_states() {
        let b = bundle("distributor:2 storage:2", "distributor:2 storage:2 .1.s:m");
        let v = b.cloned_with_version_set(42);
        assert_eq!(v.version(), 42);
        for state in v.derived().values() {
            assert_eq!(state.cluster_state().version(), 42);
        }
    }

    #[test]
    fn test_init_progress_only_difference_is_similar() {
        let a = bundle(
            "distributor:2 storage:2 .0.s:i .0.i:0.2",
            "distributor:2 storage:2 .0.s:i .0.i:0.2",
        );
        let b = bundle(
            "distributor:2 storage:2 .0.s:i .0.i:0.7",
            "distributor:2 storage:2 .0.s:i .0.i:0.7",
        );
        assert!(a.similar_to(&b));
    }

    #[test]
    fn test_derived_difference_is_not_similar() {
        let a = bundle("distributor:2 storage:2", "distributor:2 storage:2");
        let b = bundle("distributor:2 storage:2", "distributor:2 storage:2 .1.s:m");
        assert!(!a.similar_to(&b));
    }

    #[test]
    fn test_feed_block_similarity_ignores_description() {
        let a = FeedBlock::blocked_with("one", vec![exhaustion(1, "disk", 0.6)]);
        let b = FeedBlock::blocked_with("two", vec![exhaustion(1, "disk", 0.7)]);
        assert!(a.similar_to(&b));

        let c = FeedBlock::blocked_with("two", vec![exhaustion(2, "disk", 0.7)]);
        assert!(!a.similar_to(&c));

        assert!(FeedBlock::optionals_similar(None, Some(&FeedBlock::not_blocked())));
        assert!(!FeedBlock::optionals_similar(None, Some(&a)));
    }

    #[test]
    fn test_exhaustion_descriptions() {
        let mut e = exhaustion(1, "disk", 0.51);
        assert_eq!(
            e.exhaustion_added_description(),
            "disk on node 1 [unknown hostname] is 51.0% full (the configured limit is 50.0%)"
        );
        e.rpc_address = Some("host-1".into());
        e.usage.name = Some("/data".into());
        assert_eq!(
            e.exhaustion_removed_description(),
            "disk:/data on node 1 [host-1] (<= 50.0%)"
        );
    }

    #[test]
    fn test_record_round_trip_keeps_wire_states() {
        let b = bundle("version:5 distributor:2 storage:2", "version:5 distributor:2 storage:2 .1.s:m");
        let record = b.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ClusterStateBundleRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(ClusterStateBundle::from_record(&parsed).unwrap(), b);
    }
}
