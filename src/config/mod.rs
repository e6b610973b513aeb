//! Configuration module for the fleet controller.

use crate::error::{ControllerError, Result};
use crate::state::NodeType;
use crate::topology::{ConfiguredNode, Group};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a fleet controller instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Index of this controller among the cluster's controllers; used for master votes.
    #[serde(default)]
    pub controller_index: u16,
    /// Static cluster membership and topology.
    pub cluster: ClusterConfig,
    /// Cluster state generation parameters.
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// Timers driving the state-change handler and the control loop.
    #[serde(default)]
    pub timers: TimerConfig,
    /// Resource exhaustion feed blocking.
    #[serde(default)]
    pub feed_block: FeedBlockConfig,
    /// State broadcasting.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Bounded histories.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ControllerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ControllerError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// A flat (single group) cluster with `node_count` storage and distributor nodes.
    pub fn for_flat_cluster(name: &str, node_count: u16) -> Self {
        Self {
            cluster: ClusterConfig {
                name: name.to_string(),
                nodes: (0..node_count).map(ConfiguredNode::new).collect(),
                ..ClusterConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.generator.validate()?;
        self.feed_block.validate()?;
        Ok(())
    }
}

/// Static cluster membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Content cluster name.
    pub name: String,
    /// Configured node indices; each index has one storage and one distributor node.
    pub nodes: Vec<ConfiguredNode>,
    /// Hierarchical group layout; `None` means one flat group.
    #[serde(default)]
    pub groups: Option<Group>,
    /// Bucket spaces that get a derived state.
    #[serde(default = "default_bucket_spaces")]
    pub bucket_spaces: Vec<String>,
    /// Copies kept of each bucket.
    #[serde(default = "default_redundancy")]
    pub redundancy: u16,
}

fn default_bucket_spaces() -> Vec<String> {
    vec!["default".to_string(), "global".to_string()]
}

fn default_redundancy() -> u16 {
    2
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "content".to_string(),
            nodes: Vec::new(),
            groups: None,
            bucket_spaces: default_bucket_spaces(),
            redundancy: default_redundancy(),
        }
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ControllerError::InvalidConfig {
                field: "cluster.name".to_string(),
                reason: "Cluster name must be non-empty".to_string(),
            });
        }

        if self.nodes.is_empty() {
            return Err(ControllerError::InvalidConfig {
                field: "cluster.nodes".to_string(),
                reason: "At least one node must be configured".to_string(),
            });
        }

        let mut indices = BTreeSet::new();
        for node in &self.nodes {
            if !indices.insert(node.index) {
                return Err(ControllerError::InvalidConfig {
                    field: "cluster.nodes".to_string(),
                    reason: format!("Node index {} configured more than once", node.index),
                });
            }
        }

        if let Some(root) = &self.groups {
            let mut grouped = BTreeSet::new();
            for leaf in root.leaf_groups() {
                for &index in &leaf.nodes {
                    if !indices.contains(&index) {
                        return Err(ControllerError::InvalidConfig {
                            field: "cluster.groups".to_string(),
                            reason: format!("Group '{}' references unconfigured node {}", leaf.name, index),
                        });
                    }
                    if !grouped.insert(index) {
                        return Err(ControllerError::InvalidConfig {
                            field: "cluster.groups".to_string(),
                            reason: format!("Node {} is in more than one group", index),
                        });
                    }
                }
            }
            if let Some(missing) = indices.difference(&grouped).next() {
                return Err(ControllerError::InvalidConfig {
                    field: "cluster.groups".to_string(),
                    reason: format!("Node {} is not in any leaf group", missing),
                });
            }
        }

        Ok(())
    }
}

/// Parameters for cluster state generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Minimum available storage nodes before the cluster is marked down.
    pub min_storage_nodes_up: usize,
    /// Minimum available distributors before the cluster is marked down.
    pub min_distributor_nodes_up: usize,
    /// Minimum available ratio of configured storage nodes.
    pub min_ratio_of_storage_nodes_up: f64,
    /// Minimum available ratio of configured distributors.
    pub min_ratio_of_distributor_nodes_up: f64,
    /// Leaf groups below this live ratio are taken down entirely. 0 disables.
    pub min_node_ratio_per_group: f64,
    /// Distribution bit count to converge to.
    pub ideal_distribution_bits: u16,
    /// Crash count above which a node is kept down. 0 disables.
    pub max_premature_crashes: u32,
    /// Initializing without progress for longer than this counts as down. Zero disables.
    #[serde(with = "humantime_serde")]
    pub max_init_progress_time: Duration,
    /// Grace period during which a storage node that went away is shown in maintenance.
    #[serde(with = "humantime_serde")]
    pub storage_transition_time: Duration,
    /// Recorded for distributors; they never get implicit maintenance.
    #[serde(with = "humantime_serde")]
    pub distributor_transition_time: Duration,
    /// When set, a leaf group with more than this many nodes safely in maintenance
    /// has its remaining nodes put in maintenance too.
    #[serde(default)]
    pub safe_maintenance_group_threshold: Option<usize>,
    /// Put storage nodes with pending global merges in maintenance in the default space.
    #[serde(default)]
    pub maintenance_when_pending_global_merges: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            min_storage_nodes_up: 1,
            min_distributor_nodes_up: 1,
            min_ratio_of_storage_nodes_up: 0.0,
            min_ratio_of_distributor_nodes_up: 0.0,
            min_node_ratio_per_group: 0.0,
            ideal_distribution_bits: 16,
            max_premature_crashes: 4,
            max_init_progress_time: Duration::from_secs(60),
            storage_transition_time: Duration::from_secs(30),
            distributor_transition_time: Duration::ZERO,
            safe_maintenance_group_threshold: None,
            maintenance_when_pending_global_merges: false,
        }
    }
}

impl GeneratorConfig {
    pub fn transition_time(&self, node_type: NodeType) -> Duration {
        match node_type {
            NodeType::Storage => self.storage_transition_time,
            NodeType::Distributor => self.distributor_transition_time,
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("generator.min_ratio_of_storage_nodes_up", self.min_ratio_of_storage_nodes_up),
            ("generator.min_ratio_of_distributor_nodes_up", self.min_ratio_of_distributor_nodes_up),
            ("generator.min_node_ratio_per_group", self.min_node_ratio_per_group),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ControllerError::InvalidConfig {
                    field: field.to_string(),
                    reason: format!("Ratio {} is outside [0, 1]", value),
                });
            }
        }

        if !(1..=32).contains(&self.ideal_distribution_bits) {
            return Err(ControllerError::InvalidConfig {
                field: "generator.ideal_distribution_bits".to_string(),
                reason: format!("{} is outside 1..=32", self.ideal_distribution_bits),
            });
        }

        Ok(())
    }
}

/// Timers used by the state-change handler and the control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// A node must stay up this long before a crash is no longer premature.
    #[serde(with = "humantime_serde")]
    pub stable_state_period: Duration,
    /// How long a node may be missing from service discovery before it is reported down.
    #[serde(with = "humantime_serde")]
    pub max_slobrok_disconnect_grace_period: Duration,
    /// Control loop tick interval.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Timeout for a single long-poll node state request.
    #[serde(with = "humantime_serde")]
    pub get_node_state_timeout: Duration,
    /// Timeout for publish and activate calls.
    #[serde(with = "humantime_serde")]
    pub set_state_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            stable_state_period: Duration::from_secs(2 * 60 * 60),
            max_slobrok_disconnect_grace_period: Duration::from_secs(60),
            tick_interval: Duration::from_millis(100),
            get_node_state_timeout: Duration::from_secs(30),
            set_state_timeout: Duration::from_secs(10),
        }
    }
}

/// Resource-exhaustion feed blocking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedBlockConfig {
    /// Enable cluster-wide feed blocking.
    pub enabled: bool,
    /// Per-resource usage limit, as a fraction. Unlisted resources are never exhausted.
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
    /// Once blocking, a resource must fall below `limit * (1 - hysteresis)` to unblock.
    pub hysteresis: f64,
}

impl Default for FeedBlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: BTreeMap::new(),
            hysteresis: 0.01,
        }
    }
}

impl FeedBlockConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.hysteresis) {
            return Err(ControllerError::InvalidConfig {
                field: "feed_block.hysteresis".to_string(),
                reason: format!("{} is outside [0, 1)", self.hysteresis),
            });
        }
        for (resource, limit) in &self.limits {
            if !(*limit > 0.0 && *limit <= 1.0) {
                return Err(ControllerError::InvalidConfig {
                    field: format!("feed_block.limits.{}", resource),
                    reason: format!("{} is outside (0, 1]", limit),
                });
            }
        }
        Ok(())
    }
}

/// Cluster state broadcasting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Publish new states with deferred activation and send explicit activations.
    pub two_phase_transitions: bool,
    /// Upper bound on nodes named in a deadline-exceeded error.
    pub max_non_converged_nodes_in_error: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            two_phase_transitions: false,
            max_non_converged_nodes_in_error: 10,
        }
    }
}

/// Bounded history sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Published cluster state versions to remember.
    pub max_entries: usize,
    /// Human-readable events to remember.
    pub max_events: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            max_events: 1000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
