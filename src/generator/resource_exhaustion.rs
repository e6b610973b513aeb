//! Feed blocking from reported resource usage.

use crate::config::FeedBlockConfig;
use crate::state::{FeedBlock, Node, NodeResourceExhaustion};
use crate::topology::{ContentCluster, NodeInfo};
use std::collections::BTreeSet;

/// At most this many exhaustions are spelled out in a feed block description.
pub const MAX_EXHAUSTION_DESCRIPTIONS: usize = 3;

/// Decides whether the cluster should block feed.
///
/// Hysteresis is keyed on the exhaustions of the previously published feed
/// block: a node/resource pair that was already blocking must fall to
/// `limit * (1 - hysteresis)` before it stops blocking.
pub struct ResourceExhaustionCalculator<'a> {
    config: &'a FeedBlockConfig,
    previously_exhausted: BTreeSet<(Node, &'a str)>,
}

impl<'a> ResourceExhaustionCalculator<'a> {
    pub fn new(config: &'a FeedBlockConfig, previous: Option<&'a FeedBlock>) -> Self {
        let previously_exhausted = previous
            .map(|fb| fb.exhaustion_keys())
            .unwrap_or_default();
        Self {
            config,
            previously_exhausted,
        }
    }

    /// `None` when feed blocking is disabled or nothing is exhausted.
    pub fn infer_feed_block(&self, cluster: &ContentCluster) -> Option<FeedBlock> {
        if !self.config.enabled {
            return None;
        }
        let exhaustions: Vec<NodeResourceExhaustion> = cluster
            .node_infos()
            .filter(|info| info.is_storage())
            .filter(|info| node_may_contribute(info))
            .flat_map(|info| self.exhaustions_for_node(info))
            .collect();
        if exhaustions.is_empty() {
            return None;
        }

        let mut block = FeedBlock::blocked_with(String::new(), exhaustions);
        block.description = describe(&block.concrete_exhaustions);
        Some(block)
    }

    /// Every configured resource on `info` whose usage is over its effective limit.
    pub fn exhaustions_for_node(&self, info: &NodeInfo) -> Vec<NodeResourceExhaustion> {
        let node = info.node();
        info.host_info
            .resource_usage()
            .iter()
            .filter_map(|(resource, usage)| {
                let limit = *self.config.limits.get(resource)?;
                let effective = self.effective_limit(node, resource, limit);
                (usage.usage > effective).then(|| NodeResourceExhaustion {
                    node,
                    resource_type: resource.clone(),
                    usage: usage.clone(),
                    limit,
                    rpc_address: info.rpc_address.clone(),
                })
            })
            .collect()
    }

    fn effective_limit(&self, node: Node, resource: &str, limit: f64) -> f64 {
        if self.previously_exhausted.contains(&(node, resource)) {
            limit * (1.0 - self.config.hysteresis)
        } else {
            limit
        }
    }
}

/// Usage only counts for nodes that are, and are meant to be, serving.
fn node_may_contribute(info: &NodeInfo) -> bool {
    info.reported_state.state.is_up_ish() && info.effective_wanted_state().state.is_up_ish()
}

fn describe(exhaustions: &[NodeResourceExhaustion]) -> String {
    let mut description = exhaustions
        .iter()
        .take(MAX_EXHAUSTION_DESCRIPTIONS)
        .map(|e| e.exhaustion_added_description())
        .collect::<Vec<_>>()
        .join(", ");
    if exhaustions.len() > MAX_EXHAUSTION_DESCRIPTIONS {
        description.push_str(&format!(
            " (... and {} more)",
            exhaustions.len() - MAX_EXHAUSTION_DESCRIPTIONS
        ));
    }
    description
}
