//! Versioning of published cluster state bundles.

use crate::clock::TimestampMs;
use crate::state::ClusterStateBundle;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// One published bundle, newest first in [`StateVersionTracker::history`].
#[derive(Debug, Clone)]
pub struct ClusterStateHistoryEntry {
    bundle: Arc<ClusterStateBundle>,
    time_ms: TimestampMs,
    predecessor: Option<Arc<ClusterStateBundle>>,
}

impl ClusterStateHistoryEntry {
    pub fn bundle(&self) -> &ClusterStateBundle {
        &self.bundle
    }

    pub fn time_ms(&self) -> TimestampMs {
        self.time_ms
    }

    /// The bundle published before this one, if any.
    pub fn predecessor(&self) -> Option<&ClusterStateBundle> {
        self.predecessor.as_deref()
    }

    pub fn version(&self) -> u32 {
        self.bundle.version()
    }
}

/// Holds the published bundle and the not yet published candidate, and
/// assigns strictly increasing versions.
#[derive(Debug)]
pub struct StateVersionTracker {
    current_version: u32,
    published: Arc<ClusterStateBundle>,
    has_published: bool,
    candidate: Option<ClusterStateBundle>,
    lowest_observed_distribution_bits: u16,
    max_history_entries: usize,
    history: VecDeque<ClusterStateHistoryEntry>,
}

impl StateVersionTracker {
    pub fn new(ideal_distribution_bits: u16, max_history_entries: usize) -> Self {
        Self {
            current_version: 1,
            published: Arc::new(ClusterStateBundle::empty()),
            has_published: false,
            candidate: None,
            lowest_observed_distribution_bits: ideal_distribution_bits,
            max_history_entries,
            history: VecDeque::new(),
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Version the next promotion will get.
    pub fn next_version(&self) -> u32 {
        self.current_version + 1
    }

    pub fn published_bundle(&self) -> &ClusterStateBundle {
        &self.published
    }

    pub fn published_bundle_arc(&self) -> Arc<ClusterStateBundle> {
        Arc::clone(&self.published)
    }

    pub fn has_published(&self) -> bool {
        self.has_published
    }

    pub fn candidate(&self) -> Option<&ClusterStateBundle> {
        self.candidate.as_ref()
    }

    pub fn lowest_observed_distribution_bits(&self) -> u16 {
        self.lowest_observed_distribution_bits
    }

    pub fn history(&self) -> impl Iterator<Item = &ClusterStateHistoryEntry> {
        self.history.iter()
    }

    /// Continue numbering from a version read back from the durable store.
    /// Any pending candidate is discarded.
    pub fn set_version_retrieved_from_store(&mut self, version: u32) {
        self.current_version = version.max(1);
        self.candidate = None;
    }

    /// Adopt a bundle read back from the durable store as the published one.
    pub fn set_published_bundle_from_store(&mut self, bundle: ClusterStateBundle) {
        self.lowest_observed_distribution_bits = self
            .lowest_observed_distribution_bits
            .min(bundle.baseline_state().distribution_bits());
        self.published = Arc::new(bundle);
        self.has_published = true;
        self.candidate = None;
    }

    pub fn update_latest_candidate_state_bundle(&mut self, bundle: ClusterStateBundle) {
        self.candidate = Some(bundle);
    }

    /// The candidate stamped with the version it would be published as.
    pub fn candidate_with_next_version(&self) -> Option<ClusterStateBundle> {
        self.candidate
            .as_ref()
            .map(|c| c.cloned_with_version_set(self.next_version()))
    }

    /// Whether the candidate differs structurally from what is published.
    pub fn candidate_changed_enough_from_current_to_warrant_publish(&self) -> bool {
        match &self.candidate {
            Some(candidate) => !self.has_published || !self.published.similar_to(candidate),
            None => false,
        }
    }

    /// Publish the candidate as the next version. Returns the published bundle,
    /// or `None` when there is no candidate.
    pub fn promote_candidate_to_versioned_state(&mut self, now_ms: TimestampMs) -> Option<Arc<ClusterStateBundle>> {
        let candidate = self.candidate.take()?;
        let version = self.next_version();
        let bundle = Arc::new(candidate.cloned_with_version_set(version));

        self.lowest_observed_distribution_bits = self
            .lowest_observed_distribution_bits
            .min(bundle.baseline_state().distribution_bits());

        let predecessor = self.has_published.then(|| Arc::clone(&self.published));
        self.history.push_front(ClusterStateHistoryEntry {
            bundle: Arc::clone(&bundle),
            time_ms: now_ms,
            predecessor,
        });
        while self.history.len() > self.max_history_entries {
            let dropped = self.history.pop_back();
            debug!(version = ?dropped.map(|e| e.version()), "Dropped cluster state history entry");
        }

        self.current_version = version;
        self.published = Arc::clone(&bundle);
        self.has_published = true;
        info!(version, state = %bundle.baseline_state(), "Promoted candidate cluster state");
        Some(bundle)
    }
}
