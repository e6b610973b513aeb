//! State-change handler.
//!
//! Keeps each node's [`NodeInfo`] timers and counters consistent with the
//! reports, proposals and discovery changes the control loop feeds it, and
//! turns time-based conditions into events on every tick. It never caches a
//! cluster state: it only mutates node records and raises
//! "state may have changed" so the control loop regenerates.

use crate::clock::TimestampMs;
use crate::config::{GeneratorConfig, TimerConfig};
use crate::events::{Event, EventKind, EventLog};
use crate::state::{ClusterState, ClusterStateBundle, Node, NodeState, NodeType, State};
use crate::topology::{ContentCluster, NodeInfo};
use std::sync::Arc;
use tracing::{debug, info};

/// Description reported for nodes missing from service discovery for too long.
pub const NOT_IN_SLOBROK_DESCRIPTION: &str = "Node not seen in slobrok";

/// Stopping descriptions that indicate an orderly shutdown rather than a crash.
const CONTROLLED_SHUTDOWN_MARKERS: [&str; 2] = ["controlled shutdown", "SIGTERM"];

#[derive(Debug, Clone, Copy)]
struct Timers {
    stable_state_period_ms: u64,
    slobrok_grace_ms: u64,
    storage_transition_time_ms: u64,
    max_init_progress_time_ms: u64,
}

pub struct StateChangeHandler {
    timers: Timers,
    events: Arc<EventLog>,
    state_may_have_changed: bool,
}

impl StateChangeHandler {
    pub fn new(timers: &TimerConfig, generator: &GeneratorConfig, events: Arc<EventLog>) -> Self {
        Self {
            timers: Timers {
                stable_state_period_ms: timers.stable_state_period.as_millis() as u64,
                slobrok_grace_ms: timers.max_slobrok_disconnect_grace_period.as_millis() as u64,
                storage_transition_time_ms: generator
                    .transition_time(NodeType::Storage)
                    .as_millis() as u64,
                max_init_progress_time_ms: generator.max_init_progress_time.as_millis() as u64,
            },
            events,
            state_may_have_changed: false,
        }
    }

    pub fn state_may_have_changed(&self) -> bool {
        self.state_may_have_changed
    }

    /// Read and clear the "state may have changed" flag.
    pub fn take_state_may_have_changed(&mut self) -> bool {
        std::mem::take(&mut self.state_may_have_changed)
    }

    /// Force a regeneration on the next tick.
    pub fn mark_state_may_have_changed(&mut self) {
        self.state_may_have_changed = true;
    }

    /// A node reported a new state. `info.generated_state` is the state the
    /// node was last given by the controller.
    pub fn handle_new_reported_state(&mut self, info: &mut NodeInfo, new: NodeState, now: TimestampMs) {
        let old = info.reported_state.clone();
        if old == new {
            return;
        }
        let node = info.node();

        if old.state != new.state || old.description != new.description {
            info!(node = %node, from = %old.state, to = %new.state, "Reported state changed");
            self.events.add(Event::node(
                EventKind::ReportedStateChanged,
                node,
                format!("Now reporting state {}", describe(&new)),
                now,
            ));
        } else {
            debug!(node = %node, progress = new.init_progress, "Reported state details changed");
        }

        if self.is_premature_crash(info, &old, &new, now) {
            info.premature_crash_count += 1;
            self.events.add(Event::node(
                EventKind::CrashCounter,
                node,
                format!(
                    "Premature crash count is now {}",
                    info.premature_crash_count
                ),
                now,
            ));
        }

        if old.state.is_available() && new.state.is_down_or_stopping() {
            info.transition_time_ms = Some(now);
        }

        if old.state == State::Initializing && new.state.is_down_or_stopping() {
            info.recently_observed_unstable_during_init = true;
            self.events.add(Event::node(
                EventKind::CrashCounter,
                node,
                "Stop or crash during initialization detected",
                now,
            ));
        }

        if new.state == State::Initializing
            && (old.state != State::Initializing || old.init_progress != new.init_progress)
        {
            info.init_progress_time_ms = now;
        }

        if new.state == State::Up {
            if old.state != State::Up {
                info.up_since_ms = Some(now);
            }
            info.recently_observed_unstable_during_init = false;
        }

        info.reported_state = new;
        self.state_may_have_changed = true;
    }

    /// Available-to-unavailable before the node has been stable for long enough.
    fn is_premature_crash(&self, info: &NodeInfo, old: &NodeState, new: &NodeState, now: TimestampMs) -> bool {
        if !matches!(info.generated_state.state, State::Up | State::Retired) {
            return false;
        }
        if !matches!(new.state, State::Down | State::Initializing | State::Stopping) {
            return false;
        }
        if old.state == State::Stopping && new.state == State::Down {
            return false;
        }
        if new.state == State::Stopping && is_controlled_shutdown(&new.description) {
            return false;
        }
        match info.up_since_ms {
            Some(since) => now.saturating_sub(since) < self.timers.stable_state_period_ms,
            None => false,
        }
    }

    /// An operator changed the wanted state. Returns whether anything changed.
    pub fn handle_new_wanted_state(&mut self, info: &mut NodeInfo, new: NodeState, now: TimestampMs) -> bool {
        if info.wanted_state == new {
            return false;
        }
        let node = info.node();
        info!(node = %node, from = %info.wanted_state.state, to = %new.state, "Wanted state changed");
        self.events.add(Event::node(
            EventKind::WantedStateChanged,
            node,
            format!(
                "Altered wanted state from {} to {}",
                describe(&info.wanted_state),
                describe(&new)
            ),
            now,
        ));
        info.wanted_state = new;
        self.state_may_have_changed = true;
        true
    }

    pub fn handle_missing_node(&mut self, info: &mut NodeInfo, now: TimestampMs) {
        if info.missing_since_ms.is_some() {
            return;
        }
        info.missing_since_ms = Some(now);
        self.events.add(Event::node(
            EventKind::ServiceDiscovery,
            info.node(),
            "Node is no longer in slobrok",
            now,
        ));
        if self.timers.slobrok_grace_ms == 0 {
            self.report_not_in_slobrok(info, now);
        }
        self.state_may_have_changed = true;
    }

    pub fn handle_returned_node(&mut self, info: &mut NodeInfo, rpc_address: String, now: TimestampMs) {
        let was_missing = info.missing_since_ms.take().is_some();
        let moved = info.rpc_address.as_deref() != Some(rpc_address.as_str());
        if !was_missing && !moved {
            return;
        }
        self.events.add(Event::node(
            EventKind::ServiceDiscovery,
            info.node(),
            format!("Node is in slobrok at {}", rpc_address),
            now,
        ));
        info.rpc_address = Some(rpc_address);
        info.last_request_failure = None;
        // A (re)appearing process has not seen anything we sent before.
        info.reset_broadcast_bookkeeping();
        self.state_may_have_changed = true;
    }

    fn report_not_in_slobrok(&mut self, info: &mut NodeInfo, now: TimestampMs) {
        if info.reported_state.state == State::Down {
            return;
        }
        let down = NodeState::down().with_description(NOT_IN_SLOBROK_DESCRIPTION);
        self.handle_new_reported_state(info, down, now);
    }

    /// Apply every time-based rule. Returns whether anything may have changed.
    pub fn watch_timers(&mut self, cluster: &mut ContentCluster, now: TimestampMs) -> bool {
        let mut changed = false;
        let nodes = cluster.nodes();
        for node in nodes {
            let Some(info) = cluster.node_info_mut(node) else {
                continue;
            };
            changed |= self.watch_node_timers(info, now);
        }
        if changed {
            self.state_may_have_changed = true;
        }
        changed
    }

    fn watch_node_timers(&mut self, info: &mut NodeInfo, now: TimestampMs) -> bool {
        let mut changed = false;
        let node = info.node();

        if let Some(missing_since) = info.missing_since_ms {
            if info.reported_state.state != State::Down
                && now.saturating_sub(missing_since) >= self.timers.slobrok_grace_ms
            {
                self.report_not_in_slobrok(info, now);
                changed = true;
            }
        }

        if info.reported_state.state == State::Up {
            if let Some(since) = info.up_since_ms {
                let stable = now.saturating_sub(since) >= self.timers.stable_state_period_ms;
                if stable && (info.premature_crash_count > 0 || info.recently_observed_unstable_during_init) {
                    self.events.add(Event::node(
                        EventKind::CrashCounter,
                        node,
                        format!(
                            "Node has been up for {} ms; resetting crash count",
                            now.saturating_sub(since)
                        ),
                        now,
                    ));
                    info.premature_crash_count = 0;
                    info.recently_observed_unstable_during_init = false;
                    changed = true;
                }
            }
        }

        if info.reported_state.state == State::Initializing
            && self.timers.max_init_progress_time_ms > 0
            && now.saturating_sub(info.init_progress_time_ms) >= self.timers.max_init_progress_time_ms
            && info.generated_state.state != State::Down
        {
            self.events.add(Event::node(
                EventKind::InitTimeout,
                node,
                format!(
                    "No init progress for {} ms; marking node down",
                    now.saturating_sub(info.init_progress_time_ms)
                ),
                now,
            ));
            changed = true;
        }

        if node.is_storage()
            && info.generated_state.state == State::Maintenance
            && info.reported_state.state.is_down_or_stopping()
            && info.effective_wanted_state().state != State::Maintenance
        {
            if let Some(at) = info.transition_time_ms {
                if now >= at + self.timers.storage_transition_time_ms {
                    self.events.add(Event::node(
                        EventKind::GracePeriodExpired,
                        node,
                        format!(
                            "Exceeded implicit maintenance mode grace period of {} ms; marking node down",
                            self.timers.storage_transition_time_ms
                        ),
                        now,
                    ));
                    changed = true;
                }
            }
        }

        changed
    }

    /// A new version was published: emit per-node and cluster events describing the change.
    ///
    /// Bucket spaces get their own node events only where the derived state
    /// moved differently from the baseline.
    pub fn handle_new_cluster_state(
        &mut self,
        previous: &ClusterStateBundle,
        current: &ClusterStateBundle,
        now: TimestampMs,
    ) {
        let (previous_baseline, current_baseline) = (previous.baseline_state(), current.baseline_state());
        for (node, before, after) in node_changes(previous_baseline, current_baseline) {
            self.events.add(Event::node(
                EventKind::GeneratedStateChanged,
                node,
                altered_description(&before, &after),
                now,
            ));
        }

        for space in current.derived().keys() {
            let before_space = previous.derived_state(space).cluster_state();
            let after_space = current.derived_state(space).cluster_state();
            for (node, before, after) in node_changes(before_space, after_space) {
                let follows_baseline = same_state(&before, &previous_baseline.node_state(node))
                    && same_state(&after, &current_baseline.node_state(node));
                if follows_baseline {
                    continue;
                }
                self.events.add(
                    Event::node(
                        EventKind::GeneratedStateChanged,
                        node,
                        altered_description(&before, &after),
                        now,
                    )
                    .with_bucket_space(space.clone()),
                );
            }
        }

        self.events.add(Event::cluster(
            EventKind::SystemStateChanged,
            format!("New cluster state version {}: {}", current.version(), current_baseline),
            now,
        ));
    }
}

fn same_state(a: &NodeState, b: &NodeState) -> bool {
    a.state == b.state && a.description == b.description
}

/// Nodes whose state or description differs between two cluster states.
fn node_changes(previous: &ClusterState, current: &ClusterState) -> Vec<(Node, NodeState, NodeState)> {
    let mut changes = Vec::new();
    for node_type in NodeType::ALL {
        let count = previous.node_count(node_type).max(current.node_count(node_type));
        for index in 0..count {
            let node = Node::new(node_type, index);
            let before = previous.node_state(node);
            let after = current.node_state(node);
            if !same_state(&before, &after) {
                changes.push((node, before, after));
            }
        }
    }
    changes
}

fn altered_description(before: &NodeState, after: &NodeState) -> String {
    format!(
        "Altered node state in cluster state from {} to {}",
        describe(before),
        describe(after)
    )
}

fn is_controlled_shutdown(description: &str) -> bool {
    CONTROLLED_SHUTDOWN_MARKERS
        .iter()
        .any(|marker| description.contains(marker))
}

fn describe(state: &NodeState) -> String {
    if state.description.is_empty() {
        format!("'{}'", state.state)
    } else {
        format!("'{}: {}'", state.state, state.description)
    }
}
