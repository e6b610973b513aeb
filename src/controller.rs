//! The fleet controller control loop.
//!
//! [`FleetController`] owns every piece of mutable controller state: the
//! cluster topology with its per-node records, the state-change handler, the
//! version tracker, the broadcaster and the pending convergence tasks. Only
//! [`FleetController::tick`] mutates them. Everything arriving from outside
//! (operator proposals, pushed node reports, service discovery changes, RPC
//! replies) is queued on channels and drained at the start of the next tick.
//!
//! One tick:
//!
//! 1. Observe leadership changes (bootstrap from the store on gain, fail
//!    pending tasks on loss).
//! 2. Apply RPC replies and queued inputs.
//! 3. Issue node state long-polls for nodes without one outstanding.
//! 4. Run the handler's timers.
//! 5. Regenerate the candidate bundle if anything may have changed.
//! 6. As leader with a connected store: persist and publish the candidate if
//!    it differs enough from the published bundle, then broadcast.
//! 7. Detect convergence and answer convergence tasks.

use crate::broadcast::{BroadcastRequest, ConvergenceTasks, SystemStateBroadcaster};
use crate::clock::{Clock, TimestampMs};
use crate::communicator::{NodeCommunicator, NodeStateReply, RpcReply};
use crate::config::{ClusterConfig, ControllerConfig};
use crate::election::LeadershipWatcher;
use crate::error::{ControllerError, Result};
use crate::events::{Event, EventKind, EventLog};
use crate::generator::{BucketSpaceStateDeriver, ClusterStateGenerator, Params, ResourceExhaustionCalculator};
use crate::handler::StateChangeHandler;
use crate::host_info::{ClusterStatsAggregator, HostInfo};
use crate::state::{ClusterStateBundle, FeedBlock, Node, NodeState};
use crate::store::{CoordinationStore, DatabaseHandler};
use crate::topology::{distribution_from_config, ContentCluster};
use crate::version_tracker::StateVersionTracker;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of a wanted state proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantedStateOutcome {
    Changed,
    /// The node already had exactly this wanted state.
    AlreadySet,
}

/// Input queued for the control loop.
#[derive(Debug)]
pub enum ControllerInput {
    /// A node pushed its state outside of a long-poll.
    ReportNodeState { node: Node, reply: NodeStateReply },
    NodeDiscovered { node: Node, address: String },
    NodeMissing { node: Node },
    ProposeWantedState {
        node: Node,
        state: NodeState,
        reply: oneshot::Sender<Result<WantedStateOutcome>>,
    },
    AwaitConvergence {
        timeout: Duration,
        reply: oneshot::Sender<Result<u32>>,
    },
    Reconfigure {
        cluster: ClusterConfig,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct PendingAwait {
    deadline_ms: TimestampMs,
    reply: oneshot::Sender<Result<u32>>,
}

pub struct FleetController {
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    cluster: ContentCluster,
    handler: StateChangeHandler,
    tracker: StateVersionTracker,
    broadcaster: SystemStateBroadcaster,
    tasks: ConvergenceTasks,
    database: DatabaseHandler,
    communicator: Arc<dyn NodeCommunicator>,
    leadership: LeadershipWatcher,
    is_leader: bool,
    events: Arc<EventLog>,
    stats: ClusterStatsAggregator,
    bucket_spaces: BucketSpaceStateDeriver,
    inbox_tx: mpsc::UnboundedSender<ControllerInput>,
    inbox_rx: mpsc::UnboundedReceiver<ControllerInput>,
    rpc_tx: mpsc::UnboundedSender<RpcReply>,
    rpc_rx: mpsc::UnboundedReceiver<RpcReply>,
    in_flight_broadcasts: usize,
    pending_awaits: Vec<PendingAwait>,
    /// Publish on the next opportunity even if the candidate is similar.
    must_publish: bool,
    host_info_changed: bool,
}

impl FleetController {
    pub fn new(
        config: ControllerConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn CoordinationStore>,
        communicator: Arc<dyn NodeCommunicator>,
        leadership: LeadershipWatcher,
    ) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventLog::new(config.history.max_events));
        let cluster = ContentCluster::from_config(&config.cluster);
        let handler = StateChangeHandler::new(&config.timers, &config.generator, events.clone());
        let tracker = StateVersionTracker::new(
            config.generator.ideal_distribution_bits,
            config.history.max_entries,
        );
        let bucket_spaces = BucketSpaceStateDeriver::new(
            config.cluster.bucket_spaces.clone(),
            config.generator.maintenance_when_pending_global_merges,
        );
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();

        info!(
            cluster = %cluster.name(),
            nodes = cluster.configured_node_count(),
            controller = config.controller_index,
            "Fleet controller created"
        );

        Ok(Self {
            tasks: ConvergenceTasks::new(config.broadcast.max_non_converged_nodes_in_error),
            broadcaster: SystemStateBroadcaster::new(events.clone()),
            database: DatabaseHandler::new(store),
            clock,
            cluster,
            handler,
            tracker,
            communicator,
            leadership,
            is_leader: false,
            events,
            stats: ClusterStatsAggregator::new(),
            bucket_spaces,
            inbox_tx,
            inbox_rx,
            rpc_tx,
            rpc_rx,
            in_flight_broadcasts: 0,
            pending_awaits: Vec::new(),
            must_publish: false,
            host_info_changed: false,
            config,
        })
    }

    /// A cloneable handle for talking to the control loop from other tasks.
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            inbox: self.inbox_tx.clone(),
            events: self.events.clone(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn cluster(&self) -> &ContentCluster {
        &self.cluster
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn version_tracker(&self) -> &StateVersionTracker {
        &self.tracker
    }

    pub fn broadcaster(&self) -> &SystemStateBroadcaster {
        &self.broadcaster
    }

    pub fn published_bundle(&self) -> &ClusterStateBundle {
        self.tracker.published_bundle()
    }

    /// The freshly generated, not necessarily published, bundle.
    ///
    /// While the cluster is down, published versions only change when the
    /// down-ness itself does; this is the place to look for the live picture.
    pub fn candidate_bundle(&self) -> Option<&ClusterStateBundle> {
        self.tracker.candidate()
    }

    pub fn pending_convergence_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(cluster = %self.cluster.name(), "Fleet controller starting");

        let mut ticker = tokio::time::interval(self.config.timers.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!(cluster = %self.cluster.name(), "Fleet controller shutting down");
                    break;
                }
            }
        }

        self.tasks.fail_all(|| ControllerError::ChannelClosed);
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self) {
        let now = self.clock.now_ms();

        self.check_leadership(now).await;
        self.process_rpc_replies(now);
        self.process_inbox(now).await;
        self.issue_node_state_requests();
        self.handler.watch_timers(&mut self.cluster, now);

        let may_have_changed = self.handler.take_state_may_have_changed();
        if may_have_changed
            || std::mem::take(&mut self.host_info_changed)
            || self.tracker.candidate().is_none()
        {
            self.regenerate_candidate(now);
        }

        if self.is_leader {
            self.publish_if_required(now).await;
            self.send_broadcasts();
            self.broadcaster.check_convergence(&mut self.cluster, now);
        }

        self.register_pending_awaits(now);
        self.resolve_convergence_tasks(now);
    }

    /// Wait for every publish and activation in flight to answer and apply
    /// the replies. Node state replies that arrive meanwhile are applied too.
    pub async fn await_broadcast_replies(&mut self) {
        while self.in_flight_broadcasts > 0 {
            let Some(reply) = self.rpc_rx.recv().await else {
                break;
            };
            let now = self.clock.now_ms();
            self.handle_rpc_reply(reply, now);
        }
    }

    async fn check_leadership(&mut self, now: TimestampMs) {
        let leader = self.leadership.observe();
        if leader == self.is_leader {
            return;
        }
        self.is_leader = leader;
        if leader {
            self.on_leadership_gained(now).await;
        } else {
            self.on_leadership_lost(now);
        }
    }

    async fn on_leadership_gained(&mut self, now: TimestampMs) {
        info!(cluster = %self.cluster.name(), "Gained leadership; loading state from coordination store");

        let stored_version = self.database.retrieve_latest_version().await;
        let stored_bundle = self.database.retrieve_last_published_state_bundle().await;
        let version = stored_version
            .max(stored_bundle.version())
            .max(self.tracker.current_version());
        self.tracker.set_version_retrieved_from_store(version);
        if stored_bundle.version() > 0 {
            self.tracker.set_published_bundle_from_store(stored_bundle);
        }

        if self.database.is_connected() {
            let wanted = self.database.retrieve_wanted_states().await;
            for node in self.cluster.nodes() {
                let state = wanted.get(&node).cloned().unwrap_or_else(NodeState::up);
                if let Some(info) = self.cluster.node_info_mut(node) {
                    self.handler.handle_new_wanted_state(info, state, now);
                }
            }
        }

        let index = self.config.controller_index;
        self.database.store_master_vote(index, index).await;

        self.must_publish = true;
        self.handler.mark_state_may_have_changed();
        self.events.add(Event::cluster(
            EventKind::Leadership,
            format!("This controller (index {}) is now cluster leader", index),
            now,
        ));
    }

    fn on_leadership_lost(&mut self, now: TimestampMs) {
        warn!(cluster = %self.cluster.name(), "Lost leadership; failing pending tasks");

        self.tasks.fail_all(|| ControllerError::LeadershipLost);
        for pending in self.pending_awaits.drain(..) {
            let _ = pending.reply.send(Err(ControllerError::LeadershipLost));
        }
        self.broadcaster.reset();
        for info in self.cluster.node_infos_mut() {
            info.reset_broadcast_bookkeeping();
        }
        self.must_publish = false;
        self.events.add(Event::cluster(
            EventKind::Leadership,
            format!(
                "This controller (index {}) is no longer cluster leader",
                self.config.controller_index
            ),
            now,
        ));
    }

    fn process_rpc_replies(&mut self, now: TimestampMs) {
        while let Ok(reply) = self.rpc_rx.try_recv() {
            self.handle_rpc_reply(reply, now);
        }
    }

    fn handle_rpc_reply(&mut self, reply: RpcReply, now: TimestampMs) {
        match reply {
            RpcReply::NodeState { node, result } => self.handle_node_state_reply(node, result, now),
            RpcReply::SetClusterState { node, version, result } => {
                self.in_flight_broadcasts = self.in_flight_broadcasts.saturating_sub(1);
                if self.is_leader {
                    self.broadcaster
                        .handle_set_state_reply(&mut self.cluster, node, version, result);
                }
            }
            RpcReply::Activate { node, version, result } => {
                self.in_flight_broadcasts = self.in_flight_broadcasts.saturating_sub(1);
                if self.is_leader {
                    self.broadcaster
                        .handle_activation_reply(&mut self.cluster, node, version, result);
                }
            }
        }
    }

    fn handle_node_state_reply(&mut self, node: Node, result: Result<NodeStateReply>, now: TimestampMs) {
        let Some(info) = self.cluster.node_info_mut(node) else {
            return;
        };
        info.pending_node_state_request = false;
        match result {
            Ok(reply) => self.apply_node_report(node, reply, now),
            Err(e) => {
                debug!(node = %node, error = %e, "Node state request failed");
                info.last_request_failure = Some(e.to_string());
                let down = NodeState::down().with_description(e.to_string());
                self.handler.handle_new_reported_state(info, down, now);
            }
        }
    }

    fn apply_node_report(&mut self, node: Node, reply: NodeStateReply, now: TimestampMs) {
        let Some(info) = self.cluster.node_info_mut(node) else {
            warn!(node = %node, "Ignoring report from unconfigured node");
            return;
        };
        if !reply.host_info.trim().is_empty() {
            let host_info = HostInfo::parse_or_empty(node, &reply.host_info);
            if node.is_distributor() {
                self.stats.update_from_distributor(node.index, &host_info);
            }
            if info.host_info != host_info {
                info.host_info = host_info;
                self.host_info_changed = true;
            }
        }
        self.handler.handle_new_reported_state(info, reply.state, now);
    }

    async fn process_inbox(&mut self, now: TimestampMs) {
        while let Ok(input) = self.inbox_rx.try_recv() {
            match input {
                ControllerInput::ReportNodeState { node, reply } => {
                    self.apply_node_report(node, reply, now);
                }
                ControllerInput::NodeDiscovered { node, address } => {
                    if let Some(info) = self.cluster.node_info_mut(node) {
                        self.handler.handle_returned_node(info, address, now);
                    }
                }
                ControllerInput::NodeMissing { node } => {
                    if let Some(info) = self.cluster.node_info_mut(node) {
                        self.handler.handle_missing_node(info, now);
                    }
                    if node.is_distributor() {
                        self.stats.remove_distributor(node.index);
                        self.host_info_changed = true;
                    }
                }
                ControllerInput::ProposeWantedState { node, state, reply } => {
                    let result = self.propose_wanted_state(node, state).await;
                    let _ = reply.send(result);
                }
                ControllerInput::AwaitConvergence { timeout, reply } => {
                    self.pending_awaits.push(PendingAwait {
                        deadline_ms: now + timeout.as_millis() as u64,
                        reply,
                    });
                }
                ControllerInput::Reconfigure { cluster, reply } => {
                    let _ = reply.send(self.reconfigure(cluster));
                }
            }
        }
    }

    /// Validate and apply an operator's wanted state for `node`, persisting
    /// wanted states when it changed.
    pub async fn propose_wanted_state(&mut self, node: Node, state: NodeState) -> Result<WantedStateOutcome> {
        if !self.is_leader {
            return Err(ControllerError::NotLeader);
        }
        self.cluster.require(node)?;
        if !state.state.valid_as_wanted_for(node.node_type) {
            return Err(ControllerError::InvalidWantedState {
                node,
                reason: format!("{} is not a valid wanted state for a {} node", state.state, node.node_type),
            });
        }

        let now = self.clock.now_ms();
        let info = self.cluster.require_mut(node)?;
        if !self.handler.handle_new_wanted_state(info, state, now) {
            return Ok(WantedStateOutcome::AlreadySet);
        }

        let wanted: BTreeMap<Node, NodeState> = self
            .cluster
            .node_infos()
            .map(|info| (info.node(), info.wanted_state.clone()))
            .collect();
        if !self.database.store_wanted_states(&wanted).await {
            warn!(node = %node, "Wanted state applied but not persisted");
        }
        Ok(WantedStateOutcome::Changed)
    }

    /// Wait for the version published after this tick to converge, or fail at
    /// `timeout` from now.
    pub fn await_convergence(&mut self, timeout: Duration) -> oneshot::Receiver<Result<u32>> {
        let (tx, rx) = oneshot::channel();
        self.pending_awaits.push(PendingAwait {
            deadline_ms: self.clock.now_ms() + timeout.as_millis() as u64,
            reply: tx,
        });
        rx
    }

    /// Replace the configured membership and group layout. Runtime records of
    /// nodes that stay configured are kept.
    pub fn reconfigure(&mut self, cluster: ClusterConfig) -> Result<()> {
        let mut config = self.config.clone();
        config.cluster = cluster;
        config.validate()?;

        let distribution = distribution_from_config(&config.cluster);
        self.cluster
            .set_configured_nodes(&config.cluster.nodes, distribution);
        self.bucket_spaces = BucketSpaceStateDeriver::new(
            config.cluster.bucket_spaces.clone(),
            config.generator.maintenance_when_pending_global_merges,
        );
        self.config = config;
        self.handler.mark_state_may_have_changed();
        info!(
            cluster = %self.cluster.name(),
            nodes = self.cluster.configured_node_count(),
            "Cluster configuration updated"
        );
        Ok(())
    }

    fn issue_node_state_requests(&mut self) {
        let timeout = self.config.timers.get_node_state_timeout;
        for info in self.cluster.node_infos_mut() {
            if info.pending_node_state_request || !info.is_in_service_discovery() {
                continue;
            }
            let Some(address) = info.rpc_address.clone() else {
                continue;
            };
            info.pending_node_state_request = true;

            let node = info.node();
            let current = info.reported_state.clone();
            let communicator = Arc::clone(&self.communicator);
            let tx = self.rpc_tx.clone();
            tokio::spawn(async move {
                let result = communicator
                    .get_node_state(node, &address, &current, timeout)
                    .await;
                let _ = tx.send(RpcReply::NodeState { node, result });
            });
        }
    }

    fn regenerate_candidate(&mut self, now: TimestampMs) {
        let params = Params::new(self.config.generator.clone())
            .at_time(now)
            .with_lowest_observed_distribution_bits(self.tracker.lowest_observed_distribution_bits());
        let baseline = ClusterStateGenerator::generate(&self.cluster, &params);

        for info in self.cluster.node_infos_mut() {
            info.generated_state = baseline.cluster_state().node_state(info.node());
        }

        let feed_block = ResourceExhaustionCalculator::new(
            &self.config.feed_block,
            self.tracker.published_bundle().feed_block(),
        )
        .infer_feed_block(&self.cluster);
        let derived = self.bucket_spaces.derive(&baseline, &self.stats);
        let bundle = ClusterStateBundle::new(
            baseline,
            derived,
            feed_block,
            self.config.broadcast.two_phase_transitions,
        );
        debug!(candidate = %bundle, "Regenerated candidate cluster state");
        self.tracker.update_latest_candidate_state_bundle(bundle);
    }

    async fn publish_if_required(&mut self, now: TimestampMs) {
        if !self.must_publish && !self.tracker.candidate_changed_enough_from_current_to_warrant_publish() {
            return;
        }
        if !self.database.is_connected() {
            debug!("Coordination store disconnected; holding back new cluster state");
            return;
        }
        let Some(candidate) = self.tracker.candidate_with_next_version() else {
            return;
        };
        // The version must be durable before any node can see it.
        if !self.database.store_last_published_state_bundle(&candidate).await {
            return;
        }

        let previous = self.tracker.published_bundle_arc();
        let Some(bundle) = self.tracker.promote_candidate_to_versioned_state(now) else {
            return;
        };
        self.must_publish = false;

        self.handler.handle_new_cluster_state(&previous, &bundle, now);
        self.emit_feed_block_events(previous.feed_block(), bundle.feed_block(), now);
        self.broadcaster.handle_new_cluster_state_bundle(bundle);
    }

    fn emit_feed_block_events(&self, before: Option<&FeedBlock>, after: Option<&FeedBlock>, now: TimestampMs) {
        let before_keys = before.map(|fb| fb.exhaustion_keys()).unwrap_or_default();
        let after_keys = after.map(|fb| fb.exhaustion_keys()).unwrap_or_default();

        for exhaustion in after.iter().flat_map(|fb| fb.concrete_exhaustions.iter()) {
            if !before_keys.contains(&exhaustion.key()) {
                self.events.add(Event::cluster(
                    EventKind::FeedBlockChanged,
                    format!(
                        "Added resource exhaustion: {}",
                        exhaustion.exhaustion_added_description()
                    ),
                    now,
                ));
            }
        }
        for exhaustion in before.iter().flat_map(|fb| fb.concrete_exhaustions.iter()) {
            if !after_keys.contains(&exhaustion.key()) {
                self.events.add(Event::cluster(
                    EventKind::FeedBlockChanged,
                    format!(
                        "Removed resource exhaustion: {}",
                        exhaustion.exhaustion_removed_description()
                    ),
                    now,
                ));
            }
        }
    }

    fn send_broadcasts(&mut self) {
        let requests = self.broadcaster.broadcast(&mut self.cluster);
        let timeout = self.config.timers.set_state_timeout;
        let timeout_ms = timeout.as_millis() as u64;

        for request in requests {
            let communicator = Arc::clone(&self.communicator);
            let tx = self.rpc_tx.clone();
            self.in_flight_broadcasts += 1;
            tokio::spawn(async move {
                let reply = match request {
                    BroadcastRequest::SetClusterState {
                        node,
                        address,
                        version,
                        bundle,
                    } => {
                        let call = communicator.set_cluster_state(node, &address, &bundle, timeout);
                        let result = tokio::time::timeout(timeout, call)
                            .await
                            .unwrap_or(Err(ControllerError::Timeout(timeout_ms)));
                        RpcReply::SetClusterState { node, version, result }
                    }
                    BroadcastRequest::Activate {
                        node,
                        address,
                        version,
                    } => {
                        let call = communicator.activate_cluster_state_version(node, &address, version, timeout);
                        let result = tokio::time::timeout(timeout, call)
                            .await
                            .unwrap_or(Err(ControllerError::Timeout(timeout_ms)));
                        RpcReply::Activate { node, version, result }
                    }
                };
                let _ = tx.send(reply);
            });
        }
    }

    fn register_pending_awaits(&mut self, now: TimestampMs) {
        for pending in std::mem::take(&mut self.pending_awaits) {
            if !self.is_leader {
                let _ = pending.reply.send(Err(ControllerError::NotLeader));
                continue;
            }
            debug!(
                version = self.tracker.current_version(),
                deadline_ms = pending.deadline_ms,
                now,
                "Waiting for cluster state convergence"
            );
            self.tasks
                .add(self.tracker.current_version(), pending.deadline_ms, pending.reply);
        }
    }

    fn resolve_convergence_tasks(&mut self, now: TimestampMs) {
        let converged = self.broadcaster.last_converged_version();
        let broadcaster = &self.broadcaster;
        let cluster = &self.cluster;
        self.tasks
            .resolve(converged, now, |version| broadcaster.non_converged_nodes(cluster, version));
    }
}

/// Cloneable sender side of the control loop.
#[derive(Clone)]
pub struct ControllerHandle {
    inbox: mpsc::UnboundedSender<ControllerInput>,
    events: Arc<EventLog>,
}

impl ControllerHandle {
    fn send(&self, input: ControllerInput) -> Result<()> {
        self.inbox
            .send(input)
            .map_err(|_| ControllerError::ChannelClosed)
    }

    pub fn report_node_state(&self, node: Node, reply: NodeStateReply) -> Result<()> {
        self.send(ControllerInput::ReportNodeState { node, reply })
    }

    pub fn node_discovered(&self, node: Node, address: impl Into<String>) -> Result<()> {
        self.send(ControllerInput::NodeDiscovered {
            node,
            address: address.into(),
        })
    }

    pub fn node_missing(&self, node: Node) -> Result<()> {
        self.send(ControllerInput::NodeMissing { node })
    }

    /// Propose a wanted state. With `wait_for_convergence`, the call returns
    /// only once the resulting cluster state converged, or fails at the timeout.
    pub async fn set_wanted_state(
        &self,
        node: Node,
        state: NodeState,
        wait_for_convergence: Option<Duration>,
    ) -> Result<WantedStateOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerInput::ProposeWantedState {
            node,
            state,
            reply: tx,
        })?;
        let outcome = rx.await.map_err(|_| ControllerError::ChannelClosed)??;
        if let Some(timeout) = wait_for_convergence {
            self.await_convergence(timeout).await?;
        }
        Ok(outcome)
    }

    /// Wait until the currently published version has converged. Returns the
    /// converged version.
    pub async fn await_convergence(&self, timeout: Duration) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerInput::AwaitConvergence { timeout, reply: tx })?;
        rx.await.map_err(|_| ControllerError::ChannelClosed)?
    }

    pub async fn reconfigure(&self, cluster: ClusterConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerInput::Reconfigure { cluster, reply: tx })?;
        rx.await.map_err(|_| ControllerError::ChannelClosed)?
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.events.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::communicator::LocalCommunicator;
    use crate::election::MasterElection;
    use crate::state::State;
    use crate::store::MemoryStore;

    const START: u64 = 1_000_000;

    struct Harness {
        controller: FleetController,
        election: MasterElection,
        clock: Arc<FakeClock>,
        store: Arc<MemoryStore>,
        comm: Arc<LocalCommunicator>,
    }

    fn harness(config: ControllerConfig) -> Harness {
        let clock = Arc::new(FakeClock::new(START));
        let store = Arc::new(MemoryStore::new());
        let comm = LocalCommunicator::new();
        let election = MasterElection::new(config.controller_index);
        let controller = FleetController::new(
            config,
            clock.clone(),
            store.clone(),
            comm.clone(),
            election.subscribe(),
        )
        .unwrap();
        Harness {
            controller,
            election,
            clock,
            store,
            comm,
        }
    }

    fn all_nodes(count: u16) -> Vec<Node> {
        (0..count)
            .flat_map(|i| [Node::distributor(i), Node::storage(i)])
            .collect()
    }

    fn report(h: &Harness, node: Node, state: NodeState) {
        h.controller
            .handle()
            .report_node_state(node, NodeStateReply::new(state))
            .unwrap();
    }

    #[tokio::test]
    async fn test_publishes_all_up_state_as_leader() {
        let mut h = harness(ControllerConfig::for_flat_cluster("music", 3));
        h.election.set_leader(true);
        for node in all_nodes(3) {
            report(&h, node, NodeState::up());
        }
        h.controller.tick().await;

        assert!(h.controller.is_leader());
        let published = h.controller.published_bundle();
        assert_eq!(published.version(), 2);
        assert_eq!(published.baseline_state().to_string(), "version:2 distributor:3 storage:3");
        assert_eq!(h.store.retrieve_latest_version().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_follower_generates_but_does_not_publish() {
        let mut h = harness(ControllerConfig::for_flat_cluster("music", 2));
        for node in all_nodes(2) {
            report(&h, node, NodeState::up());
        }
        h.controller.tick().await;

        assert!(!h.controller.is_leader());
        assert!(!h.controller.version_tracker().has_published());
        let candidate = h.controller.candidate_bundle().unwrap();
        assert_eq!(candidate.baseline_state().to_string(), "distributor:2 storage:2");
    }

    #[tokio::test]
    async fn test_disconnected_store_holds_back_publication() {
        let mut h = harness(ControllerConfig::for_flat_cluster("music", 1));
        h.store.set_connected(false);
        h.election.set_leader(true);
        for node in all_nodes(1) {
            report(&h, node, NodeState::up());
        }
        h.controller.tick().await;
        assert!(!h.controller.version_tracker().has_published());

        h.store.set_connected(true);
        h.controller.tick().await;
        assert_eq!(h.controller.published_bundle().version(), 2);
    }

    #[tokio::test]
    async fn test_wanted_state_validation() {
        let mut h = harness(ControllerConfig::for_flat_cluster("music", 2));
        let maintenance = NodeState::new(State::Maintenance);

        let err = h
            .controller
            .propose_wanted_state(Node::storage(0), maintenance.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NotLeader));

        h.election.set_leader(true);
        h.controller.tick().await;

        let err = h
            .controller
            .propose_wanted_state(Node::storage(7), maintenance.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NodeNotConfigured(_)));

        let err = h
            .controller
            .propose_wanted_state(Node::distributor(0), maintenance.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidWantedState { .. }));
        assert_eq!(
            h.controller
                .cluster()
                .node_info(Node::distributor(0))
                .unwrap()
                .wanted_state,
            NodeState::up()
        );

        let outcome = h
            .controller
            .propose_wanted_state(Node::storage(0), maintenance.clone())
            .await
            .unwrap();
        assert_eq!(outcome, WantedStateOutcome::Changed);
        let outcome = h
            .controller
            .propose_wanted_state(Node::storage(0), maintenance)
            .await
            .unwrap();
        assert_eq!(outcome, WantedStateOutcome::AlreadySet);

        let stored = h.store.retrieve_wanted_states().await.unwrap();
        assert_eq!(stored.get("storage.0").map(String::as_str), Some("s:m"));
    }

    #[tokio::test]
    async fn test_leadership_bootstrap_continues_version_numbering() {
        let mut h = harness(ControllerConfig::for_flat_cluster("music", 1));
        h.store.store_latest_version(41).await.unwrap();
        h.election.set_leader(true);
        for node in all_nodes(1) {
            report(&h, node, NodeState::up());
        }
        h.controller.tick().await;

        assert_eq!(h.controller.published_bundle().version(), 42);
        let votes = h.store.retrieve_master_votes().await.unwrap();
        assert_eq!(votes.get(&0), Some(&0));
    }

    #[tokio::test]
    async fn test_leadership_loss_fails_waiters() {
        let mut h = harness(ControllerConfig::for_flat_cluster("music", 1));
        let storage = Node::storage(0);
        h.comm.fail_set_state(storage, "busy");
        h.controller.handle().node_discovered(storage, "tcp/host0:19100").unwrap();
        report(&h, storage, NodeState::up());
        h.election.set_leader(true);
        h.controller.tick().await;
        h.controller.await_broadcast_replies().await;

        let rx = h.controller.await_convergence(Duration::from_secs(60));
        h.controller.tick().await;
        assert_eq!(h.controller.pending_convergence_tasks(), 1);

        h.election.set_leader(false);
        h.clock.advance(10);
        h.controller.tick().await;
        assert!(matches!(rx.await.unwrap(), Err(ControllerError::LeadershipLost)));
        assert!(h.controller.broadcaster().bundle().is_none());
        assert_eq!(h.controller.pending_convergence_tasks(), 0);
    }
}
