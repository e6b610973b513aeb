// Controller fixtures for integration tests

use fleetcontroller::clock::FakeClock;
use fleetcontroller::communicator::{LocalCommunicator, NodeStateReply};
use fleetcontroller::config::ControllerConfig;
use fleetcontroller::election::MasterElection;
use fleetcontroller::store::MemoryStore;
use fleetcontroller::topology::Group;
use fleetcontroller::{ControllerHandle, FleetController, Node, NodeState};
use std::sync::Arc;

/// Start of fake time for every fixture.
pub const START_MS: u64 = 1_000_000;

/// Builder for a [`ClusterFixture`].
pub struct ClusterFixtureBuilder {
    config: ControllerConfig,
    leader: bool,
    store: Option<Arc<MemoryStore>>,
    clock: Option<Arc<FakeClock>>,
}

impl ClusterFixtureBuilder {
    /// One flat group of `nodes` storage and distributor nodes.
    pub fn flat(nodes: u16) -> Self {
        Self {
            config: ControllerConfig::for_flat_cluster("content", nodes),
            leader: true,
            store: None,
            clock: None,
        }
    }

    /// `groups` leaf groups of `per_group` nodes each, numbered consecutively.
    pub fn grouped(groups: u16, per_group: u16) -> Self {
        let mut builder = Self::flat(groups * per_group);
        let leaves = (0..groups)
            .map(|g| {
                let nodes = (g * per_group..(g + 1) * per_group).collect();
                Group::leaf(g, format!("group{}", g), nodes)
            })
            .collect();
        builder.config.cluster.groups = Some(Group::root(leaves));
        builder
    }

    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut ControllerConfig),
    {
        f(&mut self.config);
        self
    }

    pub fn follower(mut self) -> Self {
        self.leader = false;
        self
    }

    /// Share a coordination store with another fixture.
    pub fn with_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<FakeClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> ClusterFixture {
        let clock = self.clock.unwrap_or_else(|| Arc::new(FakeClock::new(START_MS)));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let comm = LocalCommunicator::new();
        let election = MasterElection::new(self.config.controller_index);
        let node_count = self.config.cluster.nodes.len() as u16;

        let controller = FleetController::new(
            self.config,
            clock.clone(),
            store.clone(),
            comm.clone(),
            election.subscribe(),
        )
        .expect("fixture config must be valid");
        election.set_leader(self.leader);

        ClusterFixture {
            handle: controller.handle(),
            controller,
            election,
            clock,
            store,
            comm,
            node_count,
        }
    }
}

/// A controller wired to in-memory collaborators and a fake clock.
pub struct ClusterFixture {
    pub controller: FleetController,
    pub handle: ControllerHandle,
    pub election: MasterElection,
    pub clock: Arc<FakeClock>,
    pub store: Arc<MemoryStore>,
    pub comm: Arc<LocalCommunicator>,
    node_count: u16,
}

impl ClusterFixture {
    pub fn nodes(&self) -> Vec<Node> {
        (0..self.node_count)
            .flat_map(|i| [Node::distributor(i), Node::storage(i)])
            .collect()
    }

    pub fn address_of(node: Node) -> String {
        format!("tcp/{}-{}:19100", node.node_type, node.index)
    }

    /// Put every node into service discovery so it receives broadcasts.
    pub fn discover_all(&self) {
        for node in self.nodes() {
            self.handle
                .node_discovered(node, Self::address_of(node))
                .unwrap();
        }
    }

    pub fn report(&self, node: Node, state: NodeState) {
        self.handle
            .report_node_state(node, NodeStateReply::new(state))
            .unwrap();
    }

    pub fn report_with_host_info(&self, node: Node, state: NodeState, host_info: &str) {
        self.handle
            .report_node_state(node, NodeStateReply::new(state).with_host_info(host_info))
            .unwrap();
    }

    pub fn report_all_up(&self) {
        for node in self.nodes() {
            self.report(node, NodeState::up());
        }
    }

    /// One control loop pass, then wait for the broadcasts it sent.
    pub async fn tick(&mut self) {
        self.controller.tick().await;
        self.controller.await_broadcast_replies().await;
    }

    /// Enough passes for a publish, its activation and convergence detection.
    pub async fn settle(&mut self) {
        for _ in 0..3 {
            self.tick().await;
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.clock.advance(delta_ms);
    }

    pub fn published(&self) -> String {
        self.controller.published_bundle().baseline_state().to_string()
    }

    pub fn published_version(&self) -> u32 {
        self.controller.published_bundle().version()
    }

    /// Fixture with every node discovered and up, and the first state published.
    pub async fn all_up(builder: ClusterFixtureBuilder) -> Self {
        let mut fixture = builder.build();
        fixture.discover_all();
        fixture.report_all_up();
        fixture.settle().await;
        fixture
    }
}
