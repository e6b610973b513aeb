//! Control loop integration tests
//!
//! Leadership, persistence, broadcasting and convergence waiting, with the
//! in-memory store and communicator standing in for the cluster.

#[allow(dead_code)]
mod common;

use common::*;
use fleetcontroller::communicator::NodeStateReply;
use fleetcontroller::config::ClusterConfig;
use fleetcontroller::events::EventKind;
use fleetcontroller::store::CoordinationStore;
use fleetcontroller::topology::ConfiguredNode;
use fleetcontroller::{ControllerError, Node, NodeState, State, WantedStateOutcome};
use std::time::Duration;

// =============================================================================
// Two-phase broadcast
// =============================================================================

#[tokio::test]
async fn test_two_phase_activation_waits_for_every_ack() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(3).configure(|c| {
        c.broadcast.two_phase_transitions = true;
    }))
    .await;
    assert_eq!(fixture.controller.broadcaster().last_converged_version(), 2);
    assert!(fixture.controller.published_bundle().deferred_activation());
    assert_eq!(fixture.comm.activations().len(), 6);

    fixture.comm.fail_set_state(Node::storage(1), "busy");
    fixture.report(Node::distributor(2), NodeState::down());
    fixture.tick().await;
    fixture.tick().await;
    assert_eq!(fixture.published_version(), 3);

    // storage.1 keeps refusing, so nobody is asked to activate version 3.
    assert!(fixture.comm.activations().iter().all(|(_, v)| *v == 2));
    assert_eq!(fixture.controller.broadcaster().last_converged_version(), 2);
    let last = fixture.comm.last_bundle_sent_to(Node::storage(0)).unwrap();
    assert_eq!(last.version(), 3);

    fixture.comm.clear_failures();
    fixture.settle().await;
    let activated_v3: Vec<Node> = fixture
        .comm
        .activations()
        .into_iter()
        .filter(|(_, v)| *v == 3)
        .map(|(node, _)| node)
        .collect();
    // distributor.2 is down and not a target.
    assert_eq!(activated_v3.len(), 5);
    assert!(!activated_v3.contains(&Node::distributor(2)));
    assert_eq!(fixture.controller.broadcaster().last_converged_version(), 3);
}

#[tokio::test]
async fn test_wrong_activation_version_blocks_convergence() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(2).configure(|c| {
        c.broadcast.two_phase_transitions = true;
    }))
    .await;

    fixture.comm.override_activation(Node::storage(0), 2);
    fixture.report(Node::distributor(1), NodeState::down());
    fixture.settle().await;

    assert_eq!(fixture.published_version(), 3);
    assert_eq!(fixture.controller.broadcaster().last_converged_version(), 2);
    let info = fixture.controller.cluster().node_info(Node::storage(0)).unwrap();
    assert_eq!(info.cluster_state_version_bundle_acked, 3);
    assert!(info.cluster_state_version_activation_acked < 3);
}

#[tokio::test]
async fn test_reappearing_node_is_sent_current_state() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(2)).await;
    let storage = Node::storage(1);
    let sent_before = fixture.comm.sent_bundles().len();

    fixture.handle.node_missing(storage).unwrap();
    fixture.tick().await;
    fixture
        .handle
        .node_discovered(storage, "tcp/storage-1-restarted:19100")
        .unwrap();
    fixture.tick().await;

    let sent: Vec<Node> = fixture.comm.sent_bundles()[sent_before..]
        .iter()
        .map(|(node, _)| *node)
        .collect();
    assert_eq!(sent, vec![storage]);
    assert_eq!(
        fixture.comm.last_bundle_sent_to(storage).unwrap().version(),
        fixture.published_version()
    );
}

// =============================================================================
// Waiting for convergence
// =============================================================================

#[tokio::test]
async fn test_convergence_deadline_names_lagging_node() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(2)).await;

    fixture.comm.fail_set_state(Node::storage(1), "disk full");
    fixture.report(Node::distributor(1), NodeState::down());
    fixture.tick().await;
    assert_eq!(fixture.published_version(), 3);

    let rx = fixture.controller.await_convergence(Duration::from_secs(5));
    fixture.tick().await;
    assert_eq!(fixture.controller.pending_convergence_tasks(), 1);

    fixture.advance(5000);
    fixture.tick().await;
    assert_eq!(fixture.controller.pending_convergence_tasks(), 0);
    match rx.await.unwrap() {
        Err(ControllerError::DeadlineExceeded {
            version,
            non_converged,
        }) => {
            assert_eq!(version, 3);
            assert_eq!(non_converged, "storage.1");
        }
        other => panic!("expected deadline exceeded, got {:?}", other),
    }
}

#[tokio::test]
async fn test_await_convergence_resolves_with_converged_version() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(2)).await;

    let rx = fixture.controller.await_convergence(Duration::from_secs(5));
    fixture.tick().await;
    assert_eq!(rx.await.unwrap().unwrap(), 2);
}

#[tokio::test]
async fn test_follower_rejects_waiters_and_proposals() {
    let mut fixture = ClusterFixtureBuilder::flat(2).follower().build();
    fixture.discover_all();
    fixture.report_all_up();
    fixture.tick().await;

    let rx = fixture.controller.await_convergence(Duration::from_secs(5));
    fixture.tick().await;
    assert!(matches!(rx.await.unwrap(), Err(ControllerError::NotLeader)));

    let result = fixture
        .controller
        .propose_wanted_state(Node::storage(0), NodeState::new(State::Maintenance))
        .await;
    assert!(matches!(result, Err(ControllerError::NotLeader)));
    assert!(fixture.comm.sent_bundles().is_empty());
}

#[tokio::test]
async fn test_handle_set_wanted_state_rejects_unknown_node() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(2)).await;

    let handle = fixture.handle.clone();
    let task = tokio::spawn(async move {
        handle
            .set_wanted_state(Node::storage(7), NodeState::down(), None)
            .await
    });
    settle_tasks().await;
    fixture.tick().await;

    let result = timing::with_timeout(task, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(ControllerError::NodeNotConfigured(node)) if node == Node::storage(7)
    ));
}

// =============================================================================
// Node state polling
// =============================================================================

#[tokio::test]
async fn test_long_poll_replies_feed_generation() {
    let mut fixture = ClusterFixtureBuilder::flat(2).build();
    for node in fixture.nodes() {
        let reply = if node == Node::storage(0) {
            NodeStateReply::new(NodeState::up())
                .with_host_info(r#"{"content-node": {"resource-usage": {"disk": {"usage": 0.3}}}}"#)
        } else {
            NodeStateReply::new(NodeState::up())
        };
        fixture.comm.push_node_state(node, reply);
    }
    fixture.comm.push_node_state_failure(Node::storage(1), "connection refused");
    fixture.discover_all();

    fixture.tick().await;
    settle_tasks().await;
    fixture.tick().await;
    assert_eq!(fixture.published(), "version:3 distributor:2 storage:2");
    let info = fixture.controller.cluster().node_info(Node::storage(0)).unwrap();
    assert_eq!(info.host_info.resource_usage()["disk"].usage, 0.3);

    // The second request to storage.1 fails.
    settle_tasks().await;
    fixture.tick().await;
    let info = fixture.controller.cluster().node_info(Node::storage(1)).unwrap();
    assert_eq!(info.reported_state.state, State::Down);
    assert!(info.reported_state.description.contains("connection refused"));
    assert_node_state(fixture.controller.published_bundle(), Node::storage(1), State::Maintenance);
}

// =============================================================================
// Persistence and failover
// =============================================================================

#[tokio::test]
async fn test_failover_continues_versions_and_wanted_states() {
    let mut first = ClusterFixture::all_up(ClusterFixtureBuilder::flat(3)).await;
    first
        .controller
        .propose_wanted_state(
            Node::storage(0),
            NodeState::new(State::Maintenance).with_description("rebuild"),
        )
        .await
        .unwrap();
    first.tick().await;
    assert_eq!(first.published(), "version:3 distributor:3 storage:3 .0.s:m .0.m:rebuild");

    first.election.set_leader(false);
    first.tick().await;
    assert!(!first.controller.is_leader());

    let mut second = ClusterFixture::all_up(
        ClusterFixtureBuilder::flat(3)
            .configure(|c| c.controller_index = 1)
            .with_store(first.store.clone())
            .with_clock(first.clock.clone()),
    )
    .await;
    assert_eq!(second.published(), "version:4 distributor:3 storage:3 .0.s:m .0.m:rebuild");

    let info = second.controller.cluster().node_info(Node::storage(0)).unwrap();
    assert_eq!(info.wanted_state.state, State::Maintenance);
    let votes = second.store.retrieve_master_votes().await.unwrap();
    assert_eq!(votes.get(&0), Some(&0));
    assert_eq!(votes.get(&1), Some(&1));
    assert_event_contains(
        second.controller.events(),
        EventKind::Leadership,
        "index 1) is now cluster leader",
    );

    // Clearing the wanted state is persisted too.
    let outcome = second
        .controller
        .propose_wanted_state(Node::storage(0), NodeState::up())
        .await
        .unwrap();
    assert_eq!(outcome, WantedStateOutcome::Changed);
    second.tick().await;
    assert_eq!(second.published(), "version:5 distributor:3 storage:3");
    assert!(second.store.retrieve_wanted_states().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_outage_holds_back_then_catches_up() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(2).configure(|c| {
        c.generator.storage_transition_time = Duration::ZERO;
    }))
    .await;

    fixture.store.set_connected(false);
    fixture.report(Node::storage(1), NodeState::down());
    fixture.tick().await;
    assert_eq!(fixture.published_version(), 2);
    assert_eq!(
        fixture.controller.candidate_bundle().unwrap().baseline_state().to_string(),
        "distributor:2 storage:1"
    );

    fixture.store.set_connected(true);
    fixture.tick().await;
    assert_eq!(fixture.published(), "version:3 distributor:2 storage:1");
    assert_eq!(fixture.store.retrieve_latest_version().await.unwrap(), Some(3));
}

// =============================================================================
// Reconfiguration
// =============================================================================

#[tokio::test]
async fn test_reconfigure_shrinks_cluster() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(3)).await;

    let cluster = ClusterConfig {
        nodes: (0..2).map(ConfiguredNode::new).collect(),
        ..fixture.controller.config().cluster.clone()
    };
    fixture.controller.reconfigure(cluster).unwrap();
    fixture.tick().await;

    assert_eq!(fixture.published(), "version:3 distributor:2 storage:2");
    assert!(fixture.controller.cluster().node_info(Node::storage(2)).is_none());
    assert!(matches!(
        fixture
            .controller
            .propose_wanted_state(Node::storage(2), NodeState::down())
            .await,
        Err(ControllerError::NodeNotConfigured(_))
    ));
}

#[tokio::test]
async fn test_reconfigure_retires_node() {
    let mut fixture = ClusterFixture::all_up(ClusterFixtureBuilder::flat(2)).await;

    let cluster = ClusterConfig {
        nodes: vec![ConfiguredNode::new(0), ConfiguredNode::retired(1)],
        ..fixture.controller.config().cluster.clone()
    };
    let handle = fixture.handle.clone();
    let task = tokio::spawn(async move { handle.reconfigure(cluster).await });
    settle_tasks().await;
    fixture.tick().await;
    task.await.unwrap().unwrap();

    assert_eq!(fixture.published(), "version:3 distributor:2 storage:2 .1.s:r");
}
