// Custom test assertions for integration tests

use fleetcontroller::events::{EventKind, EventLog};
use fleetcontroller::state::{ClusterStateBundle, NodeStateReason};
use fleetcontroller::{Node, State};

/// Assert the published state of one node.
pub fn assert_node_state(bundle: &ClusterStateBundle, node: Node, expected: State) {
    let actual = bundle.baseline_state().node_state(node).state;
    assert_eq!(
        actual, expected,
        "node {} in '{}': expected {}, got {}",
        node,
        bundle.baseline_state(),
        expected,
        actual
    );
}

pub fn assert_node_reason(bundle: &ClusterStateBundle, node: Node, expected: Option<NodeStateReason>) {
    assert_eq!(
        bundle.baseline().node_reason(node),
        expected,
        "reason for node {} in '{}'",
        node,
        bundle.baseline_state()
    );
}

/// Assert that some event of `kind` contains `needle`.
pub fn assert_event_contains(events: &EventLog, kind: EventKind, needle: &str) {
    let found = events
        .recent(events.len())
        .iter()
        .any(|e| e.kind == kind && e.description.contains(needle));
    if !found {
        let seen: Vec<String> = events
            .recent(events.len())
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.description.clone())
            .collect();
        panic!("no {:?} event containing '{}'; saw {:?}", kind, needle, seen);
    }
}
