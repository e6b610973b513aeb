//! RPC surface towards storage and distributor nodes.
//!
//! The control loop never blocks on a node: every call runs in a spawned task
//! and its outcome comes back as an [`RpcReply`] on the loop's reply channel.

use crate::error::{ControllerError, Result};
use crate::state::{ClusterStateBundle, Node, NodeState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A node's answer to a state long-poll.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStateReply {
    pub state: NodeState,
    /// Raw host info JSON; may be empty.
    pub host_info: String,
}

impl NodeStateReply {
    pub fn new(state: NodeState) -> Self {
        Self {
            state,
            host_info: String::new(),
        }
    }

    pub fn with_host_info(mut self, host_info: impl Into<String>) -> Self {
        self.host_info = host_info.into();
        self
    }
}

#[async_trait]
pub trait NodeCommunicator: Send + Sync {
    /// Long-poll the node's state. `current` is what the controller believes
    /// the node reports; the node answers once its state differs or `timeout`
    /// elapses.
    async fn get_node_state(
        &self,
        node: Node,
        address: &str,
        current: &NodeState,
        timeout: Duration,
    ) -> Result<NodeStateReply>;

    /// Deliver a bundle. With deferred activation the node stores it without
    /// enabling it.
    async fn set_cluster_state(
        &self,
        node: Node,
        address: &str,
        bundle: &ClusterStateBundle,
        timeout: Duration,
    ) -> Result<()>;

    /// Enable a previously delivered version. Returns the version the node
    /// actually activated.
    async fn activate_cluster_state_version(
        &self,
        node: Node,
        address: &str,
        version: u32,
        timeout: Duration,
    ) -> Result<u32>;
}

/// Outcome of an RPC, delivered back to the control loop.
#[derive(Debug)]
pub enum RpcReply {
    NodeState {
        node: Node,
        result: Result<NodeStateReply>,
    },
    SetClusterState {
        node: Node,
        version: u32,
        result: Result<()>,
    },
    Activate {
        node: Node,
        version: u32,
        result: Result<u32>,
    },
}

impl RpcReply {
    pub fn node(&self) -> Node {
        match self {
            RpcReply::NodeState { node, .. } => *node,
            RpcReply::SetClusterState { node, .. } => *node,
            RpcReply::Activate { node, .. } => *node,
        }
    }
}

/// In-memory communicator that records what was sent and answers from
/// scripted replies. Nodes without a scripted state reply park the long-poll
/// until `timeout`, then answer with the state the controller already has.
#[derive(Default)]
pub struct LocalCommunicator {
    state_replies: Mutex<BTreeMap<Node, VecDeque<Result<NodeStateReply>>>>,
    failing_set_state: Mutex<BTreeMap<Node, String>>,
    activation_overrides: Mutex<BTreeMap<Node, u32>>,
    sent_bundles: Mutex<Vec<(Node, ClusterStateBundle)>>,
    activations: Mutex<Vec<(Node, u32)>>,
}

impl LocalCommunicator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a state the node will report on its next long-poll.
    pub fn push_node_state(&self, node: Node, reply: NodeStateReply) {
        self.state_replies
            .lock()
            .entry(node)
            .or_default()
            .push_back(Ok(reply));
    }

    /// Queue a failed long-poll.
    pub fn push_node_state_failure(&self, node: Node, message: impl Into<String>) {
        self.state_replies
            .lock()
            .entry(node)
            .or_default()
            .push_back(Err(ControllerError::Rpc {
                node,
                message: message.into(),
            }));
    }

    /// Make every publish to `node` fail until cleared.
    pub fn fail_set_state(&self, node: Node, message: impl Into<String>) {
        self.failing_set_state.lock().insert(node, message.into());
    }

    pub fn clear_failures(&self) {
        self.failing_set_state.lock().clear();
    }

    /// Make `node` answer activations with `version` regardless of the request.
    pub fn override_activation(&self, node: Node, version: u32) {
        self.activation_overrides.lock().insert(node, version);
    }

    pub fn sent_bundles(&self) -> Vec<(Node, ClusterStateBundle)> {
        self.sent_bundles.lock().clone()
    }

    pub fn last_bundle_sent_to(&self, node: Node) -> Option<ClusterStateBundle> {
        self.sent_bundles
            .lock()
            .iter()
            .rev()
            .find(|(n, _)| *n == node)
            .map(|(_, b)| b.clone())
    }

    pub fn activations(&self) -> Vec<(Node, u32)> {
        self.activations.lock().clone()
    }
}

#[async_trait]
impl NodeCommunicator for LocalCommunicator {
    async fn get_node_state(
        &self,
        node: Node,
        _address: &str,
        current: &NodeState,
        timeout: Duration,
    ) -> Result<NodeStateReply> {
        let scripted = self
            .state_replies
            .lock()
            .get_mut(&node)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(reply) => reply,
            None => {
                tokio::time::sleep(timeout).await;
                Ok(NodeStateReply::new(current.clone()))
            }
        }
    }

    async fn set_cluster_state(
        &self,
        node: Node,
        _address: &str,
        bundle: &ClusterStateBundle,
        _timeout: Duration,
    ) -> Result<()> {
        if let Some(message) = self.failing_set_state.lock().get(&node) {
            return Err(ControllerError::Rpc {
                node,
                message: message.clone(),
            });
        }
        self.sent_bundles.lock().push((node, bundle.clone()));
        Ok(())
    }

    async fn activate_cluster_state_version(
        &self,
        node: Node,
        _address: &str,
        version: u32,
        _timeout: Duration,
    ) -> Result<u32> {
        let actual = self
            .activation_overrides
            .lock()
            .get(&node)
            .copied()
            .unwrap_or(version);
        self.activations.lock().push((node, version));
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let comm = LocalCommunicator::new();
        let node = Node::storage(0);
        comm.push_node_state(node, NodeStateReply::new(NodeState::new(State::Initializing)));
        comm.push_node_state_failure(node, "connection refused");

        let timeout = Duration::from_millis(1);
        let first = comm
            .get_node_state(node, "addr", &NodeState::down(), timeout)
            .await
            .unwrap();
        assert_eq!(first.state.state, State::Initializing);
        let second = comm.get_node_state(node, "addr", &NodeState::down(), timeout).await;
        assert!(matches!(second, Err(ControllerError::Rpc { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscripted_long_poll_echoes_current_after_timeout() {
        let comm = LocalCommunicator::new();
        let reply = comm
            .get_node_state(Node::distributor(1), "addr", &NodeState::up(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reply.state, NodeState::up());
    }

    #[tokio::test]
    async fn test_set_state_failure_and_activation_override() {
        let comm = LocalCommunicator::new();
        let node = Node::storage(2);
        comm.fail_set_state(node, "rejected");
        let bundle = ClusterStateBundle::empty();
        assert!(comm
            .set_cluster_state(node, "addr", &bundle, Duration::from_secs(1))
            .await
            .is_err());
        comm.clear_failures();
        assert!(comm
            .set_cluster_state(node, "addr", &bundle, Duration::from_secs(1))
            .await
            .is_ok());
        assert_eq!(comm.sent_bundles().len(), 1);

        comm.override_activation(node, 4);
        let actual = comm
            .activate_cluster_state_version(node, "addr", 5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(actual, 4);
        assert_eq!(comm.activations(), vec![(node, 5)]);
    }
}
