//! Callers waiting for a cluster state version to converge.

use crate::clock::TimestampMs;
use crate::error::{ControllerError, Result};
use crate::state::Node;
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    version: u32,
    deadline_ms: TimestampMs,
    reply: oneshot::Sender<Result<u32>>,
}

/// Queue of convergence waiters, resolved only by the control loop.
pub struct ConvergenceTasks {
    waiters: Vec<Waiter>,
    max_nodes_in_error: usize,
}

impl ConvergenceTasks {
    pub fn new(max_nodes_in_error: usize) -> Self {
        Self {
            waiters: Vec::new(),
            max_nodes_in_error,
        }
    }

    /// Wait until `version` (or a newer one) has converged, failing at `deadline_ms`.
    pub fn add(&mut self, version: u32, deadline_ms: TimestampMs, reply: oneshot::Sender<Result<u32>>) {
        self.waiters.push(Waiter {
            version,
            deadline_ms,
            reply,
        });
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Answer every waiter whose version converged or whose deadline passed.
    ///
    /// `non_converged` is asked for the nodes holding up a given version.
    pub fn resolve<F>(&mut self, converged_version: u32, now_ms: TimestampMs, non_converged: F)
    where
        F: Fn(u32) -> Vec<Node>,
    {
        let max_nodes = self.max_nodes_in_error;
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if converged_version >= waiter.version {
                debug!(version = waiter.version, converged_version, "Convergence task completed");
                let _ = waiter.reply.send(Ok(converged_version));
            } else if now_ms >= waiter.deadline_ms {
                let nodes = non_converged(waiter.version);
                let _ = waiter.reply.send(Err(ControllerError::DeadlineExceeded {
                    version: waiter.version,
                    non_converged: truncated_node_list(&nodes, max_nodes),
                }));
            } else if waiter.reply.is_closed() {
                debug!(version = waiter.version, "Dropping abandoned convergence task");
            } else {
                self.waiters.push(waiter);
            }
        }
    }

    /// Fail everything, e.g. on leadership loss.
    pub fn fail_all<F>(&mut self, error: F)
    where
        F: Fn() -> ControllerError,
    {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Err(error()));
        }
    }
}

/// `storage.0, storage.1 (... and 3 more)`, bounded to `max` names.
pub fn truncated_node_list(nodes: &[Node], max: usize) -> String {
    let mut out = nodes
        .iter()
        .take(max)
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if nodes.len() > max {
        out.push_str(&format!(" (... and {} more)", nodes.len() - max));
    }
    out
}
