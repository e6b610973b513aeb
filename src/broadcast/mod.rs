//! Cluster state broadcasting.
//!
//! - [`SystemStateBroadcaster`]: publish, then (for deferred bundles) activate,
//!   with per-node acknowledgement tracking
//! - [`ConvergenceTasks`]: callers waiting for a version to converge

mod broadcaster;
mod tasks;

pub use broadcaster::{BroadcastPhase, BroadcastRequest, SystemStateBroadcaster};
pub use tasks::{truncated_node_list, ConvergenceTasks};
