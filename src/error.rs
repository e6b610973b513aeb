//! Error types for the fleet controller.
//!
//! This module provides a unified error type [`ControllerError`] for all controller
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Validation**: wanted-state proposals and configuration rejected at the boundary
//! - **Wire format**: malformed cluster state or node state strings
//! - **Coordination store**: durable store unavailable or refusing writes
//! - **Leadership**: operations attempted without (or after losing) leadership
//! - **Convergence**: tasks that did not observe their version converge in time
//! - **Node RPC**: failed or timed-out calls to storage and distributor nodes
//!
//! # Example
//!
//! ```rust
//! use fleetcontroller::error::ControllerError;
//!
//! fn handle_error(err: &ControllerError) {
//!     if err.is_leadership_error() {
//!         println!("Retry against another controller: {}", err);
//!     } else if err.is_retryable() {
//!         println!("Retrying operation...");
//!     } else {
//!         println!("Fatal error: {}", err);
//!     }
//! }
//! ```

use crate::state::Node;
use std::io;
use thiserror::Error;

/// Main error type for fleet controller operations.
#[derive(Error, Debug)]
pub enum ControllerError {
    // Validation errors
    #[error("Node {0} is not configured in this cluster")]
    NodeNotConfigured(Node),

    #[error("Invalid wanted state for node {node}: {reason}")]
    InvalidWantedState { node: Node, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Wire format errors
    #[error("Parse error: {0}")]
    Parse(String),

    // Coordination store errors
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    // Leadership errors
    #[error("This controller is not the cluster leader")]
    NotLeader,

    #[error("Leadership lost while the task was pending")]
    LeadershipLost,

    // Convergence errors
    #[error("Deadline exceeded waiting for cluster state version {version} to converge; nodes not converged: {non_converged}")]
    DeadlineExceeded { version: u32, non_converged: String },

    // Node RPC errors
    #[error("RPC to node {node} failed: {message}")]
    Rpc { node: Node, message: String },

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Control loop channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Check if the same request may succeed when retried against this controller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::DeadlineExceeded { .. }
                | ControllerError::Timeout(_)
                | ControllerError::Rpc { .. }
                | ControllerError::StoreUnavailable(_)
        )
    }

    /// Check if the caller should go looking for another leader.
    pub fn is_leadership_error(&self) -> bool {
        matches!(self, ControllerError::NotLeader | ControllerError::LeadershipLost)
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ControllerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ControllerError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ControllerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ControllerError::ChannelClosed
    }
}

/// Result type alias for fleet controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
