//! Fleet controller core for a distributed content storage cluster.
//!
//! The controller watches every storage and distributor node, decides which
//! nodes the cluster should use, and distributes that decision as a versioned
//! cluster state.
//!
//! # Features
//!
//! - **Cluster state generation**: reported, wanted and timer-driven state
//!   folded into one published state per node, with group takedown and
//!   cluster-wide availability checks.
//! - **Feed blocking**: resource exhaustion with hysteresis.
//! - **Versioning**: strictly increasing versions, persisted before use.
//! - **Two-phase broadcast**: publish, then activate once every node acknowledged.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    FleetController (tick)                  │
//! ├────────────────────────────────────────────────────────────┤
//! │  StateChangeHandler  →  ClusterStateGenerator  →  Tracker  │
//! ├────────────────────────────────────────────────────────────┤
//! │  SystemStateBroadcaster  →  NodeCommunicator (RPC)         │
//! ├────────────────────────────────────────────────────────────┤
//! │  DatabaseHandler (CoordinationStore) | LeadershipWatcher   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use fleetcontroller::clock::SystemClock;
//! use fleetcontroller::communicator::LocalCommunicator;
//! use fleetcontroller::config::ControllerConfig;
//! use fleetcontroller::election::MasterElection;
//! use fleetcontroller::store::MemoryStore;
//! use fleetcontroller::FleetController;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fleetcontroller::Result<()> {
//!     let config = ControllerConfig::for_flat_cluster("music", 3);
//!     fleetcontroller::observability::init(&config.observability)?;
//!
//!     let election = MasterElection::new(config.controller_index);
//!     let controller = FleetController::new(
//!         config,
//!         Arc::new(SystemClock),
//!         Arc::new(MemoryStore::new()),
//!         LocalCommunicator::new(),
//!         election.subscribe(),
//!     )?;
//!     election.set_leader(true);
//!
//!     let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//!     let loop_handle = tokio::spawn(controller.run(shutdown_rx));
//!     tokio::signal::ctrl_c().await?;
//!     let _ = shutdown_tx.send(());
//!     let _ = loop_handle.await;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod clock;
pub mod communicator;
pub mod config;
pub mod controller;
pub mod election;
pub mod error;
pub mod events;
pub mod generator;
pub mod handler;
pub mod host_info;
pub mod observability;
pub mod state;
pub mod store;
pub mod topology;
pub mod version_tracker;

// Re-exports
pub use controller::{ControllerHandle, FleetController, WantedStateOutcome};
pub use error::{ControllerError, Result};
pub use state::{ClusterState, ClusterStateBundle, Node, NodeState, NodeType, State};
