//! Durable coordination store.
//!
//! [`CoordinationStore`] is the raw, fallible interface to a single-writer
//! versioned key-value store (in production something like ZooKeeper).
//! [`DatabaseHandler`] wraps it so that an unavailable store degrades to
//! empty results and refused writes instead of errors.

use crate::error::{ControllerError, Result};
use crate::state::{ClusterStateBundle, ClusterStateBundleRecord, Node, NodeState};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wanted states keyed by node name (`storage.3`), values in node state wire form.
pub type WantedStateRecords = BTreeMap<String, String>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn store_last_published_state_bundle(&self, record: ClusterStateBundleRecord) -> Result<()>;

    async fn retrieve_last_published_state_bundle(&self) -> Result<Option<ClusterStateBundleRecord>>;

    async fn store_latest_version(&self, version: u32) -> Result<()>;

    async fn retrieve_latest_version(&self) -> Result<Option<u32>>;

    async fn store_wanted_states(&self, states: WantedStateRecords) -> Result<()>;

    async fn retrieve_wanted_states(&self) -> Result<WantedStateRecords>;

    /// Record which controller `controller_index` votes for as master.
    async fn store_master_vote(&self, controller_index: u16, vote: u16) -> Result<()>;

    async fn retrieve_master_votes(&self) -> Result<BTreeMap<u16, u16>>;
}

/// Degrading front for a [`CoordinationStore`].
#[derive(Clone)]
pub struct DatabaseHandler {
    store: Arc<dyn CoordinationStore>,
}

impl DatabaseHandler {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    /// Persist `bundle` and its version. Returns whether the write went through.
    pub async fn store_last_published_state_bundle(&self, bundle: &ClusterStateBundle) -> bool {
        if !self.is_connected() {
            warn!(version = bundle.version(), "Not storing cluster state bundle: store disconnected");
            return false;
        }
        let result = async {
            self.store.store_latest_version(bundle.version()).await?;
            self.store
                .store_last_published_state_bundle(bundle.to_record())
                .await
        }
        .await;
        match result {
            Ok(()) => {
                debug!(version = bundle.version(), "Stored cluster state bundle");
                true
            }
            Err(e) => {
                warn!(version = bundle.version(), error = %e, "Failed to store cluster state bundle");
                false
            }
        }
    }

    /// The last stored bundle, or an empty bundle when unavailable.
    pub async fn retrieve_last_published_state_bundle(&self) -> ClusterStateBundle {
        if !self.is_connected() {
            return ClusterStateBundle::empty();
        }
        match self.store.retrieve_last_published_state_bundle().await {
            Ok(Some(record)) => match ClusterStateBundle::from_record(&record) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(error = %e, "Stored cluster state bundle is unreadable");
                    ClusterStateBundle::empty()
                }
            },
            Ok(None) => ClusterStateBundle::empty(),
            Err(e) => {
                warn!(error = %e, "Failed to retrieve cluster state bundle");
                ClusterStateBundle::empty()
            }
        }
    }

    /// The last stored version, 0 when unknown.
    pub async fn retrieve_latest_version(&self) -> u32 {
        if !self.is_connected() {
            return 0;
        }
        match self.store.retrieve_latest_version().await {
            Ok(version) => version.unwrap_or(0),
            Err(e) => {
                warn!(error = %e, "Failed to retrieve latest cluster state version");
                0
            }
        }
    }

    /// Persist every non-default wanted state.
    pub async fn store_wanted_states(&self, states: &BTreeMap<Node, NodeState>) -> bool {
        if !self.is_connected() {
            warn!("Not storing wanted states: store disconnected");
            return false;
        }
        let records = states
            .iter()
            .filter(|(_, state)| !state.is_default_up())
            .map(|(node, state)| (node.to_string(), state.to_string()))
            .collect();
        match self.store.store_wanted_states(records).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to store wanted states");
                false
            }
        }
    }

    /// Stored wanted states; unparsable entries are skipped.
    pub async fn retrieve_wanted_states(&self) -> BTreeMap<Node, NodeState> {
        if !self.is_connected() {
            return BTreeMap::new();
        }
        let records = match self.store.retrieve_wanted_states().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to retrieve wanted states");
                return BTreeMap::new();
            }
        };
        records
            .iter()
            .filter_map(|(node, state)| match (node.parse::<Node>(), state.parse::<NodeState>()) {
                (Ok(node), Ok(state)) => Some((node, state)),
                _ => {
                    warn!(node = %node, state = %state, "Skipping unreadable wanted state");
                    None
                }
            })
            .collect()
    }

    pub async fn store_master_vote(&self, controller_index: u16, vote: u16) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.store.store_master_vote(controller_index, vote).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to store master vote");
                false
            }
        }
    }

    pub async fn retrieve_master_votes(&self) -> BTreeMap<u16, u16> {
        if !self.is_connected() {
            return BTreeMap::new();
        }
        self.store.retrieve_master_votes().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to retrieve master votes");
            BTreeMap::new()
        })
    }
}

#[derive(Default)]
struct MemoryStoreData {
    bundle: Option<String>,
    latest_version: Option<u32>,
    wanted_states: Option<String>,
    master_votes: BTreeMap<u16, u16>,
}

/// In-process store keeping JSON-encoded values, with a switchable connection.
pub struct MemoryStore {
    data: RwLock<MemoryStoreData>,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(MemoryStoreData::default()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ControllerError::StoreUnavailable("memory store disconnected".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn store_last_published_state_bundle(&self, record: ClusterStateBundleRecord) -> Result<()> {
        self.check_connected()?;
        let json = serde_json::to_string(&record)?;
        self.data.write().bundle = Some(json);
        Ok(())
    }

    async fn retrieve_last_published_state_bundle(&self) -> Result<Option<ClusterStateBundleRecord>> {
        self.check_connected()?;
        let data = self.data.read();
        match &data.bundle {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn store_latest_version(&self, version: u32) -> Result<()> {
        self.check_connected()?;
        self.data.write().latest_version = Some(version);
        Ok(())
    }

    async fn retrieve_latest_version(&self) -> Result<Option<u32>> {
        self.check_connected()?;
        Ok(self.data.read().latest_version)
    }

    async fn store_wanted_states(&self, states: WantedStateRecords) -> Result<()> {
        self.check_connected()?;
        let json = serde_json::to_string(&states)?;
        self.data.write().wanted_states = Some(json);
        Ok(())
    }

    async fn retrieve_wanted_states(&self) -> Result<WantedStateRecords> {
        self.check_connected()?;
        let data = self.data.read();
        match &data.wanted_states {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn store_master_vote(&self, controller_index: u16, vote: u16) -> Result<()> {
        self.check_connected()?;
        self.data.write().master_votes.insert(controller_index, vote);
        Ok(())
    }

    async fn retrieve_master_votes(&self) -> Result<BTreeMap<u16, u16>> {
        self.check_connected()?;
        Ok(self.data.read().master_votes.clone())
    }
}
