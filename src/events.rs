//! Human-readable cluster events.
//!
//! The handler, broadcaster and control loop push [`Event`]s onto an
//! [`EventLog`]: a bounded, newest-last history plus a broadcast channel for
//! live subscribers. Events are kept apart from `tracing` logs; they describe
//! what happened to the cluster in terms an operator cares about.

use crate::clock::TimestampMs;
use crate::state::Node;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// What kind of thing happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Node events
    ReportedStateChanged,
    WantedStateChanged,
    GeneratedStateChanged,
    ServiceDiscovery,
    CrashCounter,
    InitTimeout,
    GracePeriodExpired,

    // Cluster events
    SystemStateChanged,
    FeedBlockChanged,
    Convergence,
    Leadership,
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::ReportedStateChanged
            | EventKind::WantedStateChanged
            | EventKind::GeneratedStateChanged
            | EventKind::ServiceDiscovery
            | EventKind::CrashCounter
            | EventKind::InitTimeout
            | EventKind::GracePeriodExpired => EventCategory::Node,

            EventKind::SystemStateChanged
            | EventKind::FeedBlockChanged
            | EventKind::Convergence
            | EventKind::Leadership => EventCategory::Cluster,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Node,
    Cluster,
}

/// A single event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number within the log, starting at 1.
    pub id: u64,
    pub kind: EventKind,
    pub time: DateTime<Utc>,
    pub time_ms: TimestampMs,
    /// The node concerned, for node events.
    pub node: Option<Node>,
    pub bucket_space: Option<String>,
    pub description: String,
}

impl Event {
    pub fn node(kind: EventKind, node: Node, description: impl Into<String>, time_ms: TimestampMs) -> Self {
        Self::new(kind, Some(node), description, time_ms)
    }

    pub fn cluster(kind: EventKind, description: impl Into<String>, time_ms: TimestampMs) -> Self {
        Self::new(kind, None, description, time_ms)
    }

    fn new(
        kind: EventKind,
        node: Option<Node>,
        description: impl Into<String>,
        time_ms: TimestampMs,
    ) -> Self {
        Self {
            id: 0,
            kind,
            time: DateTime::<Utc>::from_timestamp_millis(time_ms as i64).unwrap_or_default(),
            time_ms,
            node,
            bucket_space: None,
            description: description.into(),
        }
    }

    pub fn with_bucket_space(mut self, space: impl Into<String>) -> Self {
        self.bucket_space = Some(space.into());
        self
    }
}

/// Query filter over the event history.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Kinds to include (empty = all).
    pub kinds: HashSet<EventKind>,
    /// Categories to include (empty = all).
    pub categories: HashSet<EventCategory>,
    pub node: Option<Node>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn categories(mut self, categories: impl IntoIterator<Item = EventCategory>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&event.kind.category()) {
            return false;
        }
        match self.node {
            Some(node) => event.node == Some(node),
            None => true,
        }
    }
}

/// Bounded event history with live fan-out.
pub struct EventLog {
    max_events: usize,
    history: RwLock<VecDeque<Event>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        let (broadcast, _) = broadcast::channel(max_events.max(16));
        Self {
            max_events,
            history: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            broadcast,
        }
    }

    pub fn add(&self, mut event: Event) {
        event.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_id = event.id,
            kind = ?event.kind,
            node = ?event.node,
            description = %event.description,
            "Cluster event"
        );

        {
            let mut history = self.history.write();
            if self.max_events > 0 && history.len() >= self.max_events {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No subscribers is fine.
        let _ = self.broadcast.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Up to `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }

    /// Up to `limit` events matching `filter`, newest first.
    pub fn query(&self, filter: &EventFilter, limit: usize) -> Vec<Event> {
        self.history
            .read()
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// All retained events about `node`, oldest first.
    pub fn for_node(&self, node: Node) -> Vec<Event> {
        self.history
            .read()
            .iter()
            .filter(|e| e.node == Some(node))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.read().is_empty()
    }
}
