//! Leadership signal.
//!
//! Master election itself happens outside the controller; whatever runs it
//! flips [`MasterElection::set_leader`] and the control loop observes the
//! change through a [`LeadershipWatcher`].

use tokio::sync::watch;
use tracing::info;

/// Owner side of the leadership flag.
#[derive(Debug)]
pub struct MasterElection {
    controller_index: u16,
    tx: watch::Sender<bool>,
}

impl MasterElection {
    pub fn new(controller_index: u16) -> Self {
        let (tx, _) = watch::channel(false);
        Self { controller_index, tx }
    }

    pub fn controller_index(&self) -> u16 {
        self.controller_index
    }

    pub fn set_leader(&self, leader: bool) {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != leader;
            *current = leader;
            changed
        });
        if changed {
            info!(controller = self.controller_index, leader, "Leadership changed");
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> LeadershipWatcher {
        LeadershipWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of the leadership flag.
#[derive(Debug, Clone)]
pub struct LeadershipWatcher {
    rx: watch::Receiver<bool>,
}

impl LeadershipWatcher {
    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }

    /// Leadership as of the last observation, marking the current value seen.
    pub fn observe(&mut self) -> bool {
        *self.rx.borrow_and_update()
    }

    /// Whether the flag changed since the last [`observe`](Self::observe).
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Wait for the next change. Returns the new value, or `None` once the
    /// election side is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
