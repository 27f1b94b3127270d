//! Front-end notifications
//!
//! One broadcast channel per front-end carries worker registration, lock
//! changes and player placement. A subscriber that falls behind loses the
//! oldest events.

use tokio::sync::broadcast;

use fleetlink_core::models::{FamilyId, PlayerId, WorkerId};

use crate::family::UnregisterReason;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum FleetEvent {
    Registered {
        worker_id: WorkerId,
        family: FamilyId,
        address: String,
    },
    Unregistered {
        worker_id: WorkerId,
        family: FamilyId,
        address: String,
        reason: UnregisterReason,
    },
    /// Taken out of rotation, by its own request or by a matchmaker
    WorkerLocked {
        worker_id: WorkerId,
        family: FamilyId,
    },
    WorkerUnlocked {
        worker_id: WorkerId,
        family: FamilyId,
    },
    /// A player was moved onto a worker of the family
    PlayerJoined {
        player: PlayerId,
        worker_id: WorkerId,
        family: FamilyId,
    },
}

/// Sending side of the event channel, shared through the proxy context
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventSender {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Deliver to the current subscribers. Having none is fine.
    pub fn emit(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}
