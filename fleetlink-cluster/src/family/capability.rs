//! Narrow capabilities shared by the liveness tracker and the balancers

use std::sync::Arc;

use fleetlink_core::models::WorkerId;

use super::worker::Worker;
use crate::error::Result;

/// Why a worker left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisterReason {
    /// Liveness countdown reached zero
    Stale,
    /// Worker sent a disconnect packet
    Disconnected,
    /// Front-end shut down
    Shutdown,
}

/// Registration lifecycle of workers
pub trait WorkerLifecycle: Send + Sync {
    /// Validated handshake request
    type Request;

    fn register(&self, request: Self::Request) -> Result<Arc<Worker>>;

    fn unregister(&self, id: WorkerId, reason: UnregisterReason) -> Result<Arc<Worker>>;

    /// Record a keep-alive: reset the countdown and take the reported count.
    fn heartbeat(&self, id: WorkerId, player_count: u32) -> Result<()>;
}

/// Something that hands out, and reserves, one item at a time
pub trait Selectable {
    type Item;

    fn current(&self) -> Option<Self::Item>;

    fn lock(&self, item: &Self::Item) -> bool;

    fn unlock(&self, item: &Self::Item) -> bool;

    /// Take the current item and lock it atomically.
    fn select_and_lock(&self) -> Option<Self::Item>;

    fn size(&self, include_locked: bool) -> usize;
}

/// Worker pool as seen by a matchmaker
pub type WorkerPool = dyn Selectable<Item = Arc<Worker>> + Send + Sync;
