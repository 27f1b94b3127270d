use std::sync::Arc;
use std::time::Duration;

use fleetlink_core::Scheduler;

use crate::connector::ClientConnector;
use crate::events::EventSender;
use crate::matchmaking::RankStore;
use crate::packet::PacketBus;

/// Shared services of a running front-end
///
/// Built once at startup and handed to every subsystem constructor.
#[derive(Clone)]
pub struct ProxyContext {
    pub scheduler: Scheduler,
    pub bus: Arc<PacketBus>,
    pub connector: Arc<dyn ClientConnector>,
    pub rank_store: Arc<dyn RankStore>,
    /// Upper bound for moving one client onto a worker
    pub connect_timeout: Duration,
    pub events: EventSender,
}

impl ProxyContext {
    /// Context with a fresh event channel
    #[must_use]
    pub fn new(
        scheduler: Scheduler,
        bus: Arc<PacketBus>,
        connector: Arc<dyn ClientConnector>,
        rank_store: Arc<dyn RankStore>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            bus,
            connector,
            rank_store,
            connect_timeout,
            events: EventSender::new(),
        }
    }
}
