//! Front-end side of the magic link
//!
//! Registers workers from their first ping, keeps them alive on every
//! following one, and evicts them when their countdown decays to zero or
//! when they say goodbye.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fleetlink_core::config::MagicLinkConfig;
use fleetlink_core::models::{FamilyId, PlayerId, SessionId, WorkerId};
use fleetlink_core::TaskHandle;

use super::state::LinkSignal;
use crate::connector::ClientProfile;
use crate::context::ProxyContext;
use crate::error::{Error, Result};
use crate::events::FleetEvent;
use crate::family::{FamilyRegistry, UnregisterReason, Worker, WorkerLifecycle, WorkerSpec};
use crate::packet::{handler_fn, ids, keys, split_list, Packet, RoutingTable};

/// Handshake fields carried by a worker's first ping
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub address: String,
    pub display_name: Option<String>,
    pub magic_config: String,
    pub player_count: u32,
    pub secret: Option<String>,
}

impl RegistrationRequest {
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.address().is_empty() {
            return Err(Error::Protocol("ping without an address".to_string()));
        }
        Ok(Self {
            address: packet.address().to_string(),
            display_name: packet.text(keys::DISPLAY_NAME).filter(|s| !s.is_empty()),
            magic_config: packet.require_text(keys::MAGIC_CONFIG)?,
            player_count: packet.require_u32(keys::PLAYER_COUNT)?,
            secret: packet.text(keys::SECRET),
        })
    }
}

/// Front-end liveness tracker
pub struct MagicLinkService {
    ctx: ProxyContext,
    registry: Arc<FamilyRegistry>,
    config: MagicLinkConfig,
    decay_task: Mutex<Option<TaskHandle>>,
}

impl MagicLinkService {
    #[must_use]
    pub fn new(ctx: ProxyContext, registry: Arc<FamilyRegistry>, config: MagicLinkConfig) -> Self {
        Self {
            ctx,
            registry,
            config,
            decay_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<FamilyRegistry> {
        &self.registry
    }

    /// Registration, lock and placement events of the whole front-end
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<FleetEvent> {
        self.ctx.events.subscribe()
    }

    /// Routes for every worker-origin packet the front-end understands
    #[must_use]
    pub fn routes(self: &Arc<Self>) -> RoutingTable {
        let ping = Arc::clone(self);
        let disconnect = Arc::clone(self);
        let lock = Arc::clone(self);
        let unlock = Arc::clone(self);
        let send_player = Arc::clone(self);
        let game_end = Arc::clone(self);

        RoutingTable::new()
            .route(
                ids::PING,
                handler_fn(move |p| {
                    let this = ping.clone();
                    async move { this.handle_ping(p).await }
                }),
            )
            .route(
                ids::DISCONNECT,
                handler_fn(move |p| {
                    let this = disconnect.clone();
                    async move { this.handle_disconnect(&p) }
                }),
            )
            .route(
                ids::LOCK_SERVER,
                handler_fn(move |p| {
                    let this = lock.clone();
                    async move { this.handle_lock(&p, true) }
                }),
            )
            .route(
                ids::UNLOCK_SERVER,
                handler_fn(move |p| {
                    let this = unlock.clone();
                    async move { this.handle_lock(&p, false) }
                }),
            )
            .route(
                ids::SEND_PLAYER,
                handler_fn(move |p| {
                    let this = send_player.clone();
                    async move { this.handle_send_player(&p) }
                }),
            )
            .route(
                ids::RANKED_GAME_END,
                handler_fn(move |p| {
                    let this = game_end.clone();
                    async move { this.handle_game_end(&p) }
                }),
            )
    }

    /// Subscribe to the bus and start the decay tick.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ctx.bus.subscribe(self.routes()).await?;

        let this = Arc::clone(self);
        let handle = self.ctx.scheduler.schedule_recurring(
            "magic-link-decay",
            self.config.decay_period(),
            move || {
                let this = this.clone();
                async move {
                    this.decay_tick();
                    Ok(())
                }
            },
        );
        if let Some(previous) = self.decay_task.lock().replace(handle) {
            previous.cancel();
        }

        info!(
            countdown = self.config.countdown,
            decay_amount = self.config.decay_amount,
            decay_period = ?self.config.decay_period(),
            "Magic link started"
        );
        Ok(())
    }

    /// Ping from a worker: a keep-alive if it is registered, a handshake
    /// otherwise. A refused handshake is answered, not propagated.
    pub async fn handle_ping(&self, packet: Packet) -> Result<()> {
        if let Some(worker) = self.registry.worker_by_address(packet.address()) {
            let count = packet
                .integer(keys::PLAYER_COUNT)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or_else(|| worker.player_count());
            return self.heartbeat(worker.id(), count);
        }

        let outcome = RegistrationRequest::from_packet(&packet).and_then(|r| self.register(r));
        match outcome {
            Ok(worker) => self.publish(success_packet(&worker, &self.config)?).await,
            Err(e) => {
                warn!(address = %packet.address(), error = %e, "Worker registration refused");
                self.publish(failure_packet(packet.address(), &e, &self.config)?)
                    .await
            }
        }
    }

    fn handle_disconnect(&self, packet: &Packet) -> Result<()> {
        let Some(worker) = self.registry.worker_by_address(packet.address()) else {
            debug!(address = %packet.address(), "Disconnect from unknown worker");
            return Ok(());
        };
        self.unregister(worker.id(), UnregisterReason::Disconnected)?;
        Ok(())
    }

    fn handle_lock(&self, packet: &Packet, lock: bool) -> Result<()> {
        let worker = self.known_worker(packet.address())?;
        let family = self
            .registry
            .family(worker.family())
            .ok_or_else(|| Error::NotFound(format!("family {}", worker.family())))?;

        let changed = if lock {
            family.load_balancer().lock(worker.id())
        } else {
            family.load_balancer().unlock(worker.id())
        };
        debug!(worker = %worker.label(), lock, changed, "Worker lock requested");
        Ok(())
    }

    /// Moving a player waits on the connector, so it runs off the bus task.
    fn handle_send_player(&self, packet: &Packet) -> Result<()> {
        let player = PlayerId::from(packet.require_text(keys::PLAYER)?);
        let family_id = FamilyId::from(packet.require_text(keys::FAMILY)?);
        let family = self
            .registry
            .family(&family_id)
            .ok_or_else(|| Error::NotFound(format!("family {family_id}")))?;

        tokio::spawn(async move {
            if let Err(e) = family.connect(&ClientProfile::new(player.clone())).await {
                warn!(player = %player, family = %family.id(), error = %e, "Send player failed");
            }
        });
        Ok(())
    }

    fn handle_game_end(&self, packet: &Packet) -> Result<()> {
        let session = SessionId::from_string(packet.require_text(keys::SESSION)?);
        let winners = player_list(packet, keys::WINNERS);
        let losers = player_list(packet, keys::LOSERS);

        for family in self.registry.families() {
            let Some(matchmaker) = family.matchmaker() else {
                continue;
            };
            match matchmaker.end_session(&session, &winners, &losers) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound(format!("no running session {session}")))
    }

    /// Decay every countdown once and evict the workers that reach zero.
    /// Returns the evicted ids.
    pub fn decay_tick(&self) -> Vec<WorkerId> {
        let mut evicted = Vec::new();
        for worker in self.registry.workers() {
            if worker.decay(self.config.decay_amount) > 0 {
                continue;
            }
            match self.unregister(worker.id(), UnregisterReason::Stale) {
                Ok(_) => evicted.push(worker.id()),
                Err(e) => debug!(worker = %worker.label(), error = %e, "Stale worker already gone"),
            }
        }
        evicted
    }

    /// Cancel the decay tick, tell every worker the front-end is going away
    /// and empty the registry. Send failures are ignored.
    pub async fn shutdown(&self) {
        if let Some(task) = self.decay_task.lock().take() {
            task.cancel();
        }

        for worker in self.registry.workers() {
            let goodbye = Packet::builder()
                .identification(ids::DISCONNECT)
                .from_frontend()
                .address(worker.address())
                .parameter(keys::REASON, "front-end shutting down")
                .build();
            if let Ok(packet) = goodbye {
                if let Err(e) = self.ctx.bus.publish(&packet).await {
                    debug!(worker = %worker.label(), error = %e, "Goodbye not delivered");
                }
            }
            let _ = self.unregister(worker.id(), UnregisterReason::Shutdown);
        }
        info!("Magic link stopped");
    }

    fn known_worker(&self, address: &str) -> Result<Arc<Worker>> {
        self.registry
            .worker_by_address(address)
            .ok_or_else(|| Error::NotFound(format!("no worker registered at {address}")))
    }

    async fn publish(&self, packet: Packet) -> Result<()> {
        self.ctx.bus.publish(&packet).await
    }

    fn check_secret(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = self.config.secret.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        if presented == Some(expected) {
            Ok(())
        } else {
            Err(Error::Registration("secret does not match".to_string()))
        }
    }
}

impl WorkerLifecycle for MagicLinkService {
    type Request = RegistrationRequest;

    fn register(&self, request: RegistrationRequest) -> Result<Arc<Worker>> {
        let profile = self
            .config
            .magic_configs
            .get(&request.magic_config)
            .ok_or_else(|| {
                Error::Registration(format!("unknown magic config `{}`", request.magic_config))
            })?;

        self.check_secret(request.secret.as_deref())?;

        if profile.hard_cap == 0 {
            return Err(Error::Registration(format!(
                "magic config `{}` has a hard cap of 0",
                request.magic_config
            )));
        }
        if request.player_count > profile.hard_cap {
            return Err(Error::Registration(format!(
                "reported {} players, above the hard cap of {}",
                request.player_count, profile.hard_cap
            )));
        }

        let worker = Arc::new(Worker::new(WorkerSpec {
            id: WorkerId::new(),
            address: request.address,
            display_name: request.display_name,
            family: FamilyId::from(profile.family.as_str()),
            magic_config: request.magic_config,
            soft_cap: profile.soft_cap,
            hard_cap: profile.hard_cap,
            weight: profile.weight,
            countdown: self.config.countdown,
            player_count: request.player_count,
        }));
        self.registry.add_worker(worker.clone())?;

        self.ctx.events.emit(FleetEvent::Registered {
            worker_id: worker.id(),
            family: worker.family().clone(),
            address: worker.address().to_string(),
        });
        Ok(worker)
    }

    fn unregister(&self, id: WorkerId, reason: UnregisterReason) -> Result<Arc<Worker>> {
        let worker = self
            .registry
            .remove_worker(id)
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;

        let signal = match reason {
            UnregisterReason::Stale => LinkSignal::CountdownExpired,
            UnregisterReason::Disconnected | UnregisterReason::Shutdown => LinkSignal::Disconnect,
        };
        worker.signal(signal);

        info!(
            worker = %worker.label(),
            id = %id,
            family = %worker.family(),
            reason = ?reason,
            "Worker unregistered"
        );
        self.ctx.events.emit(FleetEvent::Unregistered {
            worker_id: id,
            family: worker.family().clone(),
            address: worker.address().to_string(),
            reason,
        });
        Ok(worker)
    }

    fn heartbeat(&self, id: WorkerId, player_count: u32) -> Result<()> {
        let worker = self
            .registry
            .worker(id)
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;
        worker.reset_countdown(self.config.countdown);
        worker.set_player_count(player_count);
        worker.signal(LinkSignal::KeepAlive);
        debug!(worker = %worker.label(), players = player_count, "Keep-alive");
        Ok(())
    }
}

fn player_list(packet: &Packet, key: &str) -> Vec<PlayerId> {
    packet
        .text(key)
        .map(|raw| split_list(&raw).into_iter().map(PlayerId::from).collect())
        .unwrap_or_default()
}

fn success_packet(worker: &Worker, config: &MagicLinkConfig) -> Result<Packet> {
    Packet::builder()
        .identification(ids::PING_RESPONSE_SUCCESS)
        .from_frontend()
        .address(worker.address())
        .parameter(keys::UUID, worker.id().to_string())
        .parameter(keys::FAMILY, worker.family().as_str())
        .parameter(keys::SOFT_CAP, worker.soft_cap())
        .parameter(keys::HARD_CAP, worker.hard_cap())
        .parameter(keys::WEIGHT, worker.weight())
        .parameter(keys::PING_INTERVAL, config.heartbeat_interval_seconds)
        .build()
}

fn failure_packet(address: &str, error: &Error, config: &MagicLinkConfig) -> Result<Packet> {
    Packet::builder()
        .identification(ids::PING_RESPONSE_FAIL)
        .from_frontend()
        .address(address)
        .parameter(keys::REASON, error.to_string())
        .parameter(keys::PING_INTERVAL, config.heartbeat_interval_seconds)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockClientConnector;
    use crate::family::Family;
    use crate::magic_link::LinkState;
    use crate::matchmaking::MemoryRankStore;
    use crate::packet::{BusSettings, MemoryTransport, PacketBus};
    use fleetlink_core::config::{FamilyConfig, LoadBalancerConfig, MagicConfigEntry};
    use fleetlink_core::Scheduler;
    use std::collections::HashMap;
    use std::time::Duration;

    fn link_config() -> MagicLinkConfig {
        let mut magic_configs = HashMap::new();
        magic_configs.insert(
            "default".to_string(),
            MagicConfigEntry {
                family: "lobby".to_string(),
                soft_cap: 20,
                hard_cap: 30,
                weight: 2,
            },
        );
        MagicLinkConfig {
            secret: Some("hunter2".to_string()),
            countdown: 15,
            decay_amount: 5,
            magic_configs,
            ..MagicLinkConfig::default()
        }
    }

    fn service() -> MagicLinkService {
        let ctx = ProxyContext::new(
            Scheduler::new(),
            Arc::new(PacketBus::new(
                Arc::new(MemoryTransport::new()),
                BusSettings::frontend("test", 50),
            )),
            Arc::new(MockClientConnector::new()),
            Arc::new(MemoryRankStore::new()),
            Duration::from_secs(5),
        );
        let registry = Arc::new(FamilyRegistry::new());
        let family = FamilyConfig {
            id: "lobby".to_string(),
            load_balancer: LoadBalancerConfig::default(),
            matchmaker: None,
            residence: None,
        };
        registry.add_family(Arc::new(Family::new(&family, ctx.clone()).unwrap()));
        MagicLinkService::new(ctx, registry, link_config())
    }

    fn request(address: &str) -> RegistrationRequest {
        RegistrationRequest {
            address: address.to_string(),
            display_name: Some("lobby-1".to_string()),
            magic_config: "default".to_string(),
            player_count: 3,
            secret: Some("hunter2".to_string()),
        }
    }

    #[test]
    fn test_register_adopts_magic_config() {
        let service = service();
        let worker = service.register(request("10.0.0.1:25565")).unwrap();

        assert_eq!(worker.family().as_str(), "lobby");
        assert_eq!(worker.hard_cap(), 30);
        assert_eq!(worker.weight(), 2);
        assert_eq!(worker.player_count(), 3);
        assert_eq!(worker.countdown(), 15);
        assert!(service.registry().worker_by_address("10.0.0.1:25565").is_some());
    }

    #[test]
    fn test_register_validation() {
        let service = service();

        let mut wrong_secret = request("a:1");
        wrong_secret.secret = Some("nope".to_string());
        assert!(matches!(service.register(wrong_secret), Err(Error::Registration(_))));

        let mut unknown = request("a:1");
        unknown.magic_config = "arena".to_string();
        assert!(matches!(service.register(unknown), Err(Error::Registration(_))));

        let mut crowded = request("a:1");
        crowded.player_count = 31;
        assert!(matches!(service.register(crowded), Err(Error::Registration(_))));

        assert_eq!(service.registry().worker_count(), 0);
    }

    #[test]
    fn test_stale_exactly_at_zero() {
        let service = service();
        let worker = service.register(request("a:1")).unwrap();

        assert!(service.decay_tick().is_empty());
        assert!(service.decay_tick().is_empty());
        assert_eq!(worker.countdown(), 5);
        assert!(service.registry().worker(worker.id()).is_some());

        assert_eq!(service.decay_tick(), vec![worker.id()]);
        assert!(service.registry().worker(worker.id()).is_none());
        assert_eq!(worker.link_state(), LinkState::Stale);
    }

    #[test]
    fn test_heartbeat_resets_countdown() {
        let service = service();
        let worker = service.register(request("a:1")).unwrap();

        service.decay_tick();
        service.decay_tick();
        service.heartbeat(worker.id(), 7).unwrap();
        assert_eq!(worker.countdown(), 15);
        assert_eq!(worker.player_count(), 7);

        service.decay_tick();
        assert!(service.registry().worker(worker.id()).is_some());
    }

    #[test]
    fn test_unregister_emits_event() {
        let service = service();
        let mut events = service.subscribe_events();
        let worker = service.register(request("a:1")).unwrap();

        service
            .unregister(worker.id(), UnregisterReason::Disconnected)
            .unwrap();
        assert_eq!(worker.link_state(), LinkState::Disconnected);

        assert!(matches!(events.try_recv(), Ok(FleetEvent::Registered { .. })));
        match events.try_recv() {
            Ok(FleetEvent::Unregistered { worker_id, reason, .. }) => {
                assert_eq!(worker_id, worker.id());
                assert_eq!(reason, UnregisterReason::Disconnected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(service
            .unregister(worker.id(), UnregisterReason::Disconnected)
            .is_err());
    }

    #[test]
    fn test_lock_packet_reports_lock_change() {
        let service = service();
        let worker = service.register(request("a:1")).unwrap();
        let mut events = service.subscribe_events();

        let lock = Packet::builder()
            .identification(ids::LOCK_SERVER)
            .from_worker()
            .address("a:1")
            .build()
            .unwrap();
        service.handle_lock(&lock, true).unwrap();
        service.handle_lock(&lock, true).unwrap();
        service.handle_lock(&lock, false).unwrap();

        match events.try_recv() {
            Ok(FleetEvent::WorkerLocked { worker_id, family }) => {
                assert_eq!(worker_id, worker.id());
                assert_eq!(family.as_str(), "lobby");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events.try_recv(), Ok(FleetEvent::WorkerUnlocked { .. })));
        assert!(events.try_recv().is_err());
    }
}
