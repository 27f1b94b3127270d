//! Worker side of the magic link

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fleetlink_core::config::WorkerConfig;
use fleetlink_core::models::{FamilyId, PlayerId, SessionId, WorkerId};
use fleetlink_core::{Scheduler, TaskHandle};

use super::state::{LinkSignal, LinkState};
use crate::error::{Error, Result};
use crate::packet::{
    handler_fn, ids, keys, split_list, Packet, PacketBus, PacketIdentification, RoutingTable,
};

const EVENT_BUFFER: usize = 64;

/// How a worker introduces itself in every ping
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub address: String,
    pub display_name: Option<String>,
    pub magic_config: String,
    pub secret: Option<String>,
}

impl From<&WorkerConfig> for WorkerIdentity {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            address: config.address.clone(),
            display_name: config.display_name.clone(),
            magic_config: config.magic_config.clone(),
            secret: config.secret.clone(),
        }
    }
}

/// What the front-end handed out on a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: WorkerId,
    pub family: FamilyId,
    pub soft_cap: u32,
    pub hard_cap: u32,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Linked(Assignment),
    Rejected { reason: String },
    /// Front-end went away; pings continue until a new one answers
    Released,
    SessionReady {
        session: SessionId,
        family: FamilyId,
        players: Vec<PlayerId>,
    },
}

/// Worker-side liveness client
///
/// Pings the front-end on an adaptive delay. The delay starts at the
/// configured interval and follows whatever the front-end asks for in its
/// handshake responses.
pub struct MagicLinkClient {
    bus: Arc<PacketBus>,
    scheduler: Scheduler,
    identity: WorkerIdentity,
    state: Mutex<LinkState>,
    assignment: RwLock<Option<Assignment>>,
    player_count: AtomicU32,
    ping_delay_secs: AtomicU64,
    ping_task: Mutex<Option<TaskHandle>>,
    closed: AtomicBool,
    events: broadcast::Sender<WorkerEvent>,
}

impl MagicLinkClient {
    #[must_use]
    pub fn new(
        bus: Arc<PacketBus>,
        scheduler: Scheduler,
        identity: WorkerIdentity,
        ping_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            bus,
            scheduler,
            identity,
            state: Mutex::new(LinkState::Searching),
            assignment: RwLock::new(None),
            player_count: AtomicU32::new(0),
            ping_delay_secs: AtomicU64::new(ping_interval.as_secs().max(1)),
            ping_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            events,
        }
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    #[must_use]
    pub fn assignment(&self) -> Option<Assignment> {
        self.assignment.read().clone()
    }

    /// Delay before the next ping
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_delay_secs.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn player_count(&self) -> u32 {
        self.player_count.load(Ordering::Acquire)
    }

    /// Reported in the next ping
    pub fn set_player_count(&self, count: u32) {
        self.player_count.store(count, Ordering::Release);
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn routes(self: &Arc<Self>) -> RoutingTable {
        let success = Arc::clone(self);
        let failure = Arc::clone(self);
        let released = Arc::clone(self);
        let ready = Arc::clone(self);

        RoutingTable::new()
            .route(
                ids::PING_RESPONSE_SUCCESS,
                handler_fn(move |p| {
                    let this = success.clone();
                    async move { this.handle_success(&p) }
                }),
            )
            .route(
                ids::PING_RESPONSE_FAIL,
                handler_fn(move |p| {
                    let this = failure.clone();
                    async move {
                        this.handle_failure(&p);
                        Ok(())
                    }
                }),
            )
            .route(
                ids::DISCONNECT,
                handler_fn(move |_| {
                    let this = released.clone();
                    async move {
                        this.handle_released();
                        Ok(())
                    }
                }),
            )
            .route(
                ids::RANKED_GAME_READY,
                handler_fn(move |p| {
                    let this = ready.clone();
                    async move { this.handle_session_ready(&p) }
                }),
            )
    }

    /// Subscribe, send the first ping right away and keep pinging.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.bus.subscribe(self.routes()).await?;
        if let Err(e) = self.ping().await {
            warn!(error = %e, "First ping failed, retrying on schedule");
        }
        self.schedule_next_ping();
        info!(
            address = %self.identity.address,
            magic_config = %self.identity.magic_config,
            "Magic link client started"
        );
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let mut builder = Packet::builder()
            .identification(ids::PING)
            .from_worker()
            .address(&self.identity.address)
            .parameter(keys::MAGIC_CONFIG, self.identity.magic_config.as_str())
            .parameter(keys::PLAYER_COUNT, self.player_count());
        if let Some(name) = &self.identity.display_name {
            builder = builder.parameter(keys::DISPLAY_NAME, name.as_str());
        }
        if let Some(secret) = &self.identity.secret {
            builder = builder.parameter(keys::SECRET, secret.as_str());
        }

        self.bus.publish(&builder.build()?).await?;
        self.transition(LinkSignal::PingSent);
        Ok(())
    }

    fn schedule_next_ping(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let this = Arc::clone(self);
        let handle = self
            .scheduler
            .schedule_once("magic-link-ping", self.ping_interval(), move || async move {
                let result = this.ping().await;
                this.schedule_next_ping();
                result.map_err(anyhow::Error::from)
            });
        self.install_ping_task(handle);
    }

    /// Store the next ping, or cancel it if shutdown got in first. The
    /// replaced handle belongs to the tick that is scheduling this one.
    fn install_ping_task(&self, handle: TaskHandle) {
        let mut slot = self.ping_task.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(slot);
            handle.cancel();
            return;
        }
        *slot = Some(handle);
    }

    fn handle_success(&self, packet: &Packet) -> Result<()> {
        let raw_id = packet.require_text(keys::UUID)?;
        let worker_id = WorkerId::parse(&raw_id)
            .map_err(|e| Error::Protocol(format!("invalid worker uuid {raw_id:?}: {e}")))?;
        let assignment = Assignment {
            worker_id,
            family: FamilyId::from(packet.require_text(keys::FAMILY)?),
            soft_cap: packet.require_u32(keys::SOFT_CAP)?,
            hard_cap: packet.require_u32(keys::HARD_CAP)?,
            weight: packet.require_u32(keys::WEIGHT)?,
        };
        self.adopt_interval(packet);

        let was_linked = self.state() == LinkState::Linked;
        self.transition(LinkSignal::HandshakeAccepted);
        let changed = self.assignment.read().as_ref() != Some(&assignment);
        *self.assignment.write() = Some(assignment.clone());

        if !was_linked || changed {
            info!(
                worker_id = %assignment.worker_id,
                family = %assignment.family,
                ping_interval = ?self.ping_interval(),
                "Linked to front-end"
            );
            let _ = self.events.send(WorkerEvent::Linked(assignment));
        }
        Ok(())
    }

    fn handle_failure(&self, packet: &Packet) {
        let reason = packet
            .text(keys::REASON)
            .unwrap_or_else(|| "no reason given".to_string());
        self.adopt_interval(packet);
        self.reset();
        warn!(reason = %reason, retry_in = ?self.ping_interval(), "Handshake refused");
        let _ = self.events.send(WorkerEvent::Rejected { reason });
    }

    fn handle_released(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.reset();
        info!("Front-end released this worker, searching again");
        let _ = self.events.send(WorkerEvent::Released);
    }

    fn handle_session_ready(&self, packet: &Packet) -> Result<()> {
        let session = SessionId::from_string(packet.require_text(keys::SESSION)?);
        let family = FamilyId::from(packet.text(keys::FAMILY).unwrap_or_default());
        let players: Vec<PlayerId> = packet
            .text(keys::PLAYERS)
            .map(|raw| split_list(&raw).into_iter().map(PlayerId::from).collect())
            .unwrap_or_default();

        info!(session = %session, players = players.len(), "Ranked session ready");
        let _ = self.events.send(WorkerEvent::SessionReady {
            session,
            family,
            players,
        });
        Ok(())
    }

    /// Ask the front-end to take this worker out of rotation.
    pub async fn lock(&self) -> Result<()> {
        self.send(ids::LOCK_SERVER, Vec::new()).await
    }

    pub async fn unlock(&self) -> Result<()> {
        self.send(ids::UNLOCK_SERVER, Vec::new()).await
    }

    /// Ask the front-end to move `player` into `family`.
    pub async fn send_player(&self, player: &PlayerId, family: &FamilyId) -> Result<()> {
        self.send(
            ids::SEND_PLAYER,
            vec![
                (keys::PLAYER, player.as_str().to_string()),
                (keys::FAMILY, family.as_str().to_string()),
            ],
        )
        .await
    }

    /// Report the result of a ranked session.
    pub async fn end_session(
        &self,
        session: &SessionId,
        winners: &[PlayerId],
        losers: &[PlayerId],
    ) -> Result<()> {
        self.send(
            ids::RANKED_GAME_END,
            vec![
                (keys::SESSION, session.as_str().to_string()),
                (keys::WINNERS, join_players(winners)),
                (keys::LOSERS, join_players(losers)),
            ],
        )
        .await
    }

    /// Stop pinging and say goodbye. A failed goodbye is only logged.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.ping_task.lock().take() {
            task.cancel();
        }
        if let Err(e) = self.send(ids::DISCONNECT, Vec::new()).await {
            debug!(error = %e, "Disconnect packet not delivered");
        }
        self.transition(LinkSignal::Disconnect);
        info!(address = %self.identity.address, "Magic link client stopped");
    }

    async fn send(
        &self,
        identification: PacketIdentification,
        parameters: Vec<(&'static str, String)>,
    ) -> Result<()> {
        let mut builder = Packet::builder()
            .identification(identification)
            .from_worker()
            .address(&self.identity.address);
        for (key, value) in parameters {
            builder = builder.parameter(key, value);
        }
        self.bus.publish(&builder.build()?).await
    }

    fn adopt_interval(&self, packet: &Packet) {
        let Some(secs) = packet
            .integer(keys::PING_INTERVAL)
            .and_then(|n| u64::try_from(n).ok())
            .filter(|n| *n > 0)
        else {
            return;
        };
        let previous = self.ping_delay_secs.swap(secs, Ordering::AcqRel);
        if previous != secs {
            debug!(previous, current = secs, "Ping interval changed by front-end");
        }
    }

    fn transition(&self, signal: LinkSignal) {
        let mut state = self.state.lock();
        if let Some(next) = state.apply(signal) {
            *state = next;
        }
    }

    /// Back to searching, dropping the assignment.
    fn reset(&self) {
        {
            let mut state = self.state.lock();
            if *state != LinkState::Disconnected {
                *state = LinkState::Searching;
            }
        }
        *self.assignment.write() = None;
    }
}

fn join_players(players: &[PlayerId]) -> String {
    players
        .iter()
        .map(PlayerId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
