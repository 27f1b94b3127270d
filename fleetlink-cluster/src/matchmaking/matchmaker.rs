//! Ranked session assembly for one family
//!
//! Players wait in a queue ordered by score. Three recurring tasks move them
//! along: a full re-sort of the queue, session assembly, and placement of
//! assembled sessions on locked workers.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use fleetlink_core::config::{MatchmakerConfig, RankingSchema};
use fleetlink_core::models::{FamilyId, PlayerId, SessionId, WorkerId};
use fleetlink_core::{Scheduler, TaskHandle};

use super::ranking::{queue_order, RankedPlayer};
use super::session::{Session, TeamShape};
use crate::connector::connect_with_timeout;
use crate::context::ProxyContext;
use crate::error::{Error, Result};
use crate::family::{Worker, WorkerPool};
use crate::packet::{ids, keys, Packet};

pub struct Matchmaker {
    family: FamilyId,
    ranking: RankingSchema,
    shape: TeamShape,
    config: MatchmakerConfig,
    pool: Arc<WorkerPool>,
    ctx: ProxyContext,

    // Lock order: waiting_players before waiting_sessions
    waiting_players: Mutex<Vec<RankedPlayer>>,
    waiting_sessions: Mutex<Vec<Session>>,
    running_sessions: DashMap<SessionId, Session>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Matchmaker {
    pub fn new(
        family: FamilyId,
        config: MatchmakerConfig,
        pool: Arc<WorkerPool>,
        ctx: ProxyContext,
    ) -> Result<Self> {
        let problems = config.problems();
        if !problems.is_empty() {
            return Err(Error::Configuration(format!(
                "matchmaker for family {family}: {}",
                problems.join("; ")
            )));
        }
        let shape = TeamShape::new(config.teams.clone());

        Ok(Self {
            family,
            ranking: config.ranking,
            shape,
            config,
            pool,
            ctx,
            waiting_players: Mutex::new(Vec::new()),
            waiting_sessions: Mutex::new(Vec::new()),
            running_sessions: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub const fn family(&self) -> &FamilyId {
        &self.family
    }

    #[must_use]
    pub fn min_players_per_game(&self) -> usize {
        self.shape.min_players()
    }

    #[must_use]
    pub fn max_players_per_game(&self) -> usize {
        self.shape.max_players()
    }

    /// Queue a player. Returns `false` if it is already queued or grouped
    /// into a waiting session.
    pub fn add(&self, player: impl Into<PlayerId>) -> bool {
        let player = player.into();
        let mut queue = self.waiting_players.lock();
        if queue.iter().any(|p| p.player_id == player) {
            return false;
        }
        if self.waiting_sessions.lock().iter().any(|s| s.contains(&player)) {
            return false;
        }

        let ranked = RankedPlayer::rank(player, self.ranking, self.ctx.rank_store.as_ref());
        // Behind every player ranked at least as high
        let pos = queue.partition_point(|p| queue_order(p, &ranked) != Ordering::Greater);
        debug!(
            family = %self.family,
            player = %ranked.player_id,
            score = ranked.score,
            position = pos,
            "Player queued"
        );
        queue.insert(pos, ranked);
        true
    }

    /// Remove a queued player by id.
    pub fn remove(&self, player: &PlayerId) -> bool {
        let mut queue = self.waiting_players.lock();
        let before = queue.len();
        queue.retain(|p| &p.player_id != player);
        queue.len() != before
    }

    #[must_use]
    pub fn contains(&self, player: &PlayerId) -> bool {
        self.waiting_players.lock().iter().any(|p| &p.player_id == player)
    }

    /// Snapshot of the queue, best first
    #[must_use]
    pub fn waiting_players(&self) -> Vec<RankedPlayer> {
        self.waiting_players.lock().clone()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.waiting_players.lock().len()
    }

    #[must_use]
    pub fn waiting_session_count(&self) -> usize {
        self.waiting_sessions.lock().len()
    }

    #[must_use]
    pub fn running_session_count(&self) -> usize {
        self.running_sessions.len()
    }

    #[must_use]
    pub fn running_session_ids(&self) -> Vec<SessionId> {
        self.running_sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Worker a running session is pinned to
    #[must_use]
    pub fn session_worker(&self, session: &SessionId) -> Option<Arc<Worker>> {
        self.running_sessions
            .get(session)
            .and_then(|s| s.worker().cloned())
    }

    /// Re-score every queued player and stable-sort the queue.
    pub fn complete_sort(&self) {
        let mut queue = self.waiting_players.lock();
        for player in queue.iter_mut() {
            *player = RankedPlayer::rank(
                player.player_id.clone(),
                self.ranking,
                self.ctx.rank_store.as_ref(),
            );
        }
        queue.sort_by(queue_order);
    }

    /// Build as many sessions as the queue supports this tick. Returns the
    /// number built.
    pub fn build_sessions(&self) -> usize {
        let min = self.shape.min_players();
        let max = self.shape.max_players();

        let mut queue = self.waiting_players.lock();
        let queued = queue.len();
        if queued < min {
            return 0;
        }

        let estimate = (queued / max + queued / min) / 2;
        let mut built = Vec::new();
        for _ in 0..estimate {
            if queue.len() < min {
                break;
            }
            let take = queue.len().min(max);
            let players: Vec<RankedPlayer> = queue.drain(..take).collect();
            match Session::assemble(self.family.clone(), &self.shape, players) {
                Ok(session) => built.push(session),
                Err(players) => {
                    queue.splice(0..0, players);
                    break;
                }
            }
        }

        let count = built.len();
        if count > 0 {
            self.waiting_sessions.lock().extend(built);
            info!(
                family = %self.family,
                sessions = count,
                still_queued = queue.len(),
                "Sessions assembled"
            );
        }
        count
    }

    /// Place waiting sessions on workers, in order, until the family runs
    /// out of unlocked workers. Returns the number placed.
    pub async fn connect_sessions(&self) -> usize {
        if self.pool.size(false) == 0 {
            return 0;
        }

        let snapshot: Vec<SessionId> = self
            .waiting_sessions
            .lock()
            .iter()
            .filter(|s| s.worker().is_none())
            .map(|s| s.id().clone())
            .collect();

        let mut placed = 0;
        for id in snapshot {
            if self.pool.size(false) == 0 {
                debug!(family = %self.family, "No unlocked workers left, placement paused");
                break;
            }
            let Some(worker) = self.pool.select_and_lock() else {
                break;
            };

            let players = {
                let mut sessions = self.waiting_sessions.lock();
                match sessions.iter_mut().find(|s| s.id() == &id) {
                    Some(session) => {
                        session.reserve(worker.clone());
                        session.player_ids()
                    }
                    None => {
                        self.pool.unlock(&worker);
                        continue;
                    }
                }
            };

            if let Err(e) = self.connect_players(&players, &worker).await {
                warn!(
                    error = %e,
                    family = %self.family,
                    session = %id,
                    worker = %worker.label(),
                    "Session placement failed, retrying next tick"
                );
                if let Some(session) = self
                    .waiting_sessions
                    .lock()
                    .iter_mut()
                    .find(|s| s.id() == &id)
                {
                    session.release(self.pool.as_ref());
                }
                continue;
            }

            let session = {
                let mut sessions = self.waiting_sessions.lock();
                // Still holding this worker: an eviction during the connects
                // releases it and leaves the session waiting for another
                sessions
                    .iter()
                    .position(|s| s.id() == &id && s.worker().is_some_and(|w| w.id() == worker.id()))
                    .map(|pos| sessions.remove(pos))
            };
            let Some(mut session) = session else {
                debug!(
                    family = %self.family,
                    session = %id,
                    worker = %worker.label(),
                    "Session lost its worker while connecting, not started"
                );
                continue;
            };

            session.start();
            self.running_sessions.insert(id.clone(), session);
            placed += 1;
            info!(
                family = %self.family,
                session = %id,
                worker = %worker.label(),
                players = players.len(),
                "Session running"
            );
            self.announce(&id, &players, &worker).await;
        }
        placed
    }

    /// Move every member onto `worker`.
    ///
    /// On failure the joins counted so far are taken back off the worker.
    /// Members the connector already moved stay where it put them; the whole
    /// session is placed again on a later tick, so connectors must accept
    /// moving a player that is already connected.
    async fn connect_players(&self, players: &[PlayerId], worker: &Worker) -> Result<()> {
        for (moved, player) in players.iter().enumerate() {
            let connected = connect_with_timeout(
                self.ctx.connector.as_ref(),
                player,
                worker,
                self.ctx.connect_timeout,
            )
            .await;
            if let Err(e) = connected {
                for _ in 0..moved {
                    worker.player_left();
                }
                return Err(e);
            }
            worker.player_joined();
        }
        Ok(())
    }

    async fn announce(&self, session: &SessionId, players: &[PlayerId], worker: &Worker) {
        let list = players
            .iter()
            .map(PlayerId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let packet = Packet::builder()
            .identification(ids::RANKED_GAME_READY)
            .from_frontend()
            .address(worker.address())
            .parameter(keys::SESSION, session.as_str())
            .parameter(keys::FAMILY, self.family.as_str())
            .parameter(keys::PLAYERS, list)
            .build();

        let result = match packet {
            Ok(packet) => self.ctx.bus.publish(&packet).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, session = %session, "Failed to announce session to worker");
        }
    }

    /// Run the three tasks once, in order.
    pub async fn run_cycle(&self) -> usize {
        self.complete_sort();
        self.build_sessions();
        self.connect_sessions().await
    }

    /// End a running session, recording its results and unlocking its worker.
    pub fn end_session(
        &self,
        session: &SessionId,
        winners: &[PlayerId],
        losers: &[PlayerId],
    ) -> Result<()> {
        let (_, mut ended) = self
            .running_sessions
            .remove(session)
            .ok_or_else(|| Error::NotFound(format!("no running session {session}")))?;

        for player in winners.iter().filter(|p| ended.contains(p)) {
            self.ctx.rank_store.record_win(player);
        }
        for player in losers.iter().filter(|p| ended.contains(p)) {
            self.ctx.rank_store.record_loss(player);
        }
        ended.end(self.pool.as_ref());

        info!(family = %self.family, session = %session, "Session ended");
        Ok(())
    }

    /// Drop every session pinned to an evicted worker.
    pub fn worker_evicted(&self, worker: WorkerId) {
        let pinned: Vec<SessionId> = self
            .running_sessions
            .iter()
            .filter(|e| e.value().worker().is_some_and(|w| w.id() == worker))
            .map(|e| e.key().clone())
            .collect();
        for id in pinned {
            if let Some((_, mut session)) = self.running_sessions.remove(&id) {
                session.end(self.pool.as_ref());
                warn!(family = %self.family, session = %id, "Session ended by worker eviction");
            }
        }

        for session in self.waiting_sessions.lock().iter_mut() {
            if session.worker().is_some_and(|w| w.id() == worker) {
                session.release(self.pool.as_ref());
            }
        }
    }

    /// Schedule the sort, assembly and placement tasks.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let mut tasks = self.tasks.lock();

        let this = Arc::clone(self);
        tasks.push(scheduler.schedule_recurring(
            "matchmaker-sort",
            self.config.sort_interval(),
            move || {
                let this = this.clone();
                async move {
                    this.complete_sort();
                    Ok(())
                }
            },
        ));

        let this = Arc::clone(self);
        tasks.push(scheduler.schedule_recurring(
            "matchmaker-sessions",
            self.config.session_interval(),
            move || {
                let this = this.clone();
                async move {
                    this.build_sessions();
                    Ok(())
                }
            },
        ));

        let this = Arc::clone(self);
        tasks.push(scheduler.schedule_recurring(
            "matchmaker-connect",
            self.config.connect_interval(),
            move || {
                let this = this.clone();
                async move {
                    this.connect_sessions().await;
                    Ok(())
                }
            },
        ));

        info!(
            family = %self.family,
            min_players = self.shape.min_players(),
            max_players = self.shape.max_players(),
            ranking = ?self.ranking,
            "Matchmaker started"
        );
    }

    /// Cancel the tasks, end every session and empty the queue.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.cancel();
        }

        let waiting: Vec<Session> = self.waiting_sessions.lock().drain(..).collect();
        for mut session in waiting {
            session.end(self.pool.as_ref());
        }

        let running: Vec<SessionId> = self.running_sessions.iter().map(|e| e.key().clone()).collect();
        for id in running {
            if let Some((_, mut session)) = self.running_sessions.remove(&id) {
                session.end(self.pool.as_ref());
            }
        }

        self.waiting_players.lock().clear();
        info!(family = %self.family, "Matchmaker stopped");
    }
}
