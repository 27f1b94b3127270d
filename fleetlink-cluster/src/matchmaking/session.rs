use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use fleetlink_core::config::TeamConfig;
use fleetlink_core::models::{FamilyId, PlayerId, SessionId};

use super::ranking::RankedPlayer;
use crate::family::{Worker, WorkerPool};

/// Configured team layout of a session
#[derive(Debug, Clone)]
pub struct TeamShape {
    teams: Vec<TeamConfig>,
}

impl TeamShape {
    #[must_use]
    pub fn new(teams: Vec<TeamConfig>) -> Self {
        Self { teams }
    }

    #[must_use]
    pub fn teams(&self) -> &[TeamConfig] {
        &self.teams
    }

    /// Players needed before a session may form
    #[must_use]
    pub fn min_players(&self) -> usize {
        self.teams.iter().map(|t| t.min as usize).sum()
    }

    #[must_use]
    pub fn max_players(&self) -> usize {
        self.teams.iter().map(|t| t.max as usize).sum()
    }

    /// Deal `players` (best first) into teams.
    ///
    /// Team minimums are filled first, in team order. Whatever is left goes
    /// round-robin to teams still below their maximum.
    #[must_use]
    pub fn distribute(&self, players: Vec<RankedPlayer>) -> Vec<Team> {
        let mut teams: Vec<Team> = self
            .teams
            .iter()
            .map(|t| Team {
                name: t.name.clone(),
                players: Vec::with_capacity(t.max as usize),
            })
            .collect();

        let mut pending = players.into_iter();
        for (team, config) in teams.iter_mut().zip(&self.teams) {
            team.players
                .extend(pending.by_ref().take(config.min as usize));
        }

        let mut remaining: Vec<RankedPlayer> = pending.collect();
        remaining.reverse();
        while !remaining.is_empty() {
            let mut placed = false;
            for (team, config) in teams.iter_mut().zip(&self.teams) {
                if team.players.len() >= config.max as usize {
                    continue;
                }
                let Some(player) = remaining.pop() else {
                    break;
                };
                team.players.push(player);
                placed = true;
            }
            if !placed {
                break;
            }
        }

        teams
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Team {
    pub name: String,
    pub players: Vec<RankedPlayer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Assembled, waiting for a worker
    Waiting,
    /// Players moved onto a locked worker
    Running,
    Ended,
}

/// A group of players that will be moved onto one worker together
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    family: FamilyId,
    teams: Vec<Team>,
    worker: Option<Arc<Worker>>,
    state: SessionState,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Form a session from `players` (best first). Hands the players back
    /// when there are fewer than the shape's minimum. Callers pass at most
    /// the shape's maximum.
    pub fn assemble(
        family: FamilyId,
        shape: &TeamShape,
        players: Vec<RankedPlayer>,
    ) -> std::result::Result<Self, Vec<RankedPlayer>> {
        if players.len() < shape.min_players()
            || players.len() > shape.max_players()
            || shape.min_players() == 0
        {
            return Err(players);
        }

        Ok(Self {
            id: SessionId::new(),
            family,
            teams: shape.distribute(players),
            worker: None,
            state: SessionState::Waiting,
            created_at: Utc::now(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn family(&self) -> &FamilyId {
        &self.family
    }

    #[must_use]
    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn worker(&self) -> Option<&Arc<Worker>> {
        self.worker.as_ref()
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn players(&self) -> impl Iterator<Item = &RankedPlayer> {
        self.teams.iter().flat_map(|t| t.players.iter())
    }

    #[must_use]
    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players().map(|p| p.player_id.clone()).collect()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.teams.iter().map(|t| t.players.len()).sum()
    }

    #[must_use]
    pub fn contains(&self, player: &PlayerId) -> bool {
        self.players().any(|p| &p.player_id == player)
    }

    /// Attach the worker locked for this session.
    pub(crate) fn reserve(&mut self, worker: Arc<Worker>) {
        self.worker = Some(worker);
    }

    /// Detach and unlock the reserved worker, staying in `Waiting`.
    pub(crate) fn release(&mut self, pool: &WorkerPool) {
        if let Some(worker) = self.worker.take() {
            pool.unlock(&worker);
        }
    }

    pub(crate) fn start(&mut self) {
        self.state = SessionState::Running;
    }

    /// End the session and put its worker back into rotation.
    pub(crate) fn end(&mut self, pool: &WorkerPool) {
        self.release(pool);
        self.state = SessionState::Ended;
    }
}
