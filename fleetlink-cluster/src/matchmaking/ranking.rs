//! Player scores for queue ordering

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use fleetlink_core::config::RankingSchema;
use fleetlink_core::models::PlayerId;

/// Win/loss history of one player
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub wins: u32,
    pub losses: u32,
}

impl PlayerRecord {
    #[must_use]
    pub const fn games(&self) -> u32 {
        self.wins + self.losses
    }
}

/// Where player records live
pub trait RankStore: Send + Sync {
    fn record(&self, player: &PlayerId) -> PlayerRecord;

    fn record_win(&self, player: &PlayerId);

    fn record_loss(&self, player: &PlayerId);
}

/// Process-local record store
#[derive(Debug, Default)]
pub struct MemoryRankStore {
    records: DashMap<PlayerId, PlayerRecord>,
}

impl MemoryRankStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, player: PlayerId, record: PlayerRecord) {
        self.records.insert(player, record);
    }
}

impl RankStore for MemoryRankStore {
    fn record(&self, player: &PlayerId) -> PlayerRecord {
        self.records.get(player).map(|r| *r).unwrap_or_default()
    }

    fn record_win(&self, player: &PlayerId) {
        self.records.entry(player.clone()).or_default().wins += 1;
    }

    fn record_loss(&self, player: &PlayerId) {
        self.records.entry(player.clone()).or_default().losses += 1;
    }
}

/// Score of a record under `schema`. Higher ranks first.
///
/// - `WinLoss`: wins minus losses
/// - `WinRate`: wins over games played, 0 with no games
/// - `Randomized`: uniform in `[0, 1)`, drawn on every call
#[must_use]
pub fn score(schema: RankingSchema, record: PlayerRecord) -> f64 {
    match schema {
        RankingSchema::WinLoss => f64::from(record.wins) - f64::from(record.losses),
        RankingSchema::WinRate => {
            let games = record.games();
            if games == 0 {
                0.0
            } else {
                f64::from(record.wins) / f64::from(games)
            }
        }
        RankingSchema::Randomized => rand::random::<f64>(),
    }
}

/// A queued player with its current score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPlayer {
    pub player_id: PlayerId,
    pub score: f64,
}

impl RankedPlayer {
    #[must_use]
    pub fn rank(player_id: PlayerId, schema: RankingSchema, store: &dyn RankStore) -> Self {
        let score = score(schema, store.record(&player_id));
        Self { player_id, score }
    }
}

/// Queue order: higher score first
#[must_use]
pub fn queue_order(a: &RankedPlayer, b: &RankedPlayer) -> Ordering {
    b.score.total_cmp(&a.score)
}
