//! Skill-ranked session assembly

mod matchmaker;
mod ranking;
mod session;

pub use matchmaker::Matchmaker;
pub use ranking::{queue_order, score, MemoryRankStore, PlayerRecord, RankStore, RankedPlayer};
pub use session::{Session, SessionState, Team, TeamShape};
