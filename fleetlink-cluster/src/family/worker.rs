use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use fleetlink_core::models::{FamilyId, WorkerId};

use crate::connector::ClientProfile;
use crate::error::{Error, Result};
use crate::magic_link::{LinkSignal, LinkState};

/// Everything the front-end learns about a worker when it registers
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub address: String,
    pub display_name: Option<String>,
    pub family: FamilyId,
    pub magic_config: String,
    pub soft_cap: u32,
    pub hard_cap: u32,
    pub weight: u32,
    /// Liveness countdown to start from
    pub countdown: u32,
    pub player_count: u32,
}

/// A registered worker
///
/// Identity and caps are fixed at registration. Player count, liveness
/// countdown and the lock flag change concurrently and are atomics.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    address: String,
    display_name: Option<String>,
    family: FamilyId,
    magic_config: String,
    soft_cap: u32,
    hard_cap: u32,
    weight: u32,
    registered_at: DateTime<Utc>,

    player_count: AtomicU32,
    countdown: AtomicU32,
    locked: AtomicBool,
    link_state: Mutex<LinkState>,
}

impl Worker {
    /// Build a worker; a soft cap above the hard cap is lowered to it.
    #[must_use]
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            id: spec.id,
            address: spec.address,
            display_name: spec.display_name,
            family: spec.family,
            magic_config: spec.magic_config,
            soft_cap: spec.soft_cap.min(spec.hard_cap),
            hard_cap: spec.hard_cap,
            weight: spec.weight,
            registered_at: Utc::now(),
            player_count: AtomicU32::new(spec.player_count),
            countdown: AtomicU32::new(spec.countdown),
            locked: AtomicBool::new(false),
            link_state: Mutex::new(LinkState::Linked),
        }
    }

    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Display name if the worker sent one, its address otherwise
    #[must_use]
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }

    #[must_use]
    pub const fn family(&self) -> &FamilyId {
        &self.family
    }

    #[must_use]
    pub fn magic_config(&self) -> &str {
        &self.magic_config
    }

    #[must_use]
    pub const fn soft_cap(&self) -> u32 {
        self.soft_cap
    }

    #[must_use]
    pub const fn hard_cap(&self) -> u32 {
        self.hard_cap
    }

    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    #[must_use]
    pub fn player_count(&self) -> u32 {
        self.player_count.load(Ordering::Acquire)
    }

    /// Overwrite the player count with the one reported by a heartbeat
    pub fn set_player_count(&self, count: u32) {
        self.player_count.store(count, Ordering::Release);
    }

    pub fn player_joined(&self) {
        self.player_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn player_left(&self) {
        let _ = self
            .player_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// At or above the soft cap
    #[must_use]
    pub fn full(&self) -> bool {
        self.player_count() >= self.soft_cap
    }

    /// At or above the hard cap
    #[must_use]
    pub fn maxed(&self) -> bool {
        self.player_count() >= self.hard_cap
    }

    /// Whether `client` may join right now.
    ///
    /// A hard-cap bypass admits unconditionally. Otherwise a maxed worker
    /// refuses, a soft-cap bypass admits, and a full worker refuses.
    pub fn admit(&self, client: &ClientProfile) -> Result<()> {
        if client.bypass_hard_cap {
            return Ok(());
        }
        if self.maxed() {
            return Err(Error::Capacity(format!(
                "{} is at its hard cap ({}/{})",
                self.label(),
                self.player_count(),
                self.hard_cap
            )));
        }
        if client.bypass_soft_cap {
            return Ok(());
        }
        if self.full() {
            return Err(Error::Capacity(format!(
                "{} is at its soft cap ({}/{})",
                self.label(),
                self.player_count(),
                self.soft_cap
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn countdown(&self) -> u32 {
        self.countdown.load(Ordering::Acquire)
    }

    pub fn reset_countdown(&self, value: u32) {
        self.countdown.store(value, Ordering::Release);
    }

    /// Lower the countdown by `amount`, stopping at 0. Returns what is left.
    pub fn decay(&self, amount: u32) -> u32 {
        let previous = self
            .countdown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(amount)))
            .unwrap_or(0);
        previous.saturating_sub(amount)
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.countdown() == 0
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Set the lock flag. Returns `false` if it was already set.
    pub(crate) fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the lock flag. Returns `false` if it was not set.
    pub(crate) fn try_unlock(&self) -> bool {
        self.locked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn link_state(&self) -> LinkState {
        *self.link_state.lock()
    }

    /// Apply a liveness signal. Returns the new state, or `None` if the
    /// signal is not valid in the current state (which is then kept).
    pub fn signal(&self, signal: LinkSignal) -> Option<LinkState> {
        let mut state = self.link_state.lock();
        let next = state.apply(signal)?;
        *state = next;
        Some(next)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn spec(address: &str, soft_cap: u32, hard_cap: u32) -> WorkerSpec {
        WorkerSpec {
            id: WorkerId::new(),
            address: address.to_string(),
            display_name: None,
            family: FamilyId::from("lobby"),
            magic_config: "default".to_string(),
            soft_cap,
            hard_cap,
            weight: 0,
            countdown: 15,
            player_count: 0,
        }
    }

    pub(crate) fn worker(address: &str, soft_cap: u32, hard_cap: u32) -> Worker {
        Worker::new(spec(address, soft_cap, hard_cap))
    }

    #[test]
    fn test_soft_cap_is_lowered_to_hard_cap() {
        let w = worker("a:1", 40, 30);
        assert_eq!(w.soft_cap(), 30);
        assert_eq!(w.hard_cap(), 30);
    }

    #[test]
    fn test_full_and_maxed() {
        let w = worker("a:1", 2, 3);
        assert!(!w.full());
        w.set_player_count(2);
        assert!(w.full());
        assert!(!w.maxed());
        w.player_joined();
        assert!(w.maxed());
    }

    #[test]
    fn test_admission_rules() {
        let w = worker("a:1", 2, 3);
        let plain = ClientProfile::new("p");
        let soft = ClientProfile::new("p").bypass_soft_cap();
        let hard = ClientProfile::new("p").bypass_hard_cap();

        assert!(w.admit(&plain).is_ok());

        w.set_player_count(2);
        assert!(matches!(w.admit(&plain), Err(Error::Capacity(_))));
        assert!(w.admit(&soft).is_ok());
        assert!(w.admit(&hard).is_ok());

        w.set_player_count(3);
        assert!(matches!(w.admit(&plain), Err(Error::Capacity(_))));
        assert!(matches!(w.admit(&soft), Err(Error::Capacity(_))));
        assert!(w.admit(&hard).is_ok());
    }

    #[test]
    fn test_player_left_stops_at_zero() {
        let w = worker("a:1", 2, 3);
        w.player_left();
        assert_eq!(w.player_count(), 0);
        w.player_joined();
        w.player_left();
        assert_eq!(w.player_count(), 0);
    }

    #[test]
    fn test_decay_clamps_at_zero() {
        let w = worker("a:1", 2, 3);
        assert_eq!(w.decay(5), 10);
        assert_eq!(w.decay(5), 5);
        assert!(!w.is_stale());
        assert_eq!(w.decay(7), 0);
        assert!(w.is_stale());
        assert_eq!(w.decay(5), 0);

        w.reset_countdown(15);
        assert!(!w.is_stale());
    }

    #[test]
    fn test_lock_flag() {
        let w = worker("a:1", 2, 3);
        assert!(w.try_lock());
        assert!(!w.try_lock());
        assert!(w.is_locked());
        assert!(w.try_unlock());
        assert!(!w.try_unlock());
    }
}
