//! Home workers
//!
//! A family with residence enabled remembers the worker each player was
//! first placed on and sends the player back there while the home is still
//! a member, unlocked, and not expired.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use fleetlink_core::models::{FamilyId, PlayerId, WorkerId};

use super::capability::Selectable;
use super::load_balancer::LoadBalancer;
use super::worker::Worker;

/// A player's home worker in one family
#[derive(Debug, Clone)]
pub struct Residence {
    player: PlayerId,
    worker: Arc<Worker>,
    family: FamilyId,
    expires_at: Option<DateTime<Utc>>,
}

impl Residence {
    #[must_use]
    pub fn new(player: PlayerId, worker: Arc<Worker>, family: FamilyId, ttl: Option<Duration>) -> Self {
        Self {
            player,
            worker,
            family,
            expires_at: expiry_from_now(ttl),
        }
    }

    #[must_use]
    pub const fn player(&self) -> &PlayerId {
        &self.player
    }

    #[must_use]
    pub const fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    #[must_use]
    pub const fn family(&self) -> &FamilyId {
        &self.family
    }

    /// `None` when the residence never expires
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Restart the expiry from now.
    pub fn renew(&mut self, ttl: Option<Duration>) {
        self.expires_at = expiry_from_now(ttl);
    }
}

/// A ttl too large for the calendar never expires.
fn expiry_from_now(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    Utc::now().checked_add_signed(ttl)
}

/// Residences of one family, keyed by player
pub struct ResidenceBook {
    family: FamilyId,
    ttl: Option<Duration>,
    homes: DashMap<PlayerId, Residence>,
}

impl ResidenceBook {
    #[must_use]
    pub fn new(family: FamilyId, ttl: Option<Duration>) -> Self {
        Self {
            family,
            ttl,
            homes: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Home worker of `player`, dropping the residence if it has expired
    #[must_use]
    pub fn home(&self, player: &PlayerId) -> Option<Arc<Worker>> {
        self.home_at(player, Utc::now())
    }

    fn home_at(&self, player: &PlayerId, now: DateTime<Utc>) -> Option<Arc<Worker>> {
        match self.homes.get(player) {
            Some(residence) if !residence.is_expired_at(now) => {
                return Some(residence.worker().clone())
            }
            Some(_) => {}
            None => return None,
        }
        self.homes.remove_if(player, |_, r| r.is_expired_at(now));
        None
    }

    #[must_use]
    pub fn residence(&self, player: &PlayerId) -> Option<Residence> {
        self.homes.get(player).map(|r| r.value().clone())
    }

    /// Make `worker` the home of `player`, replacing any previous one.
    pub fn assign(&self, player: PlayerId, worker: Arc<Worker>) {
        debug!(family = %self.family, player = %player, worker = %worker.label(), "Residence assigned");
        let residence = Residence::new(player.clone(), worker, self.family.clone(), self.ttl);
        self.homes.insert(player, residence);
    }

    pub fn forget(&self, player: &PlayerId) -> Option<Residence> {
        self.homes.remove(player).map(|(_, r)| r)
    }

    /// Drop every residence on a worker that left the family. Returns how
    /// many were dropped.
    pub fn worker_removed(&self, worker: WorkerId) -> usize {
        let before = self.homes.len();
        self.homes.retain(|_, r| r.worker().id() != worker);
        before - self.homes.len()
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.homes.len();
        self.homes.retain(|_, r| !r.is_expired_at(now));
        before - self.homes.len()
    }

    #[must_use]
    pub fn residents_of(&self, worker: WorkerId) -> Vec<PlayerId> {
        self.homes
            .iter()
            .filter(|e| e.value().worker().id() == worker)
            .map(|e| e.key().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.homes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.homes.is_empty()
    }
}

/// Balancer selection that prefers a player's home worker
///
/// The home is used only while it is an unlocked member of the balancer;
/// otherwise selection falls through to the balancer's cursor.
pub struct ResidentSelector<'a> {
    balancer: &'a LoadBalancer,
    home: Option<Arc<Worker>>,
}

impl<'a> ResidentSelector<'a> {
    #[must_use]
    pub fn new(balancer: &'a LoadBalancer, home: Option<Arc<Worker>>) -> Self {
        let home = home.filter(|w| !w.is_locked() && balancer.contains(w.id()));
        Self { balancer, home }
    }

    /// The home worker, if it is usable
    #[must_use]
    pub const fn home(&self) -> Option<&Arc<Worker>> {
        self.home.as_ref()
    }
}

impl Selectable for ResidentSelector<'_> {
    type Item = Arc<Worker>;

    fn current(&self) -> Option<Arc<Worker>> {
        match &self.home {
            Some(home) if !home.is_locked() => Some(home.clone()),
            _ => self.balancer.current(),
        }
    }

    fn lock(&self, item: &Arc<Worker>) -> bool {
        self.balancer.lock(item.id())
    }

    fn unlock(&self, item: &Arc<Worker>) -> bool {
        self.balancer.unlock(item.id())
    }

    fn select_and_lock(&self) -> Option<Arc<Worker>> {
        if let Some(home) = &self.home {
            if self.balancer.lock(home.id()) {
                return Some(home.clone());
            }
        }
        self.balancer.select_and_lock()
    }

    fn size(&self, include_locked: bool) -> usize {
        self.balancer.size(include_locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::worker::tests::spec;
    use fleetlink_core::config::BalancingStrategy;

    fn worker(address: &str, players: u32) -> Arc<Worker> {
        let mut spec = spec(address, 20, 30);
        spec.player_count = players;
        Arc::new(Worker::new(spec))
    }

    fn balancer(workers: &[&Arc<Worker>]) -> LoadBalancer {
        let lb = LoadBalancer::new(BalancingStrategy::LeastConnection);
        for w in workers {
            lb.add(Arc::clone(w));
        }
        lb.complete_sort();
        lb
    }

    #[test]
    fn test_home_is_preferred_over_cursor() {
        let idle = worker("idle", 0);
        let busy = worker("busy", 9);
        let lb = balancer(&[&idle, &busy]);

        let book = ResidenceBook::new(FamilyId::from("hub"), None);
        book.assign(PlayerId::from("steve"), busy.clone());

        let selector = ResidentSelector::new(&lb, book.home(&PlayerId::from("steve")));
        assert_eq!(selector.current().unwrap().id(), busy.id());

        let stranger = ResidentSelector::new(&lb, book.home(&PlayerId::from("alex")));
        assert!(stranger.home().is_none());
        assert_eq!(stranger.current().unwrap().id(), idle.id());
    }

    #[test]
    fn test_locked_home_falls_back_to_balancer() {
        let idle = worker("idle", 0);
        let home = worker("home", 4);
        let lb = balancer(&[&idle, &home]);
        assert!(lb.lock(home.id()));

        let selector = ResidentSelector::new(&lb, Some(home.clone()));
        assert!(selector.home().is_none());
        assert_eq!(selector.current().unwrap().id(), idle.id());
    }

    #[test]
    fn test_select_and_lock_takes_home_first() {
        let idle = worker("idle", 0);
        let home = worker("home", 4);
        let lb = balancer(&[&idle, &home]);

        let selector = ResidentSelector::new(&lb, Some(home.clone()));
        assert_eq!(selector.select_and_lock().unwrap().id(), home.id());
        assert!(home.is_locked());
        assert_eq!(selector.select_and_lock().unwrap().id(), idle.id());
        assert_eq!(selector.size(false), 0);
        assert_eq!(selector.size(true), 2);
    }

    #[test]
    fn test_expired_residence_is_dropped() {
        let home = worker("home", 0);
        let book = ResidenceBook::new(FamilyId::from("hub"), Some(Duration::from_secs(60)));
        let steve = PlayerId::from("steve");
        book.assign(steve.clone(), home.clone());

        let expires_at = book.residence(&steve).unwrap().expires_at().unwrap();
        assert!(book.home_at(&steve, expires_at - chrono::Duration::seconds(1)).is_some());
        assert!(book.home_at(&steve, expires_at).is_none());
        assert!(book.is_empty());
    }

    #[test]
    fn test_purge_and_worker_removal() {
        let a = worker("a", 0);
        let b = worker("b", 0);
        let book = ResidenceBook::new(FamilyId::from("hub"), Some(Duration::from_secs(60)));
        book.assign(PlayerId::from("p1"), a.clone());
        book.assign(PlayerId::from("p2"), a.clone());
        book.assign(PlayerId::from("p3"), b.clone());

        let mut residents = book.residents_of(a.id());
        residents.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(residents, vec![PlayerId::from("p1"), PlayerId::from("p2")]);

        assert_eq!(book.worker_removed(a.id()), 2);
        assert_eq!(book.len(), 1);

        assert_eq!(book.purge_expired(), 0);
        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(book.purge_expired_at(later), 1);
        assert!(book.is_empty());
    }

    #[test]
    fn test_residence_without_ttl_never_expires() {
        let mut residence = Residence::new(
            PlayerId::from("steve"),
            worker("home", 0),
            FamilyId::from("hub"),
            None,
        );
        assert!(residence.expires_at().is_none());
        assert!(!residence.is_expired_at(Utc::now() + chrono::Duration::days(365)));

        residence.renew(Some(Duration::from_secs(10)));
        assert!(residence.expires_at().is_some());
        assert_eq!(residence.player().as_str(), "steve");
        assert_eq!(residence.family().as_str(), "hub");
    }
}
