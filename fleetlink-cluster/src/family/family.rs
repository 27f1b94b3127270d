use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use fleetlink_core::config::FamilyConfig;
use fleetlink_core::models::{FamilyId, WorkerId};
use fleetlink_core::TaskHandle;

use super::capability::Selectable;
use super::load_balancer::LoadBalancer;
use super::residence::{ResidenceBook, ResidentSelector};
use super::worker::Worker;
use crate::connector::{connect_with_timeout, ClientProfile};
use crate::context::ProxyContext;
use crate::error::{Error, Result};
use crate::events::FleetEvent;
use crate::matchmaking::Matchmaker;

/// A named group of interchangeable workers
///
/// Owns its load balancer and, when configured, its matchmaker and its
/// residence book.
pub struct Family {
    id: FamilyId,
    balancer: Arc<LoadBalancer>,
    matchmaker: Option<Arc<Matchmaker>>,
    residences: Option<Arc<ResidenceBook>>,
    ctx: ProxyContext,
    rebalance_interval: Duration,
    rebalance_task: Mutex<Option<TaskHandle>>,
}

impl Family {
    pub fn new(config: &FamilyConfig, ctx: ProxyContext) -> Result<Self> {
        let id = FamilyId::from(config.id.as_str());
        let balancer = Arc::new(LoadBalancer::with_events(
            config.load_balancer.strategy,
            id.clone(),
            ctx.events.clone(),
        ));

        let matchmaker = match &config.matchmaker {
            Some(settings) => Some(Arc::new(Matchmaker::new(
                id.clone(),
                settings.clone(),
                balancer.clone(),
                ctx.clone(),
            )?)),
            None => None,
        };
        let residences = config
            .residence
            .as_ref()
            .map(|r| Arc::new(ResidenceBook::new(id.clone(), r.expiration())));

        Ok(Self {
            id,
            balancer,
            matchmaker,
            residences,
            ctx,
            rebalance_interval: config.load_balancer.rebalance_interval(),
            rebalance_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &FamilyId {
        &self.id
    }

    #[must_use]
    pub const fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    #[must_use]
    pub const fn matchmaker(&self) -> Option<&Arc<Matchmaker>> {
        self.matchmaker.as_ref()
    }

    /// Present when the family sends players back to their home worker
    #[must_use]
    pub const fn residences(&self) -> Option<&Arc<ResidenceBook>> {
        self.residences.as_ref()
    }

    /// Every member, locked or not
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let mut workers = self.balancer.unlocked();
        workers.extend(self.balancer.locked());
        workers
    }

    #[must_use]
    pub fn player_count(&self) -> u32 {
        self.balancer.player_count()
    }

    pub(crate) fn add_worker(&self, worker: Arc<Worker>) -> bool {
        let added = self.balancer.add(worker);
        if added {
            self.balancer.complete_sort();
        }
        added
    }

    pub(crate) fn remove_worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        let removed = self.balancer.remove(id)?;
        self.balancer.complete_sort();
        if let Some(matchmaker) = &self.matchmaker {
            matchmaker.worker_evicted(id);
        }
        if let Some(book) = &self.residences {
            let dropped = book.worker_removed(id);
            if dropped > 0 {
                debug!(family = %self.id, worker = %removed.label(), dropped, "Residences dropped");
            }
        }
        Some(removed)
    }

    /// Place one client on the family's current worker, or on its home
    /// worker when residence is enabled.
    ///
    /// Refusals by caps, or by a family with no unlocked worker, are
    /// [`Error::Capacity`]. A connector that fails or runs past the connect
    /// timeout leaves the player count untouched. A home that is gone or
    /// locked is replaced by the balancer's pick, which becomes the new home.
    pub async fn connect(&self, client: &ClientProfile) -> Result<Arc<Worker>> {
        let home = self
            .residences
            .as_ref()
            .and_then(|book| book.home(&client.player_id));
        let selector = ResidentSelector::new(&self.balancer, home);

        if selector.size(false) == 0 {
            return Err(Error::Capacity(format!(
                "family {} has no available workers",
                self.id
            )));
        }
        let worker = selector.current().ok_or_else(|| {
            Error::Capacity(format!("family {} has no available workers", self.id))
        })?;
        let at_home = selector.home().is_some_and(|h| h.id() == worker.id());

        worker.admit(client)?;
        connect_with_timeout(
            self.ctx.connector.as_ref(),
            &client.player_id,
            &worker,
            self.ctx.connect_timeout,
        )
        .await?;

        worker.player_joined();
        if !at_home {
            if let Some(book) = &self.residences {
                book.assign(client.player_id.clone(), worker.clone());
            }
        }
        self.balancer.iterate();

        info!(
            family = %self.id,
            player = %client.player_id,
            worker = %worker.label(),
            players = worker.player_count(),
            at_home,
            "Player connected"
        );
        self.ctx.events.emit(FleetEvent::PlayerJoined {
            player: client.player_id.clone(),
            worker_id: worker.id(),
            family: self.id.clone(),
        });
        Ok(worker)
    }

    /// Start the periodic rebalance and the matchmaker, if any.
    pub fn start(&self) {
        let balancer = self.balancer.clone();
        let residences = self.residences.clone();
        let handle = self.ctx.scheduler.schedule_recurring(
            "family-rebalance",
            self.rebalance_interval,
            move || {
                let balancer = balancer.clone();
                let residences = residences.clone();
                async move {
                    balancer.complete_sort();
                    if let Some(book) = residences {
                        book.purge_expired();
                    }
                    Ok(())
                }
            },
        );
        if let Some(previous) = self.rebalance_task.lock().replace(handle) {
            previous.cancel();
        }

        if let Some(matchmaker) = &self.matchmaker {
            matchmaker.start(&self.ctx.scheduler);
        }
        debug!(family = %self.id, interval = ?self.rebalance_interval, "Family started");
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.rebalance_task.lock().take() {
            task.cancel();
        }
        if let Some(matchmaker) = &self.matchmaker {
            matchmaker.shutdown();
        }
        debug!(family = %self.id, "Family stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockClientConnector;
    use crate::family::worker::tests::spec;
    use crate::matchmaking::MemoryRankStore;
    use crate::packet::{BusSettings, MemoryTransport, PacketBus};
    use fleetlink_core::config::{LoadBalancerConfig, ResidenceConfig};
    use fleetlink_core::Scheduler;

    fn family_with(connector: MockClientConnector) -> Family {
        family_configured(connector, None)
    }

    fn family_configured(
        connector: MockClientConnector,
        residence: Option<ResidenceConfig>,
    ) -> Family {
        let ctx = ProxyContext::new(
            Scheduler::new(),
            Arc::new(PacketBus::new(
                Arc::new(MemoryTransport::new()),
                BusSettings::frontend("test", 50),
            )),
            Arc::new(connector),
            Arc::new(MemoryRankStore::new()),
            Duration::from_secs(5),
        );
        let config = FamilyConfig {
            id: "lobby".to_string(),
            load_balancer: LoadBalancerConfig::default(),
            matchmaker: None,
            residence,
        };
        Family::new(&config, ctx).unwrap()
    }

    fn resident_family() -> Family {
        family_configured(
            accepting(),
            Some(ResidenceConfig {
                expiration_seconds: Some(3600),
            }),
        )
    }

    fn member(family: &Family, address: &str, players: u32, soft: u32, hard: u32) -> Arc<Worker> {
        let mut spec = spec(address, soft, hard);
        spec.player_count = players;
        let worker = Arc::new(Worker::new(spec));
        family.add_worker(worker.clone());
        worker
    }

    fn accepting() -> MockClientConnector {
        let mut connector = MockClientConnector::new();
        connector.expect_connect().returning(|_, _| Ok(()));
        connector
    }

    #[tokio::test]
    async fn test_empty_family_refuses() {
        let family = family_with(MockClientConnector::new());
        let err = family.connect(&ClientProfile::new("steve")).await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    #[tokio::test]
    async fn test_connect_picks_least_loaded_and_counts() {
        let family = family_with(accepting());
        member(&family, "busy", 8, 20, 30);
        let idle = member(&family, "idle", 1, 20, 30);

        let chosen = family.connect(&ClientProfile::new("steve")).await.unwrap();
        assert_eq!(chosen.id(), idle.id());
        assert_eq!(idle.player_count(), 2);
    }

    #[tokio::test]
    async fn test_full_worker_refuses_without_bypass() {
        let family = family_with(accepting());
        let worker = member(&family, "full", 5, 5, 10);

        let err = family.connect(&ClientProfile::new("steve")).await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert_eq!(worker.player_count(), 5);

        family
            .connect(&ClientProfile::new("mod").bypass_soft_cap())
            .await
            .unwrap();
        assert_eq!(worker.player_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connector_timeout_is_recoverable() {
        let mut connector = MockClientConnector::new();
        connector
            .expect_connect()
            .returning(|_, _| Err(Error::Timeout("slow".to_string())));
        let family = family_with(connector);
        let worker = member(&family, "a", 0, 20, 30);

        let err = family.connect(&ClientProfile::new("steve")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(worker.player_count(), 0);
    }

    #[test]
    fn test_membership_changes_resort() {
        let family = family_with(MockClientConnector::new());
        member(&family, "b", 5, 20, 30);
        let light = member(&family, "a", 0, 20, 30);
        assert_eq!(family.load_balancer().current().unwrap().id(), light.id());

        assert!(family.remove_worker(light.id()).is_some());
        assert_eq!(family.workers().len(), 1);
        assert!(family.remove_worker(light.id()).is_none());
    }

    #[tokio::test]
    async fn test_player_returns_to_home_worker() {
        let family = resident_family();
        let first = member(&family, "first", 0, 20, 30);
        let second = member(&family, "second", 0, 20, 30);

        let home = family.connect(&ClientProfile::new("steve")).await.unwrap();
        assert_eq!(home.id(), first.id());
        // iterate moved the cursor off the now heavier worker
        assert_eq!(family.load_balancer().current().unwrap().id(), second.id());

        let again = family.connect(&ClientProfile::new("steve")).await.unwrap();
        assert_eq!(again.id(), first.id());
        assert_eq!(first.player_count(), 2);

        let other = family.connect(&ClientProfile::new("alex")).await.unwrap();
        assert_eq!(other.id(), second.id());
        assert_eq!(family.residences().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_locked_home_is_replaced() {
        let family = resident_family();
        let first = member(&family, "first", 0, 20, 30);
        let second = member(&family, "second", 5, 20, 30);

        family.connect(&ClientProfile::new("steve")).await.unwrap();
        assert!(family.load_balancer().lock(first.id()));

        let moved = family.connect(&ClientProfile::new("steve")).await.unwrap();
        assert_eq!(moved.id(), second.id());
        let book = family.residences().unwrap();
        let residence = book.residence(&"steve".into()).unwrap();
        assert_eq!(residence.worker().id(), second.id());
    }

    #[tokio::test]
    async fn test_removed_worker_loses_residents() {
        let family = resident_family();
        let first = member(&family, "first", 0, 20, 30);

        family.connect(&ClientProfile::new("steve")).await.unwrap();
        assert_eq!(family.residences().unwrap().len(), 1);

        family.remove_worker(first.id());
        assert!(family.residences().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_family_without_residence_keeps_no_homes() {
        let family = family_with(accepting());
        member(&family, "a", 0, 20, 30);
        family.connect(&ClientProfile::new("steve")).await.unwrap();
        assert!(family.residences().is_none());
    }

    #[tokio::test]
    async fn test_connect_reports_player_joined() {
        let family = family_with(accepting());
        let worker = member(&family, "a", 0, 20, 30);
        let mut events = family.ctx.events.subscribe();

        family.connect(&ClientProfile::new("steve")).await.unwrap();
        match events.try_recv().unwrap() {
            FleetEvent::PlayerJoined {
                player,
                worker_id,
                family: id,
            } => {
                assert_eq!(player.as_str(), "steve");
                assert_eq!(worker_id, worker.id());
                assert_eq!(id.as_str(), "lobby");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
