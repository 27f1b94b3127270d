use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use fleetlink_core::models::{FamilyId, WorkerId};

use super::family::Family;
use super::worker::Worker;
use crate::error::{Error, Result};

/// Directory of families and of every registered worker
///
/// A worker is listed here exactly as long as it is a member of its
/// family's load balancer.
#[derive(Default)]
pub struct FamilyRegistry {
    families: DashMap<FamilyId, Arc<Family>>,
    workers: DashMap<WorkerId, Arc<Worker>>,
    addresses: DashMap<String, WorkerId>,
}

impl FamilyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a family with the same id already exists.
    pub fn add_family(&self, family: Arc<Family>) -> bool {
        match self.families.entry(family.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!(family = %family.id(), "Family added");
                slot.insert(family);
                true
            }
        }
    }

    #[must_use]
    pub fn family(&self, id: &FamilyId) -> Option<Arc<Family>> {
        self.families.get(id).map(|f| f.value().clone())
    }

    #[must_use]
    pub fn families(&self) -> Vec<Arc<Family>> {
        self.families.iter().map(|f| f.value().clone()).collect()
    }

    /// Add a worker to the registry and to its family.
    ///
    /// Fails with [`Error::Registration`] when the family is unknown or when
    /// the id or address is already taken.
    pub fn add_worker(&self, worker: Arc<Worker>) -> Result<Arc<Family>> {
        let family = self.family(worker.family()).ok_or_else(|| {
            Error::Registration(format!("family `{}` does not exist", worker.family()))
        })?;

        match self.addresses.entry(worker.address().to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::Registration(format!(
                    "a worker is already registered at {}",
                    worker.address()
                )));
            }
            Entry::Vacant(slot) => {
                if self.workers.contains_key(&worker.id()) {
                    return Err(Error::Registration(format!(
                        "worker {} is already registered",
                        worker.id()
                    )));
                }
                slot.insert(worker.id());
            }
        }

        self.workers.insert(worker.id(), worker.clone());
        family.add_worker(worker.clone());

        info!(
            worker = %worker.label(),
            id = %worker.id(),
            family = %family.id(),
            workers = self.workers.len(),
            "Worker registered"
        );
        Ok(family)
    }

    /// Drop a worker from the registry and from its family.
    pub fn remove_worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        let (_, worker) = self.workers.remove(&id)?;
        self.addresses
            .remove_if(worker.address(), |_, owner| *owner == id);
        if let Some(family) = self.family(worker.family()) {
            family.remove_worker(id);
        }
        Some(worker)
    }

    #[must_use]
    pub fn worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.workers.get(&id).map(|w| w.value().clone())
    }

    #[must_use]
    pub fn worker_by_address(&self, address: &str) -> Option<Arc<Worker>> {
        let id = *self.addresses.get(address)?.value();
        self.worker(id)
    }

    /// Snapshot of every registered worker
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.iter().map(|w| w.value().clone()).collect()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn family_of(&self, id: WorkerId) -> Option<Arc<Family>> {
        let worker = self.worker(id)?;
        self.family(worker.family())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockClientConnector;
    use crate::context::ProxyContext;
    use crate::family::worker::tests::spec;
    use crate::matchmaking::MemoryRankStore;
    use crate::packet::{BusSettings, MemoryTransport, PacketBus};
    use fleetlink_core::config::{FamilyConfig, LoadBalancerConfig};
    use fleetlink_core::Scheduler;
    use std::time::Duration;

    fn registry() -> FamilyRegistry {
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
        let registry = FamilyRegistry::new();
        let config = FamilyConfig {
            id: "lobby".to_string(),
            load_balancer: LoadBalancerConfig::default(),
            matchmaker: None,
            residence: None,
        };
        assert!(registry.add_family(Arc::new(Family::new(&config, ctx).unwrap())));
        registry
    }

    #[test]
    fn test_add_and_remove_worker() {
        let registry = registry();
        let worker = Arc::new(Worker::new(spec("10.0.0.1:25565", 20, 30)));

        let family = registry.add_worker(worker.clone()).unwrap();
        assert_eq!(family.workers().len(), 1);
        assert!(registry.worker_by_address("10.0.0.1:25565").is_some());
        assert_eq!(registry.family_of(worker.id()).unwrap().id().as_str(), "lobby");

        assert!(registry.remove_worker(worker.id()).is_some());
        assert!(registry.worker(worker.id()).is_none());
        assert!(registry.worker_by_address("10.0.0.1:25565").is_none());
        assert!(family.workers().is_empty());
        assert!(registry.remove_worker(worker.id()).is_none());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = registry();
        registry
            .add_worker(Arc::new(Worker::new(spec("10.0.0.1:25565", 20, 30))))
            .unwrap();

        let duplicate = registry.add_worker(Arc::new(Worker::new(spec("10.0.0.1:25565", 20, 30))));
        assert!(matches!(duplicate, Err(Error::Registration(_))));
        assert_eq!(registry.worker_count(), 1);
    }

    #[test]
    fn test_unknown_family_rejected() {
        let registry = registry();
        let mut spec = spec("10.0.0.2:25565", 20, 30);
        spec.family = FamilyId::from("arena");

        let refused = registry.add_worker(Arc::new(Worker::new(spec)));
        assert!(matches!(refused, Err(Error::Registration(_))));
        assert!(registry.worker_by_address("10.0.0.2:25565").is_none());
    }

    #[test]
    fn test_duplicate_family_rejected() {
        let registry = registry();
        let existing = registry.family(&FamilyId::from("lobby")).unwrap();
        assert!(!registry.add_family(existing));
        assert_eq!(registry.families().len(), 1);
    }
}
