//! Assembly of the front-end and worker sides
//!
//! Everything a side needs is built once here and passed down explicitly.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use fleetlink_core::models::FamilyId;
use fleetlink_core::{Config, Scheduler};

use crate::connector::ClientConnector;
use crate::context::ProxyContext;
use crate::error::{Error, Result};
use crate::family::{Family, FamilyRegistry};
use crate::magic_link::{MagicLinkClient, MagicLinkService, WorkerIdentity};
use crate::matchmaking::{MemoryRankStore, RankStore};
use crate::packet::{BusSettings, PacketBus, Transport};

/// A running front-end
pub struct Proxy {
    ctx: ProxyContext,
    transport: Arc<dyn Transport>,
    registry: Arc<FamilyRegistry>,
    magic_link: Arc<MagicLinkService>,
}

impl Proxy {
    /// Build every family, start their balancers and matchmakers, and start
    /// listening for workers. Ranks are kept in memory.
    pub async fn start(
        config: &Config,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn ClientConnector>,
    ) -> Result<Self> {
        Self::start_with_rank_store(config, transport, connector, Arc::new(MemoryRankStore::new()))
            .await
    }

    pub async fn start_with_rank_store(
        config: &Config,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn ClientConnector>,
        rank_store: Arc<dyn RankStore>,
    ) -> Result<Self> {
        let bus = Arc::new(PacketBus::new(
            transport.clone(),
            BusSettings::frontend(
                config.redis.channel.as_str(),
                config.magic_link.message_cache_capacity(),
            ),
        ));
        let ctx = ProxyContext::new(
            Scheduler::new(),
            bus,
            connector,
            rank_store,
            config.magic_link.connect_timeout(),
        );

        let registry = Arc::new(FamilyRegistry::new());
        for family_config in &config.families {
            let family = Arc::new(Family::new(family_config, ctx.clone())?);
            if !registry.add_family(family.clone()) {
                return Err(Error::Configuration(format!(
                    "family `{}` is declared twice",
                    family_config.id
                )));
            }
            family.start();
        }

        let magic_link = Arc::new(MagicLinkService::new(
            ctx.clone(),
            registry.clone(),
            config.magic_link.clone(),
        ));
        magic_link.start().await?;

        info!(
            families = config.families.len(),
            channel = %config.redis.channel,
            "Front-end started"
        );
        Ok(Self {
            ctx,
            transport,
            registry,
            magic_link,
        })
    }

    #[must_use]
    pub const fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<FamilyRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn magic_link(&self) -> &Arc<MagicLinkService> {
        &self.magic_link
    }

    #[must_use]
    pub fn family(&self, id: &str) -> Option<Arc<Family>> {
        self.registry.family(&FamilyId::from(id))
    }

    /// Stop families and matchmakers, then the magic link, the bus, the
    /// transport and finally the scheduler.
    pub async fn shutdown(&self) {
        for family in self.registry.families() {
            family.shutdown();
        }
        self.magic_link.shutdown().await;
        self.ctx.bus.shutdown();
        self.transport.shutdown();
        self.ctx.scheduler.shutdown();
        info!("Front-end stopped");
    }
}

/// A running worker-side magic link
pub struct WorkerNode {
    scheduler: Scheduler,
    bus: Arc<PacketBus>,
    transport: Arc<dyn Transport>,
    client: Arc<MagicLinkClient>,
}

impl WorkerNode {
    pub async fn start(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let worker = &config.worker;
        let scheduler = Scheduler::new();
        let bus = Arc::new(PacketBus::new(
            transport.clone(),
            BusSettings::worker(
                config.redis.channel.as_str(),
                worker.address.as_str(),
                config.magic_link.message_cache_capacity(),
            ),
        ));

        let client = Arc::new(MagicLinkClient::new(
            bus.clone(),
            scheduler.clone(),
            WorkerIdentity::from(worker),
            Duration::from_secs(worker.heartbeat_interval_seconds),
        ));
        client.start().await?;

        Ok(Self {
            scheduler,
            bus,
            transport,
            client,
        })
    }

    #[must_use]
    pub const fn client(&self) -> &Arc<MagicLinkClient> {
        &self.client
    }

    /// Say goodbye to the front-end, then stop the bus, transport and scheduler.
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
        self.bus.shutdown();
        self.transport.shutdown();
        self.scheduler.shutdown();
    }
}
