//! Packet bus: routes packets from a transport to handlers
//!
//! A bus belongs to one side of the magic link. It drops packets of its own
//! origin (pub/sub echoes them back), drops front-end packets addressed to
//! another worker, and dedupes on message id before routing by
//! identification.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec;
use super::dedup::MessageCache;
use super::packet::{Packet, PacketIdentification, PacketOrigin};
use super::transport::Transport;
use crate::error::Result;

#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, packet: Packet) -> Result<()>;
}

/// Adapter turning an async closure into a [`PacketHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> PacketHandler for FnHandler<F>
where
    F: Fn(Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, packet: Packet) -> Result<()> {
        (self.0)(packet).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PacketHandler>
where
    F: Fn(Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Identification -> handler table handed to [`PacketBus::subscribe`]
#[derive(Default)]
pub struct RoutingTable {
    routes: HashMap<PacketIdentification, Arc<dyn PacketHandler>>,
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn route(mut self, identification: PacketIdentification, handler: Arc<dyn PacketHandler>) -> Self {
        self.routes.insert(identification, handler);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub channel: String,
    /// Side of the link this bus speaks for
    pub origin: PacketOrigin,
    /// Worker address; front-end packets for other addresses are dropped
    pub local_address: Option<String>,
    pub cache_capacity: usize,
}

impl BusSettings {
    #[must_use]
    pub fn frontend(channel: impl Into<String>, cache_capacity: usize) -> Self {
        Self {
            channel: channel.into(),
            origin: PacketOrigin::Frontend,
            local_address: None,
            cache_capacity,
        }
    }

    #[must_use]
    pub fn worker(channel: impl Into<String>, address: impl Into<String>, cache_capacity: usize) -> Self {
        Self {
            channel: channel.into(),
            origin: PacketOrigin::Worker,
            local_address: Some(address.into()),
            cache_capacity,
        }
    }
}

/// What happened to one inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handled,
    /// Message id already seen
    Duplicate,
    /// Sent by this side of the link
    OwnOrigin,
    /// Front-end packet for another worker
    NotAddressed,
    /// No handler for the identification
    Unrouted,
    Malformed,
    /// Handler returned an error
    Failed,
}

pub struct PacketBus {
    transport: Arc<dyn Transport>,
    settings: BusSettings,
    cache: MessageCache,
    routes: RwLock<HashMap<PacketIdentification, Arc<dyn PacketHandler>>>,
    listening: AtomicBool,
    cancel_token: CancellationToken,
}

impl PacketBus {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, settings: BusSettings) -> Self {
        let cache = MessageCache::new(settings.cache_capacity);
        Self {
            transport,
            settings,
            cache,
            routes: RwLock::new(HashMap::new()),
            listening: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn origin(&self) -> PacketOrigin {
        self.settings.origin
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.settings.channel
    }

    #[must_use]
    pub const fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub async fn publish(&self, packet: &Packet) -> Result<()> {
        let payload = codec::encode(packet)?;
        self.transport.publish(&self.settings.channel, payload).await?;
        debug!(
            identification = %packet.identification(),
            address = %packet.address(),
            message_id = %packet.message_id(),
            "Packet published"
        );
        Ok(())
    }

    /// Install `table` and start delivering. Routes from later calls are
    /// merged in; the listener is started once.
    pub async fn subscribe(self: &Arc<Self>, table: RoutingTable) -> Result<()> {
        {
            let mut routes = self.routes.write();
            routes.extend(table.routes);
        }

        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut rx = match self.transport.subscribe(&self.settings.channel).await {
            Ok(rx) => rx,
            Err(e) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let bus = Arc::clone(self);
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    () = cancel.cancelled() => break,
                    payload = rx.recv() => payload,
                };
                let Some(payload) = payload else {
                    debug!(channel = %bus.settings.channel, "Transport stream ended");
                    break;
                };
                bus.dispatch(&payload).await;
            }
            bus.listening.store(false, Ordering::SeqCst);
        });

        info!(
            channel = %self.settings.channel,
            origin = ?self.settings.origin,
            "Packet bus listening"
        );
        Ok(())
    }

    /// Decode, filter, dedupe and route one raw payload.
    pub async fn dispatch(&self, raw: &str) -> Delivery {
        let packet = match codec::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping malformed packet");
                return Delivery::Malformed;
            }
        };

        if packet.origin() == self.settings.origin {
            return Delivery::OwnOrigin;
        }
        if let Some(local) = &self.settings.local_address {
            if packet.address() != local {
                return Delivery::NotAddressed;
            }
        }

        if !self.cache.check_and_insert(packet.message_id()) {
            debug!(
                identification = %packet.identification(),
                message_id = %packet.message_id(),
                "Ignoring duplicate packet"
            );
            return Delivery::Duplicate;
        }

        let handler = self.routes.read().get(packet.identification()).cloned();
        let Some(handler) = handler else {
            warn!(identification = %packet.identification(), "No handler for packet");
            return Delivery::Unrouted;
        };

        let identification = packet.identification().clone();
        let address = packet.address().to_string();
        match handler.handle(packet).await {
            Ok(()) => Delivery::Handled,
            Err(e) => {
                warn!(
                    error = %e,
                    identification = %identification,
                    address = %address,
                    "Packet handler failed"
                );
                Delivery::Failed
            }
        }
    }

    /// Stop delivering. Publishing still works until the transport is shut down.
    pub fn shutdown(&self) {
        info!(channel = %self.settings.channel, "Shutting down packet bus");
        self.cancel_token.cancel();
    }
}
