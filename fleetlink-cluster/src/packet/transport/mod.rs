//! Pub/sub transports carrying encoded packets

mod memory;
mod redis_transport;

pub use memory::MemoryTransport;
pub use redis_transport::RedisTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Capacity of the per-subscription delivery channel
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// A pub/sub medium shared by the front-end and every worker
///
/// Delivery is at-least-once; the bus dedupes on message id.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Start receiving raw payloads published to `channel`. The stream ends
    /// when the transport shuts down.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    /// Stop background tasks owned by the transport
    fn shutdown(&self) {}
}
