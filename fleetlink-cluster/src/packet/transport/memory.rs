use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Transport, SUBSCRIPTION_BUFFER};
use crate::error::Result;

const CHANNEL_CAPACITY: usize = 1024;

/// In-process transport
///
/// Every subscriber of a channel receives every payload published to it,
/// including its own. Used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryTransport {
    channels: DashMap<String, broadcast::Sender<String>>,
    cancel: CancellationToken,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // No subscribers is not an error for pub/sub
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = self.cancel.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = cancel.cancelled() => return,
                    received = source.recv() => received,
                };
                match received {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "Memory subscriber lagged, payloads dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
