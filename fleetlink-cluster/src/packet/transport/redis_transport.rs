use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client as RedisClient};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Transport, SUBSCRIPTION_BUFFER};
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Redis pub/sub transport
///
/// The first connection is made eagerly by [`RedisTransport::connect`] so an
/// unreachable server fails startup. After that, publishes reconnect lazily
/// and subscriptions reconnect in the background with exponential backoff.
pub struct RedisTransport {
    client: RedisClient,
    publisher: Mutex<Option<MultiplexedConnection>>,
    op_timeout: Duration,
    cancel_token: CancellationToken,
}

enum SubscriberExit {
    /// Stream ended after a healthy connection
    Disconnected,
    ConnectFailed(Error),
}

impl RedisTransport {
    /// Open the client and verify the server answers a PING.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(url)
            .map_err(|e| Error::Transport(format!("invalid Redis URL: {e}")))?;

        let mut conn = timeout(connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Transport(format!("timed out connecting to Redis at {url}")))?
            .map_err(|e| Error::Transport(format!("failed to connect to Redis at {url}: {e}")))?;

        let _: String = timeout(connect_timeout, ::redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| Error::Transport("timed out waiting for Redis PING".to_string()))??;

        info!(url = %url, "Connected to Redis");
        Ok(Self {
            client,
            publisher: Mutex::new(Some(conn)),
            op_timeout: Duration::from_secs(REDIS_TIMEOUT_SECS),
            cancel_token: CancellationToken::new(),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection> {
        let existing = self.publisher.lock().clone();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let conn = timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Timeout("reconnecting Redis publisher".to_string()))??;
        info!("Redis publisher reconnected");
        *self.publisher.lock() = Some(conn.clone());
        Ok(conn)
    }

    async fn run_subscriber(
        client: &RedisClient,
        channel: &str,
        tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> SubscriberExit {
        let op_timeout = Duration::from_secs(REDIS_TIMEOUT_SECS);
        let mut pubsub = match timeout(op_timeout, client.get_async_pubsub()).await {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(
                    "getting Redis Pub/Sub connection".to_string(),
                ))
            }
        };

        match timeout(op_timeout, pubsub.subscribe(channel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(format!(
                    "subscribing to {channel}"
                )))
            }
        }

        info!(channel = %channel, "Redis subscriber connected");

        let mut stream = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => return SubscriberExit::Disconnected,
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else {
                return SubscriberExit::Disconnected;
            };

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    continue;
                }
            };

            if tx.send(payload).await.is_err() {
                debug!(channel = %channel, "Subscription receiver dropped");
                cancel.cancel();
                return SubscriberExit::Disconnected;
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher().await?;

        let published: std::result::Result<::redis::RedisResult<i64>, _> =
            timeout(self.op_timeout, conn.publish(channel, payload)).await;
        match published {
            Ok(Ok(receivers)) => {
                debug!(channel = %channel, receivers, "Packet published to Redis");
                Ok(())
            }
            Ok(Err(e)) => {
                // Drop the connection so the next publish reconnects
                *self.publisher.lock() = None;
                Err(e.into())
            }
            Err(_) => {
                *self.publisher.lock() = None;
                Err(Error::Timeout(format!("publishing to {channel}")))
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        let channel = channel.to_string();
        let cancel = self.cancel_token.child_token();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if cancel.is_cancelled() {
                    info!(channel = %channel, "Redis subscriber task cancelled");
                    return;
                }

                match Self::run_subscriber(&client, &channel, &tx, &cancel).await {
                    SubscriberExit::Disconnected => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        error!(
                            channel = %channel,
                            "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            channel = %channel,
                            backoff_secs = backoff_secs,
                            "Redis subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(channel = %channel, "Redis subscriber task cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        Ok(rx)
    }

    fn shutdown(&self) {
        info!("Shutting down Redis transport");
        self.cancel_token.cancel();
    }
}
