//! Physically moving a client onto a worker
//!
//! The routing front-end owns the client connections; the coordinator only
//! decides where they go. [`ClientConnector`] is the seam between the two.

use async_trait::async_trait;
use std::time::Duration;

use fleetlink_core::models::PlayerId;

use crate::error::{Error, Result};
use crate::family::Worker;

/// A client asking to be placed, with its cap-bypass permissions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub player_id: PlayerId,
    pub bypass_soft_cap: bool,
    pub bypass_hard_cap: bool,
}

impl ClientProfile {
    #[must_use]
    pub fn new(player_id: impl Into<PlayerId>) -> Self {
        Self {
            player_id: player_id.into(),
            bypass_soft_cap: false,
            bypass_hard_cap: false,
        }
    }

    #[must_use]
    pub const fn bypass_soft_cap(mut self) -> Self {
        self.bypass_soft_cap = true;
        self
    }

    #[must_use]
    pub const fn bypass_hard_cap(mut self) -> Self {
        self.bypass_hard_cap = true;
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientConnector: Send + Sync {
    /// Move `player` onto `worker`. Success means the client is connected.
    async fn connect(&self, player: &PlayerId, worker: &Worker) -> Result<()>;
}

/// Run `connector` with an upper bound; running out of time is a
/// [`Error::Timeout`].
pub async fn connect_with_timeout(
    connector: &dyn ClientConnector,
    player: &PlayerId,
    worker: &Worker,
    limit: Duration,
) -> Result<()> {
    tokio::time::timeout(limit, connector.connect(player, worker))
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "connecting {player} to {} took longer than {limit:?}",
                worker.address()
            ))
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::worker::tests::worker;

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_times_out() {
        struct Stalled;

        #[async_trait]
        impl ClientConnector for Stalled {
            async fn connect(&self, _player: &PlayerId, _worker: &Worker) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let target = worker("10.0.0.2:25565", 20, 30);
        let err = connect_with_timeout(&Stalled, &PlayerId::from("p1"), &target, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connector_error_is_passed_through() {
        let mut connector = MockClientConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_, _| Err(Error::Transport("proxy gone".to_string())));

        let target = worker("10.0.0.2:25565", 20, 30);
        let err = connect_with_timeout(&connector, &PlayerId::from("p1"), &target, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
