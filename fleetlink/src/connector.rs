use async_trait::async_trait;
use tracing::info;

use fleetlink_cluster::{ClientConnector, Result, Worker};
use fleetlink_core::models::PlayerId;

/// Connector for a front-end that moves clients itself
///
/// Placement decisions are logged; the routing layer in front of this
/// process performs the actual transfer.
pub struct LoggingConnector;

#[async_trait]
impl ClientConnector for LoggingConnector {
    async fn connect(&self, player: &PlayerId, worker: &Worker) -> Result<()> {
        info!(
            player = %player,
            worker = %worker.label(),
            address = %worker.address(),
            family = %worker.family(),
            "Client placed"
        );
        Ok(())
    }
}
