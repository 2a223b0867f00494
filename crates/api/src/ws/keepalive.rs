use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::ws::broadcaster::Broadcaster;

/// Spawn a background task that pings every live connection each `every`.
///
/// Runs until `cancel` fires. Connections whose transport is gone are
/// detached on the next ping.
pub fn start_keepalive(
    broadcaster: Arc<Broadcaster>,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let count = broadcaster.connection_count().await;
                    tracing::debug!(count, "Live connection keep-alive ping");
                    broadcaster.ping_all().await;
                }
            }
        }
    })
}
